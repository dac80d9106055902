use crate::core::{
    registry::RegistryError, traits::executor::ExecuteError, workspace::WorkspaceError,
};

/// Failures of the service itself, as opposed to failures of the submitted
/// program (which are reported inside a successful result).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    UnsupportedLanguage(#[from] RegistryError),
    #[error("Malformed request: {reason}")]
    MalformedRequest { reason: String },
    #[error("Payload too large: {field} is {actual} bytes, limit is {limit}")]
    PayloadTooLarge {
        field: &'static str,
        actual: usize,
        limit: usize,
    },
    #[error("Request body too large: {reason}")]
    BodyTooLarge { reason: String },
    #[error("Service busy: {limit} executions already in progress")]
    Busy { limit: usize },
    #[error("Workspace failure: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("Execution failure: {0}")]
    Execution(#[from] ExecuteError),
}

impl ServiceError {
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServiceError::UnsupportedLanguage(_)
                | ServiceError::MalformedRequest { .. }
                | ServiceError::PayloadTooLarge { .. }
                | ServiceError::BodyTooLarge { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Busy { .. })
    }
}
