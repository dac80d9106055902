use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::{
    core::{
        domain::{ExecutionRequest, ExecutionResult, LanguageStrategy},
        errors::ServiceError,
    },
    http::models::{
        ErrorBody, ErrorDetail, LanguageInfo, RunCodeRequest, RunCodeResponse, RunRequest,
        RunResponse,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

impl From<ConversionError> for ServiceError {
    fn from(err: ConversionError) -> Self {
        ServiceError::MalformedRequest {
            reason: err.to_string(),
        }
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, ConversionError> {
    value
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ConversionError::MissingField {
            field: field.to_string(),
        })
}

impl TryFrom<RunCodeRequest> for ExecutionRequest {
    type Error = ConversionError;

    fn try_from(req: RunCodeRequest) -> Result<Self, ConversionError> {
        Ok(Self {
            language: required(req.language, "language")?,
            source_code: required(req.code_snippet, "codeSnippet")?,
            stdin: req.stdin.unwrap_or_default(),
        })
    }
}

impl TryFrom<RunRequest> for ExecutionRequest {
    type Error = ConversionError;

    fn try_from(req: RunRequest) -> Result<Self, ConversionError> {
        Ok(Self {
            language: required(req.language, "language")?,
            source_code: required(req.code, "code")?,
            stdin: req.stdin.unwrap_or_default(),
        })
    }
}

impl From<ExecutionResult> for RunCodeResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            output_string: result.output_string,
            error_string: result.error_string,
        }
    }
}

impl From<ExecutionResult> for RunResponse {
    fn from(result: ExecutionResult) -> Self {
        let output = if result.error_string.is_empty() {
            result.output_string
        } else {
            format!("Error: {}", result.error_string)
        };
        Self { output }
    }
}

impl From<&LanguageStrategy> for LanguageInfo {
    fn from(strategy: &LanguageStrategy) -> Self {
        Self {
            id: strategy.language.id().to_string(),
            display_name: strategy.language.display_name().to_string(),
            compiled: strategy.is_compiled(),
        }
    }
}

impl ServiceError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ServiceError::UnsupportedLanguage(_) => {
                (StatusCode::BAD_REQUEST, "unsupported_language")
            }
            ServiceError::MalformedRequest { .. } => (StatusCode::BAD_REQUEST, "malformed_request"),
            ServiceError::PayloadTooLarge { .. } | ServiceError::BodyTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large")
            }
            ServiceError::Busy { .. } => (StatusCode::SERVICE_UNAVAILABLE, "service_busy"),
            ServiceError::Workspace(_) | ServiceError::Execution(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if self.is_client_error() {
            tracing::info!(code, error = %self, "Request rejected");
        }
        // host paths and toolchain details stay in the logs
        let message = if status.is_server_error() && !self.is_retryable() {
            "internal error while executing the request".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
                retryable: self.is_retryable(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        if self.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
