use std::io;

use crate::core::{
    domain::{ExecutionOutcome, LanguageStrategy, Phase},
    workspace::Workspace,
};

/// Runs the phases of a strategy as child processes inside a workspace.
///
/// Program failures (non-zero exit, timeout, limits) are returned as an
/// [`ExecutionOutcome`]; `Err` is reserved for faults of the host itself.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Executor: std::fmt::Debug + Send + Sync {
    async fn compile(
        &self,
        workspace: &Workspace,
        strategy: &LanguageStrategy,
    ) -> Result<ExecutionOutcome, ExecuteError>;

    async fn run(
        &self,
        workspace: &Workspace,
        strategy: &LanguageStrategy,
        stdin: &str,
    ) -> Result<ExecutionOutcome, ExecuteError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Failed to spawn `{program}` for {phase} phase: {source}")]
    SpawnFailed {
        program: String,
        phase: Phase,
        source: io::Error,
    },
    #[error("I/O error while supervising {phase} phase: {source}")]
    Io { phase: Phase, source: io::Error },
    #[error("Strategy for {language} has no compile step")]
    NotCompiled { language: String },
}
