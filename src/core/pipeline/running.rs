use crate::core::{
    domain::{ExecutionOutcome, LanguageStrategy},
    traits::executor::{ExecuteError, Executor},
    workspace::Workspace,
};

#[tracing::instrument(skip_all, fields(workspace = %workspace.id(), language = %strategy.language))]
pub async fn run_stage(
    executor: &dyn Executor,
    workspace: &Workspace,
    strategy: &LanguageStrategy,
    stdin: &str,
) -> Result<ExecutionOutcome, ExecuteError> {
    tracing::debug!(stdin_bytes = stdin.len(), "Start execution");
    let outcome = executor.run(workspace, strategy, stdin).await?;
    tracing::debug!(
        exit_code = ?outcome.exit_code,
        signal = ?outcome.signal,
        timed_out = outcome.timed_out,
        memory_exceeded = outcome.memory_exceeded,
        truncated = outcome.truncated,
        duration_ms = outcome.duration.as_millis() as u64,
        "Execution finished"
    );

    Ok(outcome)
}
