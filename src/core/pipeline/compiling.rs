use crate::core::{
    domain::{ExecutionOutcome, LanguageStrategy},
    traits::executor::{ExecuteError, Executor},
    workspace::Workspace,
};

#[derive(Debug)]
pub enum CompileStage {
    /// The strategy is interpreted.
    Skipped,
    Compiled(ExecutionOutcome),
    Failed(ExecutionOutcome),
}

#[tracing::instrument(skip_all, fields(workspace = %workspace.id(), language = %strategy.language))]
pub async fn compile_stage(
    executor: &dyn Executor,
    workspace: &Workspace,
    strategy: &LanguageStrategy,
) -> Result<CompileStage, ExecuteError> {
    if !strategy.is_compiled() {
        return Ok(CompileStage::Skipped);
    }

    tracing::debug!("Start compiling");
    let outcome = executor.compile(workspace, strategy).await?;
    tracing::debug!(
        exit_code = ?outcome.exit_code,
        timed_out = outcome.timed_out,
        duration_ms = outcome.duration.as_millis() as u64,
        "Compilation finished"
    );

    if outcome.succeeded() {
        Ok(CompileStage::Compiled(outcome))
    } else {
        Ok(CompileStage::Failed(outcome))
    }
}
