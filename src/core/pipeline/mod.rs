pub mod compiling;
pub mod composing;
pub mod running;

use crate::core::{
    domain::{EngineReport, LanguageStrategy},
    traits::executor::{ExecuteError, Executor},
    workspace::Workspace,
};

use self::{
    compiling::{CompileStage, compile_stage},
    running::run_stage,
};

/// Compiles (when the strategy has a compile step) and then runs the
/// workspace's program. A failed compilation ends the pipeline without a
/// run outcome.
pub async fn execute(
    executor: &dyn Executor,
    workspace: &Workspace,
    strategy: &LanguageStrategy,
    stdin: &str,
) -> Result<EngineReport, ExecuteError> {
    let compile = match compile_stage(executor, workspace, strategy).await? {
        CompileStage::Skipped => None,
        CompileStage::Compiled(outcome) => Some(outcome),
        CompileStage::Failed(outcome) => {
            return Ok(EngineReport {
                compile: Some(outcome),
                run: None,
            });
        }
    };

    let run = run_stage(executor, workspace, strategy, stdin).await?;

    Ok(EngineReport {
        compile,
        run: Some(run),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::core::{
        domain::{ExecutionOutcome, Phase},
        registry::{LanguageRegistry, RegistryDefaults},
        traits::executor::MockExecutor,
        workspace::WorkspaceManager,
    };

    pub(crate) fn fixture() -> (TempDir, LanguageRegistry, WorkspaceManager) {
        let root = tempfile::tempdir().unwrap();
        let registry = LanguageRegistry::new(&RegistryDefaults {
            compile_timeout: Duration::from_secs(10),
            run_timeout: Duration::from_secs(5),
            memory_bytes: Some(256 * 1024 * 1024),
            output_bytes: 64 * 1024,
        });
        let manager = WorkspaceManager::new(root.path());
        (root, registry, manager)
    }

    pub(crate) fn outcome(
        phase: Phase,
        exit_code: Option<i32>,
        stdout: &str,
        stderr: &str,
    ) -> ExecutionOutcome {
        ExecutionOutcome {
            phase,
            exit_code,
            signal: None,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            timed_out: false,
            memory_exceeded: false,
            truncated: false,
            orphaned: false,
            duration: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_compiled_language_runs_after_compilation() {
        let (_root, registry, manager) = fixture();
        let strategy = registry.resolve("cpp").unwrap();
        let workspace = manager.acquire(strategy, "int main() {}").await.unwrap();

        let mut executor = MockExecutor::new();
        let mut seq = mockall::Sequence::new();
        executor
            .expect_compile()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(outcome(Phase::Compile, Some(0), "", "")));
        executor
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(outcome(Phase::Run, Some(0), "Hello, Alice!\n", "")));

        let report = execute(&executor, &workspace, strategy, "Alice").await.unwrap();

        assert!(report.compile.is_some());
        assert_eq!(report.run.unwrap().stdout, "Hello, Alice!\n");
    }

    #[tokio::test]
    async fn test_failed_compilation_skips_run() {
        let (_root, registry, manager) = fixture();
        let strategy = registry.resolve("java").unwrap();
        let workspace = manager.acquire(strategy, "class Main {").await.unwrap();

        let mut executor = MockExecutor::new();
        executor
            .expect_compile()
            .times(1)
            .returning(|_, _| Ok(outcome(Phase::Compile, Some(1), "", "reached end of file")));
        executor.expect_run().never();

        let report = execute(&executor, &workspace, strategy, "").await.unwrap();

        assert!(report.run.is_none());
        assert_eq!(report.compile.unwrap().stderr, "reached end of file");
    }

    #[tokio::test]
    async fn test_interpreted_language_runs_directly() {
        let (_root, registry, manager) = fixture();
        let strategy = registry.resolve("lua").unwrap();
        let workspace = manager.acquire(strategy, "print(1 / 0)").await.unwrap();

        let mut executor = MockExecutor::new();
        executor.expect_compile().never();
        executor
            .expect_run()
            .times(1)
            .returning(|_, _, _| Ok(outcome(Phase::Run, Some(0), "inf\n", "")));

        let report = execute(&executor, &workspace, strategy, "").await.unwrap();

        assert!(report.compile.is_none());
        assert_eq!(report.run.unwrap().stdout, "inf\n");
    }

    #[tokio::test]
    async fn test_run_fault_propagates() {
        let (_root, registry, manager) = fixture();
        let strategy = registry.resolve("php").unwrap();
        let workspace = manager.acquire(strategy, "<?php echo 1;").await.unwrap();

        let mut executor = MockExecutor::new();
        executor.expect_run().times(1).returning(|_, _, _| {
            Err(ExecuteError::SpawnFailed {
                program: "php".to_string(),
                phase: Phase::Run,
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            })
        });

        let result = execute(&executor, &workspace, strategy, "").await;

        assert!(matches!(result, Err(ExecuteError::SpawnFailed { .. })));
    }
}
