use std::sync::Arc;

use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::core::{
    domain::{ExecutionRequest, ExecutionResult},
    errors::ServiceError,
    pipeline::{self, composing::compose},
    registry::LanguageRegistry,
    traits::executor::Executor,
    workspace::WorkspaceManager,
};

#[derive(Clone, Copy, Debug)]
pub struct AdmissionLimits {
    pub max_concurrent: usize,
    pub max_payload_bytes: usize,
}

/// Entry point for callers: validates a request and drives it through
/// workspace, engine and composer.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    registry: Arc<LanguageRegistry>,
    workspaces: WorkspaceManager,
    executor: Arc<dyn Executor>,
    admission: Arc<Semaphore>,
    limits: AdmissionLimits,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        workspaces: WorkspaceManager,
        executor: Arc<dyn Executor>,
        limits: AdmissionLimits,
    ) -> Self {
        Self {
            registry,
            workspaces,
            executor,
            admission: Arc::new(Semaphore::new(limits.max_concurrent)),
            limits,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    #[tracing::instrument(skip_all, fields(request = %Uuid::new_v4(), language = %request.language))]
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ServiceError> {
        let strategy = self.registry.resolve(&request.language)?;
        self.check_payload("codeSnippet", &request.source_code)?;
        self.check_payload("stdin", &request.stdin)?;

        let _permit = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| ServiceError::Busy {
                limit: self.limits.max_concurrent,
            })?;

        let workspace = self
            .workspaces
            .acquire(strategy, &request.source_code)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Failed to acquire workspace"))?;

        let report =
            pipeline::execute(self.executor.as_ref(), &workspace, strategy, &request.stdin).await;
        self.workspaces.release(workspace).await;

        let report = report.inspect_err(|e| tracing::error!(error = %e, "Execution failed"))?;
        let result = compose(&report);
        tracing::info!(
            compiled = report.compile.is_some(),
            ran = report.run.is_some(),
            output_bytes = result.output_string.len(),
            error_bytes = result.error_string.len(),
            active = self.workspaces.active_count(),
            "Request completed"
        );

        Ok(result)
    }

    fn check_payload(&self, field: &'static str, payload: &str) -> Result<(), ServiceError> {
        if payload.len() > self.limits.max_payload_bytes {
            return Err(ServiceError::PayloadTooLarge {
                field,
                actual: payload.len(),
                limit: self.limits.max_payload_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::{
        domain::Phase,
        pipeline::tests::{fixture, outcome},
        registry::RegistryError,
        traits::executor::{ExecuteError, MockExecutor},
    };

    const LIMITS: AdmissionLimits = AdmissionLimits {
        max_concurrent: 4,
        max_payload_bytes: 1024,
    };

    fn request(language: &str, source_code: &str, stdin: &str) -> ExecutionRequest {
        ExecutionRequest {
            language: language.to_string(),
            source_code: source_code.to_string(),
            stdin: stdin.to_string(),
        }
    }

    fn orchestrator(
        executor: MockExecutor,
        limits: AdmissionLimits,
    ) -> (tempfile::TempDir, Orchestrator) {
        let (root, registry, manager) = fixture();
        let orchestrator = Orchestrator::new(Arc::new(registry), manager, Arc::new(executor), limits);
        (root, orchestrator)
    }

    fn remaining_entries(root: &tempfile::TempDir) -> usize {
        std::fs::read_dir(root.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_successful_request() {
        let mut executor = MockExecutor::new();
        executor
            .expect_run()
            .withf(|workspace, _, stdin| {
                stdin == "Alice" && workspace.source_path().ends_with("main.py")
            })
            .times(1)
            .returning(|_, _, _| Ok(outcome(Phase::Run, Some(0), "Hello, Alice!\n", "")));
        let (root, registry, manager) = fixture();
        let orchestrator =
            Orchestrator::new(Arc::new(registry), manager.clone(), Arc::new(executor), LIMITS);

        let result = orchestrator
            .execute(request("python", "print(f'Hello, {input()}!')", "Alice"))
            .await
            .unwrap();

        assert_eq!(result.output_string, "Hello, Alice!\n");
        assert_eq!(result.error_string, "");
        assert_eq!(remaining_entries(&root), 0);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_language_creates_no_workspace() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().never();
        executor.expect_run().never();
        let (root, orchestrator) = orchestrator(executor, LIMITS);

        let result = orchestrator.execute(request("cobol", "DISPLAY 'HI'", "")).await;

        assert!(matches!(
            result,
            Err(ServiceError::UnsupportedLanguage(RegistryError::UnsupportedLanguage { ref identifier, .. }))
            if identifier == "cobol"
        ));
        assert!(result.unwrap_err().is_client_error());
        assert_eq!(remaining_entries(&root), 0);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let mut executor = MockExecutor::new();
        executor.expect_run().never();
        let (root, orchestrator) = orchestrator(executor, LIMITS);

        let result = orchestrator
            .execute(request("bash", "cat", &"x".repeat(2048)))
            .await;

        assert!(matches!(
            result,
            Err(ServiceError::PayloadTooLarge { field: "stdin", actual: 2048, limit: 1024 })
        ));
        assert_eq!(remaining_entries(&root), 0);
    }

    #[tokio::test]
    async fn test_compile_failure_is_a_result() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().times(1).returning(|workspace, _| {
            assert!(workspace.source_path().exists());
            Ok(outcome(Phase::Compile, Some(1), "", "error: expected ';'"))
        });
        executor.expect_run().never();
        let (root, orchestrator) = orchestrator(executor, LIMITS);

        let result = orchestrator
            .execute(request("c", "int main() { return 0 }", ""))
            .await
            .unwrap();

        assert_eq!(result.output_string, "");
        assert_eq!(result.error_string, "error: expected ';'");
        assert_eq!(remaining_entries(&root), 0);
    }

    #[tokio::test]
    async fn test_infrastructure_fault_releases_workspace() {
        let mut executor = MockExecutor::new();
        executor.expect_run().times(1).returning(|_, _, _| {
            Err(ExecuteError::SpawnFailed {
                program: "perl".to_string(),
                phase: Phase::Run,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });
        let (root, orchestrator) = orchestrator(executor, LIMITS);

        let result = orchestrator.execute(request("perl", "print 1;", "")).await;

        let err = result.unwrap_err();
        assert!(matches!(err, ServiceError::Execution(_)));
        assert!(!err.is_client_error());
        assert!(!err.is_retryable());
        assert_eq!(remaining_entries(&root), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_excess_requests_are_rejected_as_busy() {
        let mut executor = MockExecutor::new();
        executor.expect_run().returning(|_, _, _| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(outcome(Phase::Run, Some(0), "done", ""))
        });
        let (_root, orchestrator) = orchestrator(
            executor,
            AdmissionLimits {
                max_concurrent: 1,
                max_payload_bytes: 1024,
            },
        );

        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.execute(request("bash", "echo", "")).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = orchestrator.execute(request("bash", "echo", "")).await;

        let err = second.unwrap_err();
        assert!(matches!(err, ServiceError::Busy { limit: 1 }));
        assert!(err.is_retryable());
        assert_eq!(first.await.unwrap().unwrap().output_string, "done");
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_use_distinct_workspaces() {
        let mut executor = MockExecutor::new();
        executor.expect_run().times(2).returning(|workspace, _, _| {
            Ok(outcome(
                Phase::Run,
                Some(0),
                &workspace.dir().display().to_string(),
                "",
            ))
        });
        let (root, orchestrator) = orchestrator(executor, LIMITS);

        let (a, b) = tokio::join!(
            orchestrator.execute(request("lua", "print(1)", "")),
            orchestrator.execute(request("lua", "print(1)", ""))
        );

        assert_ne!(a.unwrap().output_string, b.unwrap().output_string);
        assert_eq!(remaining_entries(&root), 0);
    }
}
