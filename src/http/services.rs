use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{
    core::{domain::ExecutionRequest, errors::ServiceError, orchestrator::Orchestrator},
    http::models::{LanguageInfo, RunCodeRequest, RunCodeResponse, RunRequest, RunResponse},
};

pub fn router(orchestrator: Orchestrator, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/api/code-templates/run", post(run_code))
        .route("/api/run", post(run))
        .route("/api/languages", get(languages))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

async fn run_code(
    State(orchestrator): State<Orchestrator>,
    payload: Result<Json<RunCodeRequest>, JsonRejection>,
) -> Result<Json<RunCodeResponse>, ServiceError> {
    let Json(payload) = payload.map_err(rejection_error)?;
    let request = ExecutionRequest::try_from(payload)?;

    let result = orchestrator.execute(request).await?;
    Ok(Json(result.into()))
}

async fn run(
    State(orchestrator): State<Orchestrator>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<RunResponse>, ServiceError> {
    let Json(payload) = payload.map_err(rejection_error)?;
    let request = ExecutionRequest::try_from(payload)?;

    let result = orchestrator.execute(request).await?;
    Ok(Json(result.into()))
}

async fn languages(State(orchestrator): State<Orchestrator>) -> Json<Vec<LanguageInfo>> {
    Json(
        orchestrator
            .registry()
            .strategies()
            .map(LanguageInfo::from)
            .collect(),
    )
}

async fn health() -> &'static str {
    "ok"
}

fn rejection_error(rejection: JsonRejection) -> ServiceError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ServiceError::BodyTooLarge {
            reason: rejection.body_text(),
        };
    }
    ServiceError::MalformedRequest {
        reason: rejection.body_text(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, header},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::body_limit_for,
        core::{
            domain::Phase,
            orchestrator::AdmissionLimits,
            pipeline::tests::{fixture, outcome},
            traits::executor::MockExecutor,
        },
        http::models::ErrorBody,
    };

    fn app(executor: MockExecutor) -> (tempfile::TempDir, Router) {
        let (root, registry, manager) = fixture();
        let orchestrator = Orchestrator::new(
            Arc::new(registry),
            manager,
            Arc::new(executor),
            AdmissionLimits {
                max_concurrent: 4,
                max_payload_bytes: 256,
            },
        );
        (root, router(orchestrator, body_limit_for(256)))
    }

    fn post_json(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_run_code_success() {
        let mut executor = MockExecutor::new();
        executor
            .expect_run()
            .withf(|_, strategy, stdin| strategy.language.id() == "ruby" && stdin == "Alice")
            .times(1)
            .returning(|_, _, _| Ok(outcome(Phase::Run, Some(0), "Hello, Alice!\n", "")));
        let (_root, service) = app(executor);

        let body = serde_json::json!({
            "language": "ruby",
            "codeSnippet": "name = gets.chomp\nputs \"Hello, #{name}!\"",
            "stdin": "Alice",
        });
        let response = service
            .oneshot(post_json("/api/code-templates/run", body.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: RunCodeResponse = read_json(response).await;
        assert_eq!(
            body,
            RunCodeResponse {
                output_string: "Hello, Alice!\n".to_string(),
                error_string: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn test_program_failure_is_still_success_status() {
        let mut executor = MockExecutor::new();
        executor.expect_run().times(1).returning(|_, _, _| {
            Ok(outcome(
                Phase::Run,
                Some(1),
                "",
                "ZeroDivisionError: division by zero\n",
            ))
        });
        let (_root, service) = app(executor);

        let body = serde_json::json!({ "language": "python", "codeSnippet": "print(1 / 0)" });
        let response = service
            .oneshot(post_json("/api/code-templates/run", body.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: RunCodeResponse = read_json(response).await;
        assert_eq!(body.output_string, "");
        assert_eq!(body.error_string, "ZeroDivisionError: division by zero\n");
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let mut executor = MockExecutor::new();
        executor.expect_run().never();
        let (_root, service) = app(executor);

        let body = serde_json::json!({ "language": "cobol", "codeSnippet": "DISPLAY 'HI'." });
        let response = service
            .oneshot(post_json("/api/code-templates/run", body.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error.code, "unsupported_language");
        assert!(body.error.message.contains("cobol"));
        assert!(!body.error.retryable);
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        for body in [
            "{not json".to_string(),
            serde_json::json!({ "language": "python" }).to_string(),
            serde_json::json!({ "codeSnippet": "print(1)" }).to_string(),
        ] {
            let (_root, service) = app(MockExecutor::new());

            let response = service
                .oneshot(post_json("/api/code-templates/run", body))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body: ErrorBody = read_json(response).await;
            assert_eq!(body.error.code, "malformed_request");
        }
    }

    #[tokio::test]
    async fn test_oversized_payloads() {
        let (_root, service) = app(MockExecutor::new());
        let body = serde_json::json!({ "language": "bash", "codeSnippet": "x".repeat(300) });
        let response = service
            .oneshot(post_json("/api/code-templates/run", body.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let (_root, service) = app(MockExecutor::new());
        let body = serde_json::json!({ "language": "bash", "codeSnippet": "x".repeat(10_000) });
        let response = service
            .oneshot(post_json("/api/code-templates/run", body.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error.code, "payload_too_large");
    }

    #[tokio::test]
    async fn test_escaped_payloads_within_limits_are_accepted() {
        let mut executor = MockExecutor::new();
        executor
            .expect_run()
            .withf(|_, _, stdin| stdin.len() == 256)
            .times(1)
            .returning(|_, _, _| Ok(outcome(Phase::Run, Some(0), "ok\n", "")));
        let (_root, service) = app(executor);
        let body = serde_json::json!({
            "language": "bash",
            "codeSnippet": "\u{1}".repeat(256),
            "stdin": "\t".repeat(256),
        });

        let response = service
            .oneshot(post_json("/api/code-templates/run", body.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: RunCodeResponse = read_json(response).await;
        assert_eq!(body.output_string, "ok\n");
    }

    #[tokio::test]
    async fn test_infrastructure_fault_is_internal_error() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().times(1).returning(|_, _| {
            Err(crate::core::traits::executor::ExecuteError::SpawnFailed {
                program: "g++".to_string(),
                phase: Phase::Compile,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });
        let (_root, service) = app(executor);

        let body = serde_json::json!({ "language": "cpp", "codeSnippet": "int main() {}" });
        let response = service
            .oneshot(post_json("/api/code-templates/run", body.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error.code, "internal_error");
        assert!(!body.error.message.contains("g++"));
    }

    #[tokio::test]
    async fn test_simple_run_endpoint() {
        let mut executor = MockExecutor::new();
        executor
            .expect_run()
            .times(1)
            .returning(|_, _, _| Ok(outcome(Phase::Run, Some(0), "Infinity\n", "")));
        let (_root, service) = app(executor);

        let body = serde_json::json!({ "language": "JavaScript", "code": "console.log(1 / 0);" });
        let response = service
            .oneshot(post_json("/api/run", body.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: RunResponse = read_json(response).await;
        assert_eq!(body.output, "Infinity\n");
    }

    #[tokio::test]
    async fn test_languages_listing() {
        let (_root, service) = app(MockExecutor::new());

        let response = service
            .oneshot(
                Request::builder()
                    .uri("/api/languages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let languages: Vec<LanguageInfo> = read_json(response).await;
        assert_eq!(languages.len(), 10);
        assert_eq!(
            languages[3],
            LanguageInfo {
                id: "cpp".to_string(),
                display_name: "C++".to_string(),
                compiled: true,
            }
        );
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let (_root, service) = app(MockExecutor::new());

        let response = service
            .oneshot(
                Request::builder()
                    .uri("/api/code-templates/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
