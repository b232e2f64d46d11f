// HTTP route handlers for the Proctor queue

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use proctor_common::types::{JobRequest, JobState, Language, Priority, TestCase};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::SubmitError;
use crate::telemetry;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// Parsed by hand so an unknown language is a 400, not a body error
    pub language: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(alias = "sourceCode")]
    pub source_code: String,
    #[serde(alias = "testCases")]
    pub test_cases: Vec<TestCaseInput>,
    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TestCaseInput {
    pub input: String,
    #[serde(alias = "expectedOutput")]
    pub expected_output: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    10
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub state: JobState,
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            SubmitError::UnsupportedLanguage(_) | SubmitError::InvalidRequest(_) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
            SubmitError::SecurityViolation { violations } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({
                    "error": "Security violation",
                    "violations": violations,
                })),
            )
                .into_response(),
            SubmitError::QueueFull { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
        }
    }
}

/// POST /execute - Scan and admit a job
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), SubmitError> {
    let language: Language = payload
        .language
        .parse()
        .map_err(|_| SubmitError::InvalidRequest(format!("unknown language '{}'", payload.language)))?;

    // Test case ids are their 1-based position in the request
    let test_cases = payload
        .test_cases
        .into_iter()
        .enumerate()
        .map(|(idx, tc)| TestCase {
            id: (idx + 1) as u32,
            input: tc.input,
            expected_output: tc.expected_output,
            weight: tc.weight,
        })
        .collect();

    let job = JobRequest {
        id: Uuid::new_v4(),
        language,
        priority: payload.priority,
        source_code: payload.source_code,
        test_cases,
        timeout_ms: payload.timeout_ms,
    };

    // The handle is dropped; the result is collected through GET /job/:job_id
    let handle = state.queue.submit(job)?;

    Ok((
        StatusCode::CREATED,
        Json(JobAccepted {
            job_id: handle.id,
            state: handle.state,
        }),
    ))
}

/// GET /job/:job_id - In-flight state or stored result
pub async fn get_job_result(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let Ok(job_uuid) = Uuid::parse_str(&job_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Invalid job ID format" })),
        )
            .into_response();
    };

    if let Some(job_state) = state.queue.job_state(&job_uuid) {
        return (
            StatusCode::ACCEPTED,
            Json(JobAccepted {
                job_id: job_uuid,
                state: job_state,
            }),
        )
            .into_response();
    }

    match state.queue.result(&job_uuid).await {
        Ok(Some(result)) => {
            info!(job_id = %job_uuid, status = ?result.overall_status, "Job result retrieved");
            (StatusCode::OK, Json(result)).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Job not found" })),
        )
            .into_response(),
        Err(e) => {
            error!(job_id = %job_uuid, error = %e, "Failed to fetch job result");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": format!("Failed to query job result: {}", e)
                })),
            )
                .into_response()
        }
    }
}

/// GET /admin/queue/status
pub async fn queue_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.queue.status())
}

/// GET /admin/queue/metrics
pub async fn queue_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.queue.metrics())
}

/// POST /admin/queue/metrics/reset
pub async fn reset_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.queue.reset_metrics();
    StatusCode::NO_CONTENT
}

/// GET /status - Liveness
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus exposition
pub async fn prometheus_metrics() -> Response {
    match telemetry::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{LanguageConfig, LanguageConfigManager};
    use crate::engine::Sandbox;
    use crate::evaluator::TestExecutionOutput;
    use crate::queue::QueueService;
    use crate::results::MemoryResultStore;
    use crate::{routes, telemetry, AppState};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use proctor_common::config::QueueConfig;
    use proctor_common::types::{JobRequest, Language};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    /// Echoes test inputs; waits on the gate first when one is set
    struct EchoSandbox {
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl Sandbox for EchoSandbox {
        async fn run(
            &self,
            job: &JobRequest,
            _language: &LanguageConfig,
            _test_timeout: Duration,
        ) -> anyhow::Result<Vec<TestExecutionOutput>> {
            if let Some(gate) = &self.gate {
                gate.acquire().await?.forget();
            }
            Ok(job
                .test_cases
                .iter()
                .map(|tc| TestExecutionOutput {
                    test_id: tc.id,
                    stdout: tc.input.clone(),
                    ..Default::default()
                })
                .collect())
        }
    }

    fn app_with(config: QueueConfig, gate: Option<Arc<Semaphore>>) -> Router {
        let languages = LanguageConfigManager::from_configs(
            Language::ALL.iter().map(|l| LanguageConfig::builtin(*l)).collect(),
        )
        .unwrap();
        let queue = QueueService::new(
            &config,
            languages,
            Arc::new(EchoSandbox { gate }),
            Arc::new(MemoryResultStore::new(100)),
        )
        .unwrap();

        Router::new()
            .merge(routes::routes())
            .with_state(Arc::new(AppState { queue }))
    }

    fn app() -> Router {
        app_with(QueueConfig::default(), None)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn submission(language: &str, source: &str) -> Value {
        json!({
            "language": language,
            "priority": "high",
            "source_code": source,
            "test_cases": [
                { "input": "5", "expected_output": "5", "weight": 3 },
                { "input": "6", "expected_output": "7" }
            ]
        })
    }

    #[tokio::test]
    async fn test_submit_and_fetch_result() {
        let app = app();

        let response = app
            .clone()
            .oneshot(post_json("/execute", submission("python", "print(input())")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let accepted = body_json(response).await;
        assert_eq!(accepted["state"], "running");
        let job_id = accepted["jobId"].as_str().unwrap().to_string();

        let mut result = None;
        for _ in 0..100 {
            let response = app
                .clone()
                .oneshot(get(&format!("/job/{}", job_id)))
                .await
                .unwrap();
            if response.status() == StatusCode::OK {
                result = Some(body_json(response).await);
                break;
            }
            assert_eq!(response.status(), StatusCode::ACCEPTED);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let result = result.expect("job never finished");
        assert_eq!(result["overallStatus"], "completed");
        assert_eq!(result["score"], 3);
        assert_eq!(result["maxScore"], 13);
    }

    #[tokio::test]
    async fn test_security_violation_is_422() {
        let response = app()
            .oneshot(post_json("/execute", submission("python", "import subprocess")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = body_json(response).await;
        assert_eq!(body["violations"], json!(["process spawning"]));
    }

    #[tokio::test]
    async fn test_invalid_submissions_are_400() {
        let app = app();

        let response = app
            .clone()
            .oneshot(post_json("/execute", submission("cobol", "DISPLAY 'HI'")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut empty = submission("python", "print(1)");
        empty["test_cases"] = json!([]);
        let response = app.oneshot(post_json("/execute", empty)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("test case"));
    }

    #[tokio::test]
    async fn test_full_queue_is_503() {
        let config = QueueConfig {
            max_concurrency: 1,
            max_queue_depth: 0,
            ..QueueConfig::default()
        };
        let app = app_with(config, Some(Arc::new(Semaphore::new(0))));

        let first = app
            .clone()
            .oneshot(post_json("/execute", submission("python", "print(input())")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .clone()
            .oneshot(post_json("/execute", submission("python", "print(input())")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);

        let status = body_json(app.oneshot(get("/admin/queue/status")).await.unwrap()).await;
        assert_eq!(status["running"], 1);
        assert_eq!(status["queueDepth"], 0);
    }

    #[tokio::test]
    async fn test_job_lookup_errors() {
        let app = app();

        let response = app.clone().oneshot(get("/job/not-a-uuid")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(get(&format!("/job/{}", uuid::Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_endpoints() {
        let app = app();

        let _ = app
            .clone()
            .oneshot(post_json("/execute", submission("rust", "unsafe { }")))
            .await
            .unwrap();

        let status = body_json(app.clone().oneshot(get("/admin/queue/status")).await.unwrap()).await;
        assert_eq!(status["running"], 0);
        assert_eq!(status["queueDepth"], 0);
        assert_eq!(status["healthy"], true);

        let metrics = body_json(app.clone().oneshot(get("/admin/queue/metrics")).await.unwrap()).await;
        assert_eq!(metrics["security"]["totalScans"], 1);
        assert_eq!(metrics["security"]["rejectionRate"], "100.00%");
        assert_eq!(metrics["lastJobProcessedAt"], Value::Null);
        assert!(metrics["serviceStartedAt"].is_string());

        let reset = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/queue/metrics/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(reset.status(), StatusCode::NO_CONTENT);

        let metrics = body_json(app.oneshot(get("/admin/queue/metrics")).await.unwrap()).await;
        assert_eq!(metrics["security"]["totalScans"], 0);
        assert_eq!(metrics["security"]["rejectionRate"], "0.00%");
        assert_eq!(metrics["security"]["recentViolations"], json!([]));
    }

    #[tokio::test]
    async fn test_liveness_and_prometheus() {
        telemetry::register();
        let app = app();

        let response = app.clone().oneshot(get("/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let _ = app
            .clone()
            .oneshot(post_json("/execute", submission("python", "import socket")))
            .await
            .unwrap();

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("proctor_security_rejections_total"));
    }
}
