/// Job Executor - High-Level Orchestration
///
/// Coordinates the sandbox and the evaluator for one admitted job and turns
/// whatever happens into exactly one terminal outcome:
/// - sandbox returned outputs → Completed (scored by the evaluator)
/// - job wall-clock limit hit → TimedOut (execution aborted)
/// - sandbox error or panic → Errored
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (engine's job)
/// - How scoring works (evaluator's job)
/// - How jobs are ordered (scheduler's job)

use crate::config::LanguageConfig;
use crate::engine::Sandbox;
use crate::evaluator;
use crate::metrics::Outcome;
use proctor_common::types::{ExecutionResult, JobRequest, JobStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Per-test limit: the caller may ask for less than the language allows,
/// never more.
pub fn effective_test_timeout(job: &JobRequest, language: &LanguageConfig) -> Duration {
    let ms = job
        .timeout_ms
        .map(|requested| requested.clamp(1, language.test_timeout_ms))
        .unwrap_or(language.test_timeout_ms);
    Duration::from_millis(ms)
}

/// Run a job to a terminal outcome.
///
/// The sandbox runs on its own task so a panic in it is contained, and so
/// that on timeout it can be aborted: aborting drops the sandbox future and
/// with it any container it holds.
pub async fn execute(
    sandbox: Arc<dyn Sandbox>,
    job: Arc<JobRequest>,
    language: LanguageConfig,
) -> (Outcome, ExecutionResult) {
    let test_timeout = effective_test_timeout(&job, &language);
    let job_timeout = Duration::from_millis(language.job_timeout_ms);

    let mut task = tokio::spawn({
        let job = Arc::clone(&job);
        async move { sandbox.run(&job, &language, test_timeout).await }
    });

    match tokio::time::timeout(job_timeout, &mut task).await {
        Ok(Ok(Ok(outputs))) => {
            for output in &outputs {
                if output.compilation_failed {
                    warn!(job_id = %job.id, test_id = output.test_id, "Compilation failed; test cannot pass");
                    break;
                }
            }
            (Outcome::Completed, evaluator::evaluate(&job, outputs))
        }
        Ok(Ok(Err(e))) => {
            error!(job_id = %job.id, error = %format!("{:#}", e), "Sandbox execution failed");
            (
                Outcome::Errored,
                ExecutionResult::aborted(&job, JobStatus::Errored, format!("{:#}", e)),
            )
        }
        Ok(Err(join_error)) => {
            error!(job_id = %job.id, error = %join_error, "Execution task panicked");
            (
                Outcome::Errored,
                ExecutionResult::aborted(&job, JobStatus::Errored, "execution fault"),
            )
        }
        Err(_) => {
            task.abort();
            warn!(
                job_id = %job.id,
                timeout_ms = job_timeout.as_millis() as u64,
                "Job exceeded wall-clock limit, execution aborted"
            );
            (
                Outcome::TimedOut,
                ExecutionResult::aborted(
                    &job,
                    JobStatus::TimedOut,
                    format!("exceeded {}ms wall-clock limit", job_timeout.as_millis()),
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::TestExecutionOutput;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use proctor_common::types::{Language, Priority, TestCase};
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    struct EchoSandbox;

    #[async_trait]
    impl Sandbox for EchoSandbox {
        async fn run(
            &self,
            job: &JobRequest,
            _language: &LanguageConfig,
            _test_timeout: Duration,
        ) -> Result<Vec<TestExecutionOutput>> {
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

    struct FailingSandbox;

    #[async_trait]
    impl Sandbox for FailingSandbox {
        async fn run(&self, _: &JobRequest, _: &LanguageConfig, _: Duration) -> Result<Vec<TestExecutionOutput>> {
            bail!("docker daemon unreachable")
        }
    }

    struct PanickingSandbox;

    #[async_trait]
    impl Sandbox for PanickingSandbox {
        async fn run(&self, _: &JobRequest, _: &LanguageConfig, _: Duration) -> Result<Vec<TestExecutionOutput>> {
            panic!("sandbox bug")
        }
    }

    /// Sleeps far beyond any limit; records whether it was dropped early
    struct HangingSandbox {
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Sandbox for HangingSandbox {
        async fn run(&self, _: &JobRequest, _: &LanguageConfig, _: Duration) -> Result<Vec<TestExecutionOutput>> {
            let _flag = DropFlag(Arc::clone(&self.dropped));
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    fn job() -> Arc<JobRequest> {
        Arc::new(JobRequest {
            id: Uuid::new_v4(),
            language: Language::Python,
            priority: Priority::Normal,
            source_code: "print(input())".to_string(),
            test_cases: vec![TestCase {
                id: 1,
                input: "42".to_string(),
                expected_output: "42".to_string(),
                weight: 10,
            }],
            timeout_ms: None,
        })
    }

    fn language(job_timeout_ms: u64) -> LanguageConfig {
        let mut language = LanguageConfig::builtin(Language::Python);
        language.test_timeout_ms = job_timeout_ms.min(5_000);
        language.job_timeout_ms = job_timeout_ms;
        language
    }

    #[test]
    fn test_effective_test_timeout_clamps() {
        let lang = LanguageConfig::builtin(Language::Python);
        let mut request = (*job()).clone();
        assert_eq!(effective_test_timeout(&request, &lang), Duration::from_millis(5_000));

        request.timeout_ms = Some(1_000);
        assert_eq!(effective_test_timeout(&request, &lang), Duration::from_millis(1_000));

        request.timeout_ms = Some(600_000);
        assert_eq!(effective_test_timeout(&request, &lang), Duration::from_millis(5_000));

        request.timeout_ms = Some(0);
        assert_eq!(effective_test_timeout(&request, &lang), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_completed_job_is_scored() {
        let (outcome, result) = execute(Arc::new(EchoSandbox), job(), language(5_000)).await;
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(result.overall_status, JobStatus::Completed);
        assert_eq!(result.score, 10);
    }

    #[tokio::test]
    async fn test_sandbox_error_is_errored() {
        let (outcome, result) = execute(Arc::new(FailingSandbox), job(), language(5_000)).await;
        assert_eq!(outcome, Outcome::Errored);
        assert_eq!(result.overall_status, JobStatus::Errored);
        assert!(result.error.unwrap().contains("docker daemon unreachable"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (outcome, result) = execute(Arc::new(PanickingSandbox), job(), language(5_000)).await;
        assert_eq!(outcome, Outcome::Errored);
        assert_eq!(result.score, 0);
    }

    #[tokio::test]
    async fn test_timeout_aborts_execution() {
        let dropped = Arc::new(AtomicBool::new(false));
        let sandbox = HangingSandbox {
            dropped: Arc::clone(&dropped),
        };

        let (outcome, result) = execute(Arc::new(sandbox), job(), language(50)).await;
        assert_eq!(outcome, Outcome::TimedOut);
        assert_eq!(result.overall_status, JobStatus::TimedOut);

        // abort is asynchronous; give the runtime a moment to drop the task
        for _ in 0..50 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dropped.load(Ordering::SeqCst), "sandbox future was not dropped");
    }
}
