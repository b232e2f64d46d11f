/// Queue Service - Admission, Dispatch and Job Lifecycle
///
/// ```text
/// Submitted → Scanning → Rejected
///                      → Admitted → Running ─────────→ Completed | TimedOut | Errored
///                                 → Queued → Running ─↗
/// ```
///
/// **Admission** is synchronous: by the time `submit` returns the job is
/// either rejected, running, or counted in the queue depth.
///
/// **Dispatch** is slot based. A running job holds a `Slot`; dropping the
/// slot hands it to the next queued job inside the scheduler's critical
/// section. The slot is dropped on every path out of `run_job`, so a
/// finished, failed or panicking job can never leave `running` stuck.
///
/// **Reads** (`status`, `metrics`) never touch the scheduler lock.

use crate::config::LanguageConfigManager;
use crate::engine::Sandbox;
use crate::error::SubmitError;
use crate::executor;
use crate::metrics::{HealthThresholds, HealthWindow, LiveGauges, MetricsRecorder, Outcome};
use crate::results::ResultStore;
use crate::scanner::SecurityScanner;
use crate::scheduler::{Admission, Scheduler};
use crate::telemetry;
use anyhow::Result;
use parking_lot::Mutex;
use proctor_common::config::QueueConfig;
use proctor_common::types::{
    ExecutionResult, JobRequest, JobState, JobStatus, QueueMetrics, QueueStatus,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// An admitted job while it is owned by the queue
struct ExecutionJob {
    request: Arc<JobRequest>,
    reply: Option<oneshot::Sender<ExecutionResult>>,
}

/// Returned to the submitter of an admitted job
#[derive(Debug)]
pub struct JobHandle {
    pub id: Uuid,
    /// State at admission: `Running` or `Queued`
    pub state: JobState,
    result: oneshot::Receiver<ExecutionResult>,
}

impl JobHandle {
    /// Wait for the terminal result
    pub async fn wait(self) -> Option<ExecutionResult> {
        self.result.await.ok()
    }
}

struct Inner {
    languages: LanguageConfigManager,
    scanner: SecurityScanner,
    sandbox: Arc<dyn Sandbox>,
    results: Arc<dyn ResultStore>,
    scheduler: Mutex<Scheduler<ExecutionJob>>,
    gauges: LiveGauges,
    metrics: MetricsRecorder,
    health: HealthWindow,
    /// Jobs not yet terminal
    jobs: Mutex<HashMap<Uuid, JobState>>,
}

impl Inner {
    fn publish_gauges(&self, scheduler: &Scheduler<ExecutionJob>) {
        self.gauges
            .set(scheduler.running(), scheduler.queue_depth());
        telemetry::JOBS_RUNNING.set(scheduler.running() as i64);
        telemetry::QUEUE_DEPTH.set(scheduler.queue_depth() as i64);
    }
}

/// Concurrency slot held by a running job
struct Slot {
    inner: Arc<Inner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let next = {
            let mut scheduler = self.inner.scheduler.lock();
            let next = scheduler.complete(Instant::now());
            self.inner.publish_gauges(&scheduler);
            next
        };

        if let Some((job, waited)) = next {
            start(Arc::clone(&self.inner), job, waited);
        }
    }
}

#[derive(Clone)]
pub struct QueueService {
    inner: Arc<Inner>,
}

impl QueueService {
    pub fn new(
        config: &QueueConfig,
        languages: LanguageConfigManager,
        sandbox: Arc<dyn Sandbox>,
        results: Arc<dyn ResultStore>,
    ) -> Result<Self> {
        let scanner = SecurityScanner::new(&languages)?;
        for language in languages.list_languages() {
            debug!(language = %language, rules = scanner.rule_count(language), "Security rules compiled");
        }

        let scheduler = Scheduler::new(
            config.max_concurrency,
            config.max_queue_depth,
            config.aging_threshold,
        );
        info!(
            max_concurrency = scheduler.max_concurrency(),
            max_queue_depth = config.max_queue_depth,
            "Scheduler ready"
        );

        let health = HealthWindow::new(
            config.health_window,
            HealthThresholds {
                queue_depth: config.degraded_queue_depth,
                avg_wait_ms: config.degraded_avg_wait_ms,
                failure_rate: config.degraded_failure_rate,
                min_samples: config.health_min_samples,
            },
        );

        Ok(Self {
            inner: Arc::new(Inner {
                languages,
                scanner,
                sandbox,
                results,
                scheduler: Mutex::new(scheduler),
                gauges: LiveGauges::default(),
                metrics: MetricsRecorder::new(config.violation_log_capacity),
                health,
                jobs: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Scan and admit a job.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle, SubmitError> {
        let inner = &self.inner;
        let id = request.id;
        let language = request.language;
        let priority = request.priority;

        if !inner.languages.is_enabled(&language) {
            return Err(SubmitError::UnsupportedLanguage(language));
        }
        validate(&request)?;

        inner.jobs.lock().insert(id, JobState::Scanning);
        let report = inner.scanner.scan(language, &request.source_code);
        inner.metrics.record_scan(language, &report.violations);

        if !report.is_clean() {
            inner.jobs.lock().remove(&id);
            telemetry::SECURITY_REJECTIONS
                .with_label_values(&[language.as_str()])
                .inc();
            warn!(
                job_id = %id,
                language = %language,
                violations = ?report.violations,
                "Submission rejected by security scan"
            );
            return Err(SubmitError::SecurityViolation {
                violations: report.violations,
            });
        }

        let (reply, result) = oneshot::channel();
        let job = ExecutionJob {
            request: Arc::new(request),
            reply: Some(reply),
        };

        // Visible as queued before anyone can dequeue it
        inner.jobs.lock().insert(id, JobState::Queued);

        let admission = {
            let mut scheduler = inner.scheduler.lock();
            let admission = scheduler.admit(job, priority, Instant::now());
            inner.publish_gauges(&scheduler);
            admission
        };

        let state = match admission {
            Admission::RunNow(job) => {
                inner.metrics.record_admitted(true);
                inner.jobs.lock().insert(id, JobState::Running);
                start(Arc::clone(inner), job, Duration::ZERO);
                JobState::Running
            }
            Admission::Queued { depth } => {
                inner.metrics.record_admitted(false);
                debug!(job_id = %id, depth, "Job queued");
                JobState::Queued
            }
            Admission::Full(_) => {
                inner.jobs.lock().remove(&id);
                let depth = inner.gauges.queue_depth() as usize;
                warn!(job_id = %id, depth, "Queue full, submission refused");
                return Err(SubmitError::QueueFull { depth });
            }
        };

        telemetry::JOBS_SUBMITTED
            .with_label_values(&[language.as_str(), &priority.to_string()])
            .inc();
        info!(job_id = %id, language = %language, priority = %priority, state = %state, "Job admitted");

        Ok(JobHandle { id, state, result })
    }

    /// Cheap snapshot for frequent polling; degraded is `healthy: false`
    pub fn status(&self) -> QueueStatus {
        let running = self.inner.gauges.running();
        let queue_depth = self.inner.gauges.queue_depth();
        let avg_wait_ms = self.inner.health.avg_wait_ms();

        QueueStatus {
            running,
            queue_depth,
            avg_wait_ms,
            healthy: self.inner.health.is_healthy(queue_depth, avg_wait_ms),
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.inner.metrics.snapshot()
    }

    /// Zero cumulative counters; running and queued jobs are unaffected
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
        info!("Queue metrics reset");
    }

    /// Lifecycle state of a job that has not finished yet
    pub fn job_state(&self, id: &Uuid) -> Option<JobState> {
        self.inner.jobs.lock().get(id).copied()
    }

    pub async fn result(&self, id: &Uuid) -> Result<Option<ExecutionResult>> {
        self.inner.results.get(id).await
    }

    /// Periodically promote aged normal jobs. Stops once the service is
    /// dropped.
    pub fn spawn_aging(&self, tick: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };

                let mut scheduler = inner.scheduler.lock();
                let promoted = scheduler.promote_aged(Instant::now());
                if promoted > 0 {
                    debug!(
                        promoted,
                        high = scheduler.wait_queue().high_len(),
                        normal = scheduler.wait_queue().normal_len(),
                        promoted_total = scheduler.wait_queue().promoted_total(),
                        "Promoted aged jobs"
                    );
                }
            }
        })
    }
}

fn validate(request: &JobRequest) -> Result<(), SubmitError> {
    if request.test_cases.is_empty() {
        return Err(SubmitError::InvalidRequest(
            "at least one test case is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    let mut total_weight = 0u32;
    for tc in &request.test_cases {
        if !seen.insert(tc.id) {
            return Err(SubmitError::InvalidRequest(format!(
                "duplicate test case id {}",
                tc.id
            )));
        }
        total_weight = total_weight.checked_add(tc.weight).ok_or_else(|| {
            SubmitError::InvalidRequest(format!(
                "test case weights exceed {} in total",
                u32::MAX
            ))
        })?;
    }

    Ok(())
}

fn start(inner: Arc<Inner>, job: ExecutionJob, waited: Duration) {
    // Reached from Slot::drop, which may run while the runtime shuts down
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(job_id = %job.request.id, "No runtime available, job dropped");
        abandon(&inner, job);
        return;
    };

    let slot = Slot {
        inner: Arc::clone(&inner),
    };
    handle.spawn(run_job(inner, slot, job, waited));
}

/// Give back the slot of a job that cannot be started. Without a runtime
/// nothing queued can start either, so the queue is drained the same way.
fn abandon(inner: &Inner, job: ExecutionJob) {
    let mut dropped = vec![job];
    {
        let mut scheduler = inner.scheduler.lock();
        while let Some((next, _)) = scheduler.complete(Instant::now()) {
            dropped.push(next);
        }
        inner.publish_gauges(&scheduler);
    }

    let mut jobs = inner.jobs.lock();
    for job in &dropped {
        jobs.remove(&job.request.id);
    }
}

#[instrument(
    skip_all,
    fields(job_id = %job.request.id, language = %job.request.language, priority = %job.request.priority)
)]
async fn run_job(inner: Arc<Inner>, slot: Slot, mut job: ExecutionJob, waited: Duration) {
    let request = Arc::clone(&job.request);
    let id = request.id;
    let language = request.language;
    let wait_ms = waited.as_millis() as u64;

    inner.jobs.lock().insert(id, JobState::Running);
    inner.metrics.record_started(language, wait_ms);
    inner.health.record_wait(wait_ms);
    telemetry::QUEUE_WAIT.observe(waited.as_secs_f64());

    info!(
        wait_ms,
        test_cases = request.test_cases.len(),
        source_size = request.source_code.len(),
        "Job started"
    );

    let start_time = Instant::now();
    let (outcome, result) = match inner.languages.get_config(&language) {
        Ok(config) => {
            executor::execute(Arc::clone(&inner.sandbox), Arc::clone(&request), config.clone())
                .await
        }
        Err(e) => (
            Outcome::Errored,
            ExecutionResult::aborted(&request, JobStatus::Errored, e.to_string()),
        ),
    };

    if let Err(e) = inner.results.put(&result).await {
        // Non-fatal: the submitter still gets the result through its handle
        error!(error = %e, "Failed to persist result");
    }

    inner.metrics.record_finished(language, request.priority, outcome);
    inner.health.record_outcome(outcome);
    telemetry::JOBS_FINISHED
        .with_label_values(&[language.as_str(), outcome.as_str()])
        .inc();
    inner.jobs.lock().remove(&id);

    info!(
        outcome = outcome.as_str(),
        status = ?result.overall_status,
        score = result.score,
        max_score = result.max_score,
        execution_ms = start_time.elapsed().as_millis() as u64,
        "Job finished"
    );

    // Free the slot before notifying, so a woken submitter sees it released
    drop(slot);

    if let Some(reply) = job.reply.take() {
        // Submitter may have gone away
        let _ = reply.send(result);
    }
}
