// Prometheus exposition of queue activity.
//
// These are monotonic process counters for scraping; they are independent
// of the admin counters in `metrics` and are not touched by a reset.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref JOBS_SUBMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("proctor_jobs_submitted_total", "Jobs admitted to the queue"),
        &["language", "priority"]
    )
    .expect("metric can be created");
    pub static ref JOBS_FINISHED: IntCounterVec = IntCounterVec::new(
        Opts::new("proctor_jobs_finished_total", "Jobs that reached a terminal state"),
        &["language", "outcome"]
    )
    .expect("metric can be created");
    pub static ref SECURITY_REJECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("proctor_security_rejections_total", "Submissions rejected by the security scan"),
        &["language"]
    )
    .expect("metric can be created");
    pub static ref JOBS_RUNNING: IntGauge =
        IntGauge::new("proctor_jobs_running", "Jobs currently executing").expect("metric can be created");
    pub static ref QUEUE_DEPTH: IntGauge =
        IntGauge::new("proctor_queue_depth", "Jobs waiting for a slot").expect("metric can be created");
    pub static ref QUEUE_WAIT: Histogram = Histogram::with_opts(
        HistogramOpts::new("proctor_queue_wait_seconds", "Time from admission to start")
            .buckets(vec![0.0, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0])
    )
    .expect("metric can be created");
}

/// Register every collector with the registry. Safe to call more than once.
pub fn register() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(JOBS_SUBMITTED.clone()),
        Box::new(JOBS_FINISHED.clone()),
        Box::new(SECURITY_REJECTIONS.clone()),
        Box::new(JOBS_RUNNING.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(QUEUE_WAIT.clone()),
    ];

    for collector in collectors {
        // AlreadyReg on repeated calls is expected
        let _ = REGISTRY.register(collector);
    }
}

/// Text exposition of all registered metrics
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
