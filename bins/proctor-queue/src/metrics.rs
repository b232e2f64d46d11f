// Queue metrics: cumulative counters, live gauges and the health window.
//
// Counters live in a single struct behind one mutex. Every update holds the
// lock for a handful of integer operations, so a snapshot is never half
// updated and a reset cannot interleave with an increment.
//
// Gauges (running, queue depth) are plain atomics written from inside the
// scheduler's critical section and read without locking by status polls.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use proctor_common::types::{
    format_rejection_rate, Language, Priority, QueueMetrics, SecurityMetrics, ViolationRecord,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Terminal outcome of an admitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    TimedOut,
    Errored,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::TimedOut => "timed_out",
            Outcome::Errored => "errored",
        }
    }
}

/// Fixed-capacity ring buffer of recent violations.
/// Slots are allocated once; writes overwrite the oldest entry.
#[derive(Debug)]
pub struct ViolationLog {
    slots: Vec<Option<ViolationRecord>>,
    next: usize,
}

impl ViolationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            next: 0,
        }
    }

    pub fn push(&mut self, record: ViolationRecord) {
        self.slots[self.next] = Some(record);
        self.next = (self.next + 1) % self.slots.len();
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries newest first
    pub fn recent(&self) -> Vec<ViolationRecord> {
        let cap = self.slots.len();
        (1..=cap)
            .filter_map(|back| self.slots[(self.next + cap - back) % cap].clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.next = 0;
    }
}

#[derive(Debug, Default, Clone)]
struct Counters {
    total_jobs_processed: u64,
    total_jobs_queued: u64,
    total_jobs_immediate: u64,
    max_wait_time_ms: u64,
    high_priority_processed: u64,
    normal_priority_processed: u64,
    total_errors: u64,
    total_timeouts: u64,
    total_scans: u64,
    total_rejections: u64,
    last_job_processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct MetricsState {
    counters: Counters,
    violations: ViolationLog,
    /// Live gauge; survives resets.
    running_by_language: HashMap<Language, u64>,
}

/// Cumulative queue counters
#[derive(Debug)]
pub struct MetricsRecorder {
    state: Mutex<MetricsState>,
    service_started_at: DateTime<Utc>,
}

impl MetricsRecorder {
    pub fn new(violation_log_capacity: usize) -> Self {
        Self {
            state: Mutex::new(MetricsState {
                counters: Counters::default(),
                violations: ViolationLog::new(violation_log_capacity),
                running_by_language: HashMap::new(),
            }),
            service_started_at: Utc::now(),
        }
    }

    /// Every scan counts; a non-empty violation list is a rejection.
    pub fn record_scan(&self, language: Language, violations: &[String]) {
        let mut state = self.state.lock();
        state.counters.total_scans += 1;
        if !violations.is_empty() {
            state.counters.total_rejections += 1;
            state.violations.push(ViolationRecord {
                timestamp: Utc::now(),
                language,
                violations: violations.to_vec(),
            });
        }
    }

    pub fn record_admitted(&self, immediate: bool) {
        let mut state = self.state.lock();
        if immediate {
            state.counters.total_jobs_immediate += 1;
        } else {
            state.counters.total_jobs_queued += 1;
        }
    }

    pub fn record_started(&self, language: Language, wait_ms: u64) {
        let mut state = self.state.lock();
        *state.running_by_language.entry(language).or_insert(0) += 1;
        if wait_ms > state.counters.max_wait_time_ms {
            state.counters.max_wait_time_ms = wait_ms;
        }
    }

    pub fn record_finished(&self, language: Language, priority: Priority, outcome: Outcome) {
        let mut state = self.state.lock();

        if let Some(running) = state.running_by_language.get_mut(&language) {
            *running = running.saturating_sub(1);
            if *running == 0 {
                state.running_by_language.remove(&language);
            }
        }

        let counters = &mut state.counters;
        counters.total_jobs_processed += 1;
        match priority {
            Priority::High => counters.high_priority_processed += 1,
            Priority::Normal => counters.normal_priority_processed += 1,
        }
        match outcome {
            Outcome::Completed => {}
            Outcome::TimedOut => counters.total_timeouts += 1,
            Outcome::Errored => counters.total_errors += 1,
        }
        counters.last_job_processed_at = Some(Utc::now());
    }

    /// Zero every cumulative counter. Live gauges and the service start
    /// time are left alone.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.counters = Counters::default();
        state.violations.clear();
    }

    /// Consistent copy of all counters
    pub fn snapshot(&self) -> QueueMetrics {
        let state = self.state.lock();
        let c = &state.counters;

        let running_by_language: BTreeMap<String, u64> = state
            .running_by_language
            .iter()
            .map(|(lang, count)| (lang.to_string(), *count))
            .collect();

        QueueMetrics {
            total_jobs_processed: c.total_jobs_processed,
            total_jobs_queued: c.total_jobs_queued,
            total_jobs_immediate: c.total_jobs_immediate,
            max_wait_time_ms: c.max_wait_time_ms,
            running_by_language,
            high_priority_processed: c.high_priority_processed,
            normal_priority_processed: c.normal_priority_processed,
            total_errors: c.total_errors,
            total_timeouts: c.total_timeouts,
            security: SecurityMetrics {
                total_scans: c.total_scans,
                total_rejections: c.total_rejections,
                rejection_rate: format_rejection_rate(c.total_rejections, c.total_scans),
                recent_violations: state.violations.recent(),
            },
            last_job_processed_at: c.last_job_processed_at,
            service_started_at: self.service_started_at,
        }
    }
}

/// Running and waiting counts, readable without taking any lock
#[derive(Debug, Default)]
pub struct LiveGauges {
    running: AtomicU64,
    queue_depth: AtomicU64,
}

impl LiveGauges {
    pub fn set(&self, running: usize, queue_depth: usize) {
        self.running.store(running as u64, Ordering::Release);
        self.queue_depth.store(queue_depth as u64, Ordering::Release);
    }

    pub fn running(&self) -> u64 {
        self.running.load(Ordering::Acquire)
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub queue_depth: u64,
    pub avg_wait_ms: u64,
    pub failure_rate: f64,
    pub min_samples: usize,
}

#[derive(Debug)]
struct Window {
    waits_ms: VecDeque<u64>,
    wait_sum_ms: u64,
    /// true when the job timed out or errored
    failures: VecDeque<bool>,
    failure_count: usize,
}

/// Rolling windows over the most recent dequeues and outcomes
#[derive(Debug)]
pub struct HealthWindow {
    size: usize,
    thresholds: HealthThresholds,
    window: Mutex<Window>,
}

impl HealthWindow {
    pub fn new(size: usize, thresholds: HealthThresholds) -> Self {
        Self {
            size: size.max(1),
            thresholds,
            window: Mutex::new(Window {
                waits_ms: VecDeque::new(),
                wait_sum_ms: 0,
                failures: VecDeque::new(),
                failure_count: 0,
            }),
        }
    }

    pub fn record_wait(&self, wait_ms: u64) {
        let mut w = self.window.lock();
        w.waits_ms.push_back(wait_ms);
        w.wait_sum_ms += wait_ms;
        if w.waits_ms.len() > self.size {
            if let Some(old) = w.waits_ms.pop_front() {
                w.wait_sum_ms -= old;
            }
        }
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        let failed = outcome != Outcome::Completed;
        let mut w = self.window.lock();
        w.failures.push_back(failed);
        if failed {
            w.failure_count += 1;
        }
        if w.failures.len() > self.size {
            if let Some(true) = w.failures.pop_front() {
                w.failure_count -= 1;
            }
        }
    }

    pub fn avg_wait_ms(&self) -> u64 {
        let w = self.window.lock();
        if w.waits_ms.is_empty() {
            0
        } else {
            w.wait_sum_ms / w.waits_ms.len() as u64
        }
    }

    pub fn failure_rate(&self) -> Option<f64> {
        let w = self.window.lock();
        if w.failures.is_empty() || w.failures.len() < self.thresholds.min_samples {
            return None;
        }
        Some(w.failure_count as f64 / w.failures.len() as f64)
    }

    /// Degraded when the queue is too deep, waits are too long, or too many
    /// recent jobs failed.
    pub fn is_healthy(&self, queue_depth: u64, avg_wait_ms: u64) -> bool {
        if queue_depth > self.thresholds.queue_depth {
            return false;
        }
        if avg_wait_ms > self.thresholds.avg_wait_ms {
            return false;
        }
        match self.failure_rate() {
            Some(rate) => rate <= self.thresholds.failure_rate,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(lang: Language, n: usize) -> ViolationRecord {
        ViolationRecord {
            timestamp: Utc::now(),
            language: lang,
            violations: vec![format!("violation {}", n)],
        }
    }

    #[test]
    fn test_ring_buffer_caps_and_orders_newest_first() {
        let mut log = ViolationLog::new(5);
        for i in 0..8 {
            log.push(record(Language::Python, i));
        }

        assert_eq!(log.capacity(), 5);
        assert_eq!(log.len(), 5);
        let recent = log.recent();
        let names: Vec<&str> = recent.iter().map(|r| r.violations[0].as_str()).collect();
        assert_eq!(
            names,
            vec!["violation 7", "violation 6", "violation 5", "violation 4", "violation 3"]
        );
    }

    #[test]
    fn test_ring_buffer_partial_and_clear() {
        let mut log = ViolationLog::new(5);
        log.push(record(Language::Java, 0));
        log.push(record(Language::Java, 1));
        assert_eq!(log.recent().len(), 2);
        assert_eq!(log.recent()[0].violations[0], "violation 1");

        log.clear();
        assert!(log.is_empty());
        assert!(log.recent().is_empty());
    }

    #[test]
    fn test_scan_counters_and_rate() {
        let metrics = MetricsRecorder::new(5);
        let snap = metrics.snapshot();
        assert_eq!(snap.security.total_scans, 0);
        assert_eq!(snap.security.rejection_rate, "0.00%");

        metrics.record_scan(Language::Python, &[]);
        metrics.record_scan(Language::Python, &[]);
        metrics.record_scan(Language::Python, &[]);
        metrics.record_scan(Language::Cpp, &["shell command".to_string()]);

        let snap = metrics.snapshot();
        assert_eq!(snap.security.total_scans, 4);
        assert_eq!(snap.security.total_rejections, 1);
        assert_eq!(snap.security.rejection_rate, "25.00%");
        assert_eq!(snap.security.recent_violations.len(), 1);
        assert_eq!(snap.security.recent_violations[0].language, Language::Cpp);
    }

    #[test]
    fn test_violation_feed_never_exceeds_capacity() {
        let metrics = MetricsRecorder::new(5);
        for _ in 0..50 {
            metrics.record_scan(Language::Rust, &["unsafe code".to_string()]);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.security.total_rejections, 50);
        assert_eq!(snap.security.recent_violations.len(), 5);
    }

    #[test]
    fn test_job_lifecycle_counters() {
        let metrics = MetricsRecorder::new(5);
        metrics.record_admitted(true);
        metrics.record_admitted(false);
        metrics.record_started(Language::Python, 0);
        metrics.record_started(Language::Python, 120);

        let snap = metrics.snapshot();
        assert_eq!(snap.running_by_language.get("python"), Some(&2));
        assert_eq!(snap.max_wait_time_ms, 120);

        metrics.record_finished(Language::Python, Priority::High, Outcome::Completed);
        metrics.record_finished(Language::Python, Priority::Normal, Outcome::TimedOut);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_jobs_processed, 2);
        assert_eq!(snap.total_jobs_immediate, 1);
        assert_eq!(snap.total_jobs_queued, 1);
        assert_eq!(snap.high_priority_processed, 1);
        assert_eq!(snap.normal_priority_processed, 1);
        assert_eq!(snap.total_timeouts, 1);
        assert_eq!(snap.total_errors, 0);
        assert!(snap.running_by_language.is_empty());
        assert!(snap.last_job_processed_at.is_some());
    }

    #[test]
    fn test_reset_zeroes_counters_but_keeps_live_state() {
        let metrics = MetricsRecorder::new(5);
        let started = metrics.snapshot().service_started_at;

        metrics.record_scan(Language::Java, &["reflection".to_string()]);
        metrics.record_admitted(true);
        metrics.record_started(Language::Java, 40);
        metrics.record_started(Language::Java, 0);
        metrics.record_finished(Language::Java, Priority::Normal, Outcome::Errored);

        metrics.reset();
        let snap = metrics.snapshot();

        assert_eq!(snap.total_jobs_processed, 0);
        assert_eq!(snap.total_jobs_immediate, 0);
        assert_eq!(snap.max_wait_time_ms, 0);
        assert_eq!(snap.total_errors, 0);
        assert_eq!(snap.security.total_scans, 0);
        assert_eq!(snap.security.total_rejections, 0);
        assert!(snap.security.recent_violations.is_empty());
        assert!(snap.last_job_processed_at.is_none());
        // one Java job is still running
        assert_eq!(snap.running_by_language.get("java"), Some(&1));
        assert_eq!(snap.service_started_at, started);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let metrics = Arc::new(MetricsRecorder::new(5));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_scan(Language::Python, &[]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().security.total_scans, 8000);
    }

    #[test]
    fn test_concurrent_resets_are_safe() {
        let metrics = Arc::new(MetricsRecorder::new(5));
        for _ in 0..100 {
            metrics.record_scan(Language::Python, &["x".to_string()]);
        }

        let a = {
            let metrics = Arc::clone(&metrics);
            std::thread::spawn(move || metrics.reset())
        };
        let b = {
            let metrics = Arc::clone(&metrics);
            std::thread::spawn(move || metrics.reset())
        };
        a.join().unwrap();
        b.join().unwrap();

        let snap = metrics.snapshot();
        assert_eq!(snap.security.total_scans, 0);
        assert_eq!(snap.security.total_rejections, 0);
    }

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            queue_depth: 10,
            avg_wait_ms: 1000,
            failure_rate: 0.5,
            min_samples: 4,
        }
    }

    #[test]
    fn test_health_window_average_wait() {
        let health = HealthWindow::new(3, thresholds());
        assert_eq!(health.avg_wait_ms(), 0);
        health.record_wait(100);
        health.record_wait(200);
        health.record_wait(300);
        assert_eq!(health.avg_wait_ms(), 200);
        // oldest (100) falls out
        health.record_wait(600);
        assert_eq!(health.avg_wait_ms(), 366);
    }

    #[test]
    fn test_health_thresholds() {
        let health = HealthWindow::new(10, thresholds());
        assert!(health.is_healthy(0, 0));
        assert!(!health.is_healthy(11, 0));
        assert!(!health.is_healthy(0, 1001));

        // below min_samples the failure rate is ignored
        health.record_outcome(Outcome::TimedOut);
        health.record_outcome(Outcome::Errored);
        health.record_outcome(Outcome::Errored);
        assert!(health.failure_rate().is_none());
        assert!(health.is_healthy(0, 0));

        health.record_outcome(Outcome::Completed);
        assert_eq!(health.failure_rate(), Some(0.75));
        assert!(!health.is_healthy(0, 0));

        for _ in 0..10 {
            health.record_outcome(Outcome::Completed);
        }
        assert_eq!(health.failure_rate(), Some(0.0));
        assert!(health.is_healthy(0, 0));
    }
}
