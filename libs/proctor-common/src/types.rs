use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Languages the sandbox knows how to run.
///
/// Serialized lowercase everywhere (wire format, Redis keys, config names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    Cpp,
    Javascript,
    Rust,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::Java,
        Language::Cpp,
        Language::Javascript,
        Language::Rust,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Javascript => "javascript",
            Language::Rust => "rust",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "cpp" | "c++" => Ok(Language::Cpp),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            "rust" | "rs" => Ok(Language::Rust),
            other => Err(format!("unknown language '{}'", other)),
        }
    }
}

/// Scheduling class of a job. High priority jobs are dequeued first,
/// subject to aging of normal jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => f.write_str("high"),
            Priority::Normal => f.write_str("normal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: u32,
    pub input: String,
    pub expected_output: String,
    pub weight: u32,
}

/// A student submission to be run against its test cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: Uuid,
    pub language: Language,
    #[serde(default)]
    pub priority: Priority,
    pub source_code: String,
    pub test_cases: Vec<TestCase>,
    /// Per-test limit requested by the caller, clamped to the language limit.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// State of a job the queue still holds. Once a job is terminal it is
/// represented by its `ExecutionResult` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scanning,
    Queued,
    Running,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Scanning => "scanning",
            JobState::Queued => "queued",
            JobState::Running => "running",
        };
        f.write_str(s)
    }
}

/// Overall verdict stored with a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// At least one test earned points.
    Completed,
    /// Ran to completion but earned nothing.
    Failed,
    TimedOut,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    RuntimeError,
    TimeLimitExceeded,
    CompilationError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_id: u32,
    pub status: TestStatus,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub overall_status: JobStatus,
    pub score: u32,
    pub max_score: u32,
    pub results: Vec<TestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Result for a job that never produced test outputs.
    pub fn aborted(job: &JobRequest, status: JobStatus, error: impl Into<String>) -> Self {
        Self {
            job_id: job.id,
            overall_status: status,
            score: 0,
            max_score: job
                .test_cases
                .iter()
                .fold(0u32, |total, tc| total.saturating_add(tc.weight)),
            results: Vec::new(),
            error: Some(error.into()),
            finished_at: Utc::now(),
        }
    }
}

/// Cheap point-in-time view polled by the admin panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub running: u64,
    pub queue_depth: u64,
    pub avg_wait_ms: u64,
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub timestamp: DateTime<Utc>,
    pub language: Language,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityMetrics {
    pub total_scans: u64,
    pub total_rejections: u64,
    pub rejection_rate: String,
    pub recent_violations: Vec<ViolationRecord>,
}

/// Cumulative counters since service start or the last reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub total_jobs_processed: u64,
    pub total_jobs_queued: u64,
    pub total_jobs_immediate: u64,
    pub max_wait_time_ms: u64,
    pub running_by_language: BTreeMap<String, u64>,
    pub high_priority_processed: u64,
    pub normal_priority_processed: u64,
    pub total_errors: u64,
    pub total_timeouts: u64,
    pub security: SecurityMetrics,
    pub last_job_processed_at: Option<DateTime<Utc>>,
    pub service_started_at: DateTime<Utc>,
}

/// Formats `rejections / scans` as a percentage with two decimals.
/// Zero scans reads as "0.00%".
pub fn format_rejection_rate(rejections: u64, scans: u64) -> String {
    if scans == 0 {
        return "0.00%".to_string();
    }
    format!("{:.2}%", rejections as f64 / scans as f64 * 100.0)
}
