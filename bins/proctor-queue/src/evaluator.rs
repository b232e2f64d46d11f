// Scoring of raw sandbox output.
//
// A test passes when its stdout equals the expected output after both are
// normalized: CRLF folded to LF and surrounding whitespace trimmed. The
// comparison is otherwise exact (case and inner whitespace matter).
//
// The job score is the summed weight of passing tests out of the summed
// weight of all tests. A job that earned nothing is `failed`, otherwise
// `completed`. Nothing here touches Docker or the queue.

use chrono::Utc;
use proctor_common::types::{
    ExecutionResult, JobRequest, JobStatus, TestCase, TestResult, TestStatus,
};
use tracing::debug;

/// What the sandbox observed for one test case
#[derive(Debug, Clone, Default)]
pub struct TestExecutionOutput {
    pub test_id: u32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    pub runtime_error: bool,
    pub compilation_failed: bool,
}

/// Result of the compile step of a compile-once execution
#[derive(Debug, Clone)]
pub struct CompilationResult {
    pub success: bool,
    pub stderr: String,
}

impl CompilationResult {
    pub fn success() -> Self {
        Self {
            success: true,
            stderr: String::new(),
        }
    }

    pub fn failure(stderr: String) -> Self {
        Self {
            success: false,
            stderr,
        }
    }
}

/// Summed weight of all test cases, saturating at `u32::MAX`
pub fn total_weight(test_cases: &[TestCase]) -> u32 {
    test_cases
        .iter()
        .fold(0u32, |total, tc| total.saturating_add(tc.weight))
}

fn normalize_output(output: &str) -> String {
    output.replace("\r\n", "\n").trim().to_string()
}

/// Classify a single test output.
///
/// Priority: compilation failure, runtime error, timeout, then comparison.
pub fn evaluate_test(output: &TestExecutionOutput, test_case: &TestCase) -> TestResult {
    let status = if output.compilation_failed {
        TestStatus::CompilationError
    } else if output.runtime_error {
        TestStatus::RuntimeError
    } else if output.timed_out {
        TestStatus::TimeLimitExceeded
    } else if normalize_output(&output.stdout) == normalize_output(&test_case.expected_output) {
        TestStatus::Passed
    } else {
        TestStatus::Failed
    };

    TestResult {
        test_id: output.test_id,
        status,
        stdout: output.stdout.clone(),
        stderr: output.stderr.clone(),
        execution_time_ms: output.execution_time_ms,
    }
}

/// Score every output against the job's test cases.
///
/// Outputs without a matching test case are ignored; test cases without an
/// output (execution stopped early) simply earn nothing.
pub fn evaluate(job: &JobRequest, outputs: Vec<TestExecutionOutput>) -> ExecutionResult {
    let max_score = total_weight(&job.test_cases);
    let mut score = 0u32;
    let mut results = Vec::with_capacity(outputs.len());

    for output in &outputs {
        let Some(test_case) = job.test_cases.iter().find(|tc| tc.id == output.test_id) else {
            debug!(job_id = %job.id, test_id = output.test_id, "Output for unknown test case ignored");
            continue;
        };

        let result = evaluate_test(output, test_case);
        if result.status == TestStatus::Passed {
            score = score.saturating_add(test_case.weight);
        }

        debug!(
            job_id = %job.id,
            test_id = test_case.id,
            weight = test_case.weight,
            status = ?result.status,
            "Test evaluated"
        );
        results.push(result);
    }

    let overall_status = if score > 0 {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };

    ExecutionResult {
        job_id: job.id,
        overall_status,
        score,
        max_score,
        results,
        error: None,
        finished_at: Utc::now(),
    }
}
