use proctor_common::types::Language;
use thiserror::Error;

/// Reasons a submission is not admitted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Language not enabled: {0}")]
    UnsupportedLanguage(Language),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Security scan rejected submission: {}", .violations.join(", "))]
    SecurityViolation { violations: Vec<String> },

    #[error("Queue is full ({depth} jobs waiting)")]
    QueueFull { depth: usize },
}
