//! Error types for spamsift.

use crate::pipeline::types::MessageId;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// A failed call into an external collaborator (user, message or spam lookup).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{service} lookup failed: {reason}")]
pub struct CollaboratorError {
    pub service: String,
    pub reason: String,
}

impl CollaboratorError {
    pub fn new(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Spam check failed for message {message_id}: {source}")]
    Classify {
        message_id: MessageId,
        #[source]
        source: CollaboratorError,
    },

    #[error("Pipeline run was cancelled")]
    Cancelled,

    #[error("Stage {stage} panicked: {reason}")]
    StagePanicked { stage: &'static str, reason: String },

    #[error("Pipeline aborted: {}", summarize(.failures))]
    Aborted { failures: Vec<StageFailure> },
}

impl PipelineError {
    /// First non-aggregate error, following nested `Aborted` failures.
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            Self::Aborted { failures } => failures
                .first()
                .map(|f| f.error.root_cause())
                .unwrap_or(self),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// One stage's contribution to an aggregated pipeline failure.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: &'static str,
    pub error: PipelineError,
}

fn summarize(failures: &[StageFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}", f.stage, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors loading the in-memory mail directory.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse directory: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Duplicate user email in directory: {0}")]
    DuplicateUser(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
