//! Error types shared across analysis-forge subsystems.
//!
//! Every subsystem owns a `thiserror` enum; each one maps onto the pipeline
//! taxonomy [`ErrorKind`], which is what gets written to the provenance
//! manifest and what the CLI turns into exit codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Structural problem with the experiment, found before any cost.
    Validation,
    /// Timeout, rate limit or 5xx that outlived its retries.
    TransientGateway,
    /// Every candidate model failed or was skipped.
    AllCandidatesExhausted,
    /// The run budget refused further model calls.
    BudgetExceeded,
    /// Durable storage could not be written or read.
    StorageIo,
    /// Stored bytes no longer match their content hash.
    CorruptArtifact,
    /// Bad configuration, detected before or instead of execution.
    Config,
    /// Cooperative cancellation stopped the work.
    Cancelled,
    /// A model reply did not match the expected shape.
    Schema,
}

impl ErrorKind {
    /// Stable snake_case label.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::TransientGateway => "transient_gateway",
            ErrorKind::AllCandidatesExhausted => "all_candidates_exhausted",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::StorageIo => "storage_io",
            ErrorKind::CorruptArtifact => "corrupt_artifact",
            ErrorKind::Config => "config",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Schema => "schema",
        }
    }

    /// Whether this class halts the whole run rather than one work unit.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::Validation
                | ErrorKind::StorageIo
                | ErrorKind::CorruptArtifact
                | ErrorKind::Config
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while talking to a single LLM backend.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: environment variable {0} is not set")]
    MissingApiKey(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out after {millis} ms")]
    Timeout { millis: u64 },

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Response did not match the expected schema: {0}")]
    SchemaMismatch(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Context length exceeded: {limit} tokens")]
    ContextLengthExceeded { limit: u32 },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl LlmError {
    /// Whether a retry against the same model may succeed.
    ///
    /// Timeouts, connection trouble, 429 and 5xx are transient. A reply that
    /// fails schema validation is also retried rather than passed downstream.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout { .. } | LlmError::RateLimited(_) | LlmError::SchemaMismatch(_) => {
                true
            }
            LlmError::RequestFailed(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("connection")
                    || msg.contains("temporarily")
            }
            LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
            LlmError::ParseError(_) => true,
            LlmError::MissingApiKey(_)
            | LlmError::InvalidModel(_)
            | LlmError::ContextLengthExceeded { .. } => false,
        }
    }
}

/// A single problem found during pre-flight validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// What the issue is about (`framework`, `corpus/doc-3`, `matrix`, ...).
    pub subject: String,
    /// Human readable description.
    pub message: String,
}

impl ValidationIssue {
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.subject, self.message)
    }
}

/// Errors raised by pre-flight validation. Always fatal and always pre-cost.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Pre-flight validation failed with {} issue(s): {}", .0.len(), join_issues(.0))]
    Failed(Vec<ValidationIssue>),
}

impl ValidationError {
    /// The individual issues.
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            ValidationError::Failed(issues) => issues,
        }
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
