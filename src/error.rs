//! Error types for the SRE agent execution substrate

use thiserror::Error;

/// Result type alias used throughout the crate
pub type SreResult<T> = Result<T, SreError>;

/// Error taxonomy for the execution substrate.
///
/// The worker runtime uses [`SreError::is_retryable`] to decide between
/// re-enqueueing a job with backoff and terminating it as failed.
#[derive(Error, Debug)]
pub enum SreError {
    /// Redis connection or command errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed input: bad ids, unknown interval types, invalid arguments
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Entity missing from the primary store
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Rejected task status transition; state is left unchanged
    #[error("Invalid task status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A task function name with no registration
    #[error("Unknown task function: {name}")]
    UnknownTaskFunction { name: String },

    /// LLM call failures (network, provider errors)
    #[error("LLM error: {message}")]
    Llm { message: String },

    /// Tool execution failures
    #[error("Tool '{name}' failed: {message}")]
    Tool { name: String, message: String },

    /// Operation exceeded its timeout
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// The turn was cancelled cooperatively; never retried
    #[error("Cancelled")]
    Cancelled,

    /// Unrecoverable state, e.g. a corrupt primary record
    #[error("Fatal: {message}")]
    Fatal { message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic wrapper for composition-root errors
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SreError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(kind: &'static str, id: S) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn llm<S: Into<String>>(message: S) -> Self {
        Self::Llm {
            message: message.into(),
        }
    }

    pub fn tool<S: Into<String>>(name: S, message: S) -> Self {
        Self::Tool {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Whether the worker runtime should retry the job that produced this error.
    ///
    /// Transient I/O retries; validation, not-found, unknown functions and
    /// cancellations terminate immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            SreError::Redis(_) => true,
            SreError::Llm { .. } => true,
            SreError::Tool { .. } => true,
            SreError::Timeout { .. } => true,
            SreError::Io(_) => true,
            SreError::Serialization(_) => false,
            SreError::Validation { .. } => false,
            SreError::NotFound { .. } => false,
            SreError::InvalidTransition { .. } => false,
            SreError::UnknownTaskFunction { .. } => false,
            SreError::Cancelled => false,
            SreError::Fatal { .. } => false,
            SreError::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(SreError::timeout("llm_invoke").is_retryable());
        assert!(SreError::llm("connection reset").is_retryable());
        assert!(SreError::tool("check_service_health", "503").is_retryable());
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!SreError::validation("bad interval_type").is_retryable());
        assert!(!SreError::not_found("thread", "01H0").is_retryable());
        assert!(!SreError::Cancelled.is_retryable());
        assert!(!SreError::UnknownTaskFunction { name: "nope".into() }.is_retryable());
        assert!(!SreError::InvalidTransition {
            from: "done".into(),
            to: "queued".into()
        }
        .is_retryable());
    }
}
