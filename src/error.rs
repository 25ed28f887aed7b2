//! Domain-specific error types for the orchestration core.
//!
//! Typed errors let the pipeline decide retry and failure classification
//! by matching on the failure mode rather than parsing message strings.

use std::time::Duration;

/// How the pipeline should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Invalid or missing configuration. Never retried.
    Fatal,
    /// Resource contention. Retried by the calling phase.
    Transient,
    /// Sandbox hard-limit breach. Counted as a phase failure.
    Violation,
    /// Phase or tool failure. Retried up to the phase's attempt limit.
    Execution,
    /// Quality gate not met.
    Evaluation,
    /// Cooperative cancellation.
    Cancelled,
}

/// Errors raised by the pool, sandbox and pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// A strategy, pool or agent reference could not be resolved.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No pool instance became available before the deadline.
    #[error("Timed out after {timeout_ms} ms waiting for an instance of pool '{pool}'")]
    PoolTimeout { pool: String, timeout_ms: u64 },

    /// The pool cannot satisfy demand (repeated creation or validation failure).
    #[error("Pool '{pool}' exhausted: {message}")]
    PoolExhausted { pool: String, message: String },

    /// The pool was shut down while the caller waited.
    #[error("Pool '{pool}' is shut down")]
    PoolClosed { pool: String },

    /// A release named an instance the caller does not own.
    #[error("Instance {instance} of pool '{pool}' is not owned by '{owner}'")]
    NotOwner {
        pool: String,
        instance: u64,
        owner: String,
    },

    /// A sandbox strategy has no free session slot.
    #[error("Sandbox strategy '{strategy}' is at its concurrency limit of {limit}")]
    ConcurrencyLimit { strategy: String, limit: usize },

    /// A sandboxed command breached a hard resource limit.
    #[error("Resource violation: {message}")]
    ResourceViolation { message: String },

    /// A phase or tool failed.
    #[error("Execution failed: {message}")]
    Execution { message: String },

    /// The evaluation verdict did not satisfy the quality gate.
    #[error("Quality gate not met: {message}")]
    EvaluationFailed { message: String },

    /// A state machine refused a transition.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The task was cancelled.
    #[error("Cancelled")]
    Cancelled,

    /// Sandbox infrastructure (Docker, process spawning) failed.
    #[error("Sandbox failure: {message}")]
    Sandbox { message: String },

    /// The task id is already executing.
    #[error("Task '{task_id}' is already running")]
    AlreadyRunning { task_id: String },
}

impl PlatformError {
    /// Creates a `Configuration` error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a `PoolTimeout` error from a `Duration`.
    pub fn pool_timeout(pool: impl Into<String>, timeout: Duration) -> Self {
        Self::PoolTimeout {
            pool: pool.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a `PoolExhausted` error.
    pub fn pool_exhausted(pool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            pool: pool.into(),
            message: message.into(),
        }
    }

    /// Creates a `ResourceViolation` error.
    pub fn violation(message: impl Into<String>) -> Self {
        Self::ResourceViolation {
            message: message.into(),
        }
    }

    /// Creates an `Execution` error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Creates an `EvaluationFailed` error.
    pub fn evaluation_failed(message: impl Into<String>) -> Self {
        Self::EvaluationFailed {
            message: message.into(),
        }
    }

    /// Creates an `InvalidTransition` error.
    pub fn invalid_transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::InvalidTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    /// Creates a `Sandbox` infrastructure error.
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox {
            message: message.into(),
        }
    }

    /// Returns the failure class that drives retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Configuration { .. } | Self::InvalidTransition { .. } | Self::NotOwner { .. } => {
                ErrorClass::Fatal
            }
            Self::PoolTimeout { .. }
            | Self::PoolExhausted { .. }
            | Self::PoolClosed { .. }
            | Self::ConcurrencyLimit { .. }
            | Self::AlreadyRunning { .. } => ErrorClass::Transient,
            Self::ResourceViolation { .. } => ErrorClass::Violation,
            Self::Execution { .. } | Self::Sandbox { .. } => ErrorClass::Execution,
            Self::EvaluationFailed { .. } => ErrorClass::Evaluation,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Returns true if the calling phase may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::Violation | ErrorClass::Execution
        )
    }

    /// Returns true if this is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

/// Convenience alias for results carrying a [`PlatformError`].
pub type PlatformResult<T> = Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_error() {
        let err = PlatformError::pool_timeout("fs", Duration::from_millis(250));
        assert!(matches!(err, PlatformError::PoolTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(
            err.to_string(),
            "Timed out after 250 ms waiting for an instance of pool 'fs'"
        );
    }

    #[test]
    fn test_configuration_error_is_fatal() {
        let err = PlatformError::configuration("unknown strategy 'vm'");
        assert!(err.is_configuration());
        assert!(!err.is_retryable());
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(err.to_string(), "Configuration error: unknown strategy 'vm'");
    }

    #[test]
    fn test_violation_is_retryable_phase_failure() {
        let err = PlatformError::violation("memory 900 MB > 512 MB");
        assert_eq!(err.class(), ErrorClass::Violation);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_evaluation_and_cancel_are_not_retryable() {
        assert!(!PlatformError::evaluation_failed("score 0.2 < 0.8").is_retryable());
        assert!(!PlatformError::Cancelled.is_retryable());
        assert_eq!(PlatformError::Cancelled.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn test_exhausted_is_transient() {
        let err = PlatformError::pool_exhausted("cli", "3 creation failures");
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(err.to_string(), "Pool 'cli' exhausted: 3 creation failures");
    }

    #[test]
    fn test_not_owner_message() {
        let err = PlatformError::NotOwner {
            pool: "fs".to_string(),
            instance: 7,
            owner: "task-b".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Instance 7 of pool 'fs' is not owned by 'task-b'"
        );
    }
}
