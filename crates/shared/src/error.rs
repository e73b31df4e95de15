//! Persistence error taxonomy.
//!
//! Every failure coming out of the mapper is translated into one of these
//! kinds at the session boundary. The payload is the rendered cause, so the
//! error can be stored and handed out again by a failed session.

use thiserror::Error;

/// Result type alias using `PersistError`.
pub type PersistResult<T> = Result<T, PersistError>;

/// Persistence error kinds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    /// Configuration or startup failure. Fatal.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The session was used in a state that does not allow the operation.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The persisted row changed or vanished since it was read.
    #[error("Stale state: {0}")]
    StaleState(String),

    /// A unique, foreign key, not-null or check constraint rejected the write.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Any other database or infrastructure failure.
    #[error("Database error: {0}")]
    Database(String),
}

impl PersistError {
    /// Returns a stable code for logs and callers that match on strings.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::IllegalState(_) => "ILLEGAL_STATE",
            Self::StaleState(_) => "STALE_STATE",
            Self::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Whether re-running the business operation may succeed.
    ///
    /// Only optimistic-concurrency conflicts qualify.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleState(_))
    }

    /// Creates an illegal state error.
    #[must_use]
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

impl From<config::ConfigError> for PersistError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
