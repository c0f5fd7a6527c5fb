//! Shared primitives for all Rust crates in Cadence.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across Cadence crates.
pub type AppResult<T> = Result<T, AppError>;

/// A validated non-empty UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NonEmptyString(String);

impl NonEmptyString {
    /// Creates a validated non-empty string.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "value must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

impl std::fmt::Display for NonEmptyString {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Common application error categories.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid input or violated invariant.
    #[error("validation error: {0}")]
    Validation(String),

    /// Requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write operation conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A lease could not be obtained within the configured backoff budget.
    #[error("lock not obtained: {0}")]
    Contention(String),

    /// The shared key-value store could not be reached or rejected a call.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Internal unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns true when the error is a lock contention timeout.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention(_))
    }

    /// Returns true when retrying later may succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Contention(_) | Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::{AppError, NonEmptyString};

    #[test]
    fn non_empty_string_rejects_whitespace() {
        let result = NonEmptyString::new("   ");
        assert!(result.is_err());
    }

    #[test]
    fn non_empty_string_keeps_original_value() {
        let value = NonEmptyString::new("res-1");
        assert!(value.is_ok());
        assert_eq!(value.unwrap_or_else(|_| unreachable!()).as_str(), "res-1");
    }

    #[test]
    fn contention_is_recoverable_but_validation_is_not() {
        let contention = AppError::Contention("res-1".to_owned());
        assert!(contention.is_contention());
        assert!(contention.is_recoverable());

        let unavailable = AppError::Unavailable("connection refused".to_owned());
        assert!(!unavailable.is_contention());
        assert!(unavailable.is_recoverable());

        let validation = AppError::Validation("bad cron".to_owned());
        assert!(!validation.is_recoverable());
    }

    #[test]
    fn contention_message_names_the_key() {
        let error = AppError::Contention("res-1".to_owned());
        assert_eq!(error.to_string(), "lock not obtained: res-1");
    }
}
