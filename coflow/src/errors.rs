//! Error types for the coflow coordination layer.
//!
//! Errors are cheap to clone so a single failure can be fanned out to every
//! cancellation waiter and embedded in an [`crate::bracket::ExitCase`].
//! Arbitrary operation errors are wrapped behind an [`anyhow::Error`].

use std::sync::Arc;
use thiserror::Error;

use crate::breaker::ExecutionRejected;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoflowError>;

/// The main error type for coflow operations.
#[derive(Debug, Clone, Error)]
pub enum CoflowError {
    /// The computation was cancelled through its connection.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A circuit breaker refused to run the protected operation.
    #[error("{0}")]
    Rejected(#[from] ExecutionRejected),

    /// An argument failed validation before any state was mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A promise was completed a second time. Recoverable.
    #[error("promise already fulfilled")]
    AlreadyFulfilled,

    /// Two or more failures occurred on one exit path.
    ///
    /// The primary (triggering) error renders; secondary errors are kept as
    /// suppressed causes and never dropped.
    #[error("{primary}")]
    Composite {
        /// The triggering error.
        primary: Box<CoflowError>,
        /// Errors that lost the race, in the order they were observed.
        suppressed: Vec<CoflowError>,
    },

    /// An error raised by a user-supplied operation.
    #[error("{0}")]
    Operation(Arc<anyhow::Error>),

    /// A broken internal invariant that is not a programmer-usage error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoflowError {
    /// Creates a cancellation error with a reason.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    /// Wraps an arbitrary message as an operation error.
    #[must_use]
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation(Arc::new(anyhow::anyhow!(message.into())))
    }

    /// Composes `self` (primary) with a secondary error.
    ///
    /// If `self` is already composite the secondary error is appended, so
    /// chained composition keeps one primary and a flat suppressed list.
    #[must_use]
    pub fn compose(self, secondary: CoflowError) -> Self {
        match self {
            Self::Composite {
                primary,
                mut suppressed,
            } => {
                suppressed.push(secondary);
                Self::Composite {
                    primary,
                    suppressed,
                }
            }
            primary => Self::Composite {
                primary: Box::new(primary),
                suppressed: vec![secondary],
            },
        }
    }

    /// Composes a primary error with any number of secondary errors.
    ///
    /// Returns the primary untouched when `secondary` is empty.
    #[must_use]
    pub fn compose_all(primary: CoflowError, secondary: Vec<CoflowError>) -> Self {
        secondary.into_iter().fold(primary, CoflowError::compose)
    }

    /// Returns the triggering error, unwrapping composites.
    #[must_use]
    pub fn primary(&self) -> &CoflowError {
        match self {
            Self::Composite { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// Returns the suppressed causes, empty for non-composite errors.
    #[must_use]
    pub fn suppressed(&self) -> &[CoflowError] {
        match self {
            Self::Composite { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Returns whether this error represents a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.primary(), Self::Cancelled(_))
    }

    /// Returns whether this error is a circuit-breaker rejection.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self.primary(), Self::Rejected(_))
    }
}

impl From<anyhow::Error> for CoflowError {
    fn from(err: anyhow::Error) -> Self {
        Self::Operation(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_keeps_primary() {
        let e1 = CoflowError::operation("use failed");
        let e2 = CoflowError::operation("release failed");
        let composed = e1.compose(e2);

        assert_eq!(composed.primary().to_string(), "use failed");
        assert_eq!(composed.suppressed().len(), 1);
        assert_eq!(composed.suppressed()[0].to_string(), "release failed");
    }

    #[test]
    fn test_chained_compose_stays_flat() {
        let composed = CoflowError::operation("first")
            .compose(CoflowError::operation("second"))
            .compose(CoflowError::operation("third"));

        assert_eq!(composed.primary().to_string(), "first");
        assert_eq!(composed.suppressed().len(), 2);
    }

    #[test]
    fn test_compose_all_empty_is_identity() {
        let composed = CoflowError::compose_all(CoflowError::operation("only"), Vec::new());
        assert!(composed.suppressed().is_empty());
        assert_eq!(composed.to_string(), "only");
    }

    #[test]
    fn test_is_cancelled_sees_through_composite() {
        let composed =
            CoflowError::cancelled("stop").compose(CoflowError::operation("cleanup failed"));
        assert!(composed.is_cancelled());
    }

    #[test]
    fn test_display_renders_primary() {
        let composed =
            CoflowError::operation("boom").compose(CoflowError::operation("ignored in display"));
        assert_eq!(composed.to_string(), "boom");
    }
}
