//! Shared error taxonomy.
//!
//! Each layer has its own `thiserror` enum. They all classify themselves into
//! an [`ErrorKind`] so callers can decide between fixing a precondition,
//! reloading and retrying, or escalating to an operator without matching on
//! every concrete variant.

use thiserror::Error;

/// Coarse classification shared by every error in the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An invariant, routing rule or ordering rule was broken. Recoverable
    /// once the precondition is fixed or fresh data is supplied.
    RuleViolation,
    /// A stream append did not line up with what is already stored. The
    /// caller must reload the stream and retry the command.
    EntityExists,
    /// A configuration or logic defect (for example a projection that does
    /// not recognise an event routed to it). Needs operator attention.
    Unexpected,
    /// The backing store, checkpoint repository or read-model failed.
    Store,
    /// The operation was cancelled before it completed.
    Cancelled,
}

/// A domain rule rejected an event or a state transition.
///
/// Returned by aggregate reducers and invariant checks.
///
/// ```
/// use tidemark_core::error::RuleViolation;
///
/// let violation = RuleViolation::new("end must be after start");
/// assert_eq!(violation.to_string(), "end must be after start");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RuleViolation {
    message: String,
}

impl RuleViolation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::RuleViolation
    }
}

/// Return early with a [`RuleViolation`] unless `cond` holds.
///
/// ```
/// use tidemark_core::{ensure, error::RuleViolation};
///
/// fn check(seats: u32) -> Result<(), RuleViolation> {
///     ensure!(seats > 0, "a booking needs at least one seat");
///     Ok(())
/// }
///
/// assert!(check(0).is_err());
/// ```
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::RuleViolation::new(format!($($arg)+)).into());
        }
    };
}

/// Boxed error used where a collaborator's own error type is erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
