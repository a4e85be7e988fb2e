#![forbid(unsafe_code)]

//! Error taxonomy for the read path.
//!
//! | Error | Meaning | Who handles it |
//! |-------|---------|----------------|
//! | [`InvalidInputError`] | Malformed state input | Fatal to the read, surfaced to the caller |
//! | [`SuspensionSignal`] | Some tracked values are still pending | Host suspends and re-invokes later |
//! | [`PropagatedValueError`] | A tracked value settled with a failure | Re-raised to the consumer as-is |
//!
//! Nothing here is retried or swallowed. Retrying a failed asynchronous value
//! is the job of whoever produced it.

use std::fmt;
use std::rc::Rc;

use crate::suspense::SuspensionSignal;

/// A shared, cheaply clonable failure carried by a settled pending value.
///
/// The same failure is handed to every consumer observing the value, so it
/// is reference counted rather than owned.
#[derive(Clone)]
pub struct Failure(Rc<dyn std::error::Error + 'static>);

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

impl Failure {
    /// Wrap an arbitrary error.
    pub fn new(error: impl std::error::Error + 'static) -> Self {
        Self(Rc::new(error))
    }

    /// Failure carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// The wrapped error.
    #[must_use]
    pub fn get_ref(&self) -> &(dyn std::error::Error + 'static) {
        &*self.0
    }

    /// Whether both handles point at the same failure instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Failure").field(&self.0.to_string()).finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// The state input handed to a reader could not be classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid state input: {reason}")]
pub struct InvalidInputError {
    reason: &'static str,
}

impl InvalidInputError {
    pub(crate) const fn new(reason: &'static str) -> Self {
        Self { reason }
    }

    /// Why the input was rejected.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

/// A tracked asynchronous value settled with a failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{failure}")]
pub struct PropagatedValueError {
    index: usize,
    #[source]
    failure: Failure,
}

impl PropagatedValueError {
    pub(crate) fn new(index: usize, failure: Failure) -> Self {
        Self { index, failure }
    }

    /// Position of the failing handle in the normalized input.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The failure exactly as the pending value reported it.
    #[must_use]
    pub fn failure(&self) -> &Failure {
        &self.failure
    }

    #[must_use]
    pub fn into_failure(self) -> Failure {
        self.failure
    }
}

/// Outcome of a failed `use_value` / `use_loadable` call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),
    /// Not a failure: the host must suspend and retry once the signal settles.
    #[error("{0}")]
    Suspended(SuspensionSignal),
    #[error(transparent)]
    Value(#[from] PropagatedValueError),
}

impl ReadError {
    /// Whether this is a suspension rather than a real failure.
    #[must_use]
    pub fn is_suspension(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }

    /// The suspension signal, if this is one.
    #[must_use]
    pub fn as_suspension(&self) -> Option<&SuspensionSignal> {
        match self {
            Self::Suspended(signal) => Some(signal),
            _ => None,
        }
    }
}

impl From<SuspensionSignal> for ReadError {
    fn from(signal: SuspensionSignal) -> Self {
        Self::Suspended(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn failure_displays_inner_error() {
        let failure = Failure::new(DiskError);
        assert_eq!(failure.to_string(), "disk on fire");
        assert_eq!(Failure::msg("boom").to_string(), "boom");
    }

    #[test]
    fn failure_clones_share_identity() {
        let a = Failure::msg("x");
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&Failure::msg("x")));
    }

    #[test]
    fn propagated_error_is_reraised_as_is() {
        let failure = Failure::new(DiskError);
        let err = ReadError::from(PropagatedValueError::new(2, failure.clone()));
        assert_eq!(err.to_string(), "disk on fire");
        assert!(!err.is_suspension());
        match err {
            ReadError::Value(inner) => {
                assert_eq!(inner.index(), 2);
                assert!(inner.failure().ptr_eq(&failure));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_input_message() {
        let err = ReadError::from(InvalidInputError::new("empty sequence"));
        assert_eq!(err.to_string(), "invalid state input: empty sequence");
        assert!(err.as_suspension().is_none());
    }
}
