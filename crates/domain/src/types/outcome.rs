//! Result of a governed call
//!
//! A quota denial and an empty read are both "no value", but only the empty
//! read is worth retrying. Keeping them as separate variants stops callers
//! from conflating the two.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallOutcome<T> {
    /// The call ran and produced a value.
    Value(T),
    /// The call ran but the cloud returned nothing.
    Empty,
    /// The call was suppressed by the daily quota. Never retried.
    Denied,
}

impl<T> CallOutcome<T> {
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied)
    }

    pub fn value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Empty | Self::Denied => None,
        }
    }

    pub fn as_ref(&self) -> CallOutcome<&T> {
        match self {
            Self::Value(v) => CallOutcome::Value(v),
            Self::Empty => CallOutcome::Empty,
            Self::Denied => CallOutcome::Denied,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> CallOutcome<U> {
        match self {
            Self::Value(v) => CallOutcome::Value(f(v)),
            Self::Empty => CallOutcome::Empty,
            Self::Denied => CallOutcome::Denied,
        }
    }

    /// Fallible mapping of the carried value.
    ///
    /// # Errors
    /// Propagates the error returned by `f`.
    pub fn try_map<U, E, F: FnOnce(T) -> Result<U, E>>(self, f: F) -> Result<CallOutcome<U>, E> {
        Ok(match self {
            Self::Value(v) => CallOutcome::Value(f(v)?),
            Self::Empty => CallOutcome::Empty,
            Self::Denied => CallOutcome::Denied,
        })
    }
}
