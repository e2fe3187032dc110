//! Resilience patterns for transient failures
//!
//! [`RetryManager`] wraps a single operation with bounded attempts and
//! exponential backoff. It is generic over the operation's error type so the
//! governance layer can retry device-cloud calls while callers outside it can
//! reuse the same policy.

pub mod retry;

pub use retry::{
    RetryConfig, RetryConfigBuilder, RetryError, RetryManager, RetryOutcome, RetryResult,
};
