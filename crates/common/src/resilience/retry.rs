//! Bounded retry with exponential backoff
//!
//! Operations yield `Result<Option<T>, E>`. A failure (`Err`) and an empty
//! result (`Ok(None)`) are both retryable: each consumes an attempt and
//! triggers the backoff sleep before the next try.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during retry operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the error from the final attempt
    #[error("operation failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    /// The operation failed with an error the caller marked non-retryable
    #[error("operation failed with non-retryable error: {last_error}")]
    NonRetryable { attempts: u32, last_error: E },

    /// The final attempt produced an empty result
    #[error("operation produced an empty result after {attempts} attempts")]
    EmptyResult { attempts: u32 },

    /// The retry configuration is invalid
    #[error("invalid retry configuration: {message}")]
    InvalidConfiguration { message: String },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::NonRetryable { attempts, .. }
            | Self::EmptyResult { attempts } => *attempts,
            Self::InvalidConfiguration { .. } => 0,
        }
    }

    /// The error from the final attempt, if the final attempt failed.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { last_error, .. } | Self::NonRetryable { last_error, .. } => {
                Some(last_error)
            }
            _ => None,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Outcome of a retry execution including result and summary statistics.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: RetryResult<T, E>,
    pub attempts: u32,
    /// Every backoff delay slept, in order.
    pub delays: Vec<Duration>,
    pub first_attempt_time: Instant,
}

impl<T, E> RetryOutcome<T, E> {
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }

    /// Sum of all backoff delays.
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }

    /// Get the total elapsed time from first attempt to completion.
    pub fn total_elapsed(&self) -> Duration {
        self.first_attempt_time.elapsed()
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Cap applied to every computed delay
    pub max_delay: Duration,
    /// Multiplier applied per additional attempt
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Delay slept after failed attempt `attempt` (1-based):
    /// `min(initial_delay * backoff_factor^(attempt - 1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let cap_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis(delay_ms.min(cap_ms) as u64)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RetryError<()>> {
        if self.max_attempts == 0 {
            return Err(RetryError::InvalidConfiguration {
                message: "max_attempts must be greater than 0".to_string(),
            });
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(RetryError::InvalidConfiguration {
                message: format!("backoff_factor must be >= 1.0, got {}", self.backoff_factor),
            });
        }
        if self.initial_delay > self.max_delay {
            return Err(RetryError::InvalidConfiguration {
                message: "initial_delay must not exceed max_delay".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    pub fn build(self) -> Result<RetryConfig, RetryError<()>> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Executes operations with bounded attempts and exponential backoff
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    /// Create a manager from a validated configuration.
    pub fn new(config: RetryConfig) -> Result<Self, RetryError<()>> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it yields a value or attempts are exhausted.
    ///
    /// `context` names the operation in log output.
    ///
    /// # Errors
    /// `RetryError::Exhausted` when the final attempt failed,
    /// `RetryError::EmptyResult` when it produced no value.
    pub async fn execute<F, Fut, T, E>(&self, operation: F, context: &str) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: fmt::Display,
    {
        self.execute_with_outcome(operation, context).await.into_result()
    }

    /// Like [`RetryManager::execute`], but stops at the first error for
    /// which `retryable` returns `false`.
    ///
    /// # Errors
    /// As [`RetryManager::execute`], plus `RetryError::NonRetryable`.
    pub async fn execute_if<F, Fut, T, E, R>(
        &self,
        operation: F,
        context: &str,
        retryable: R,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: fmt::Display,
        R: Fn(&E) -> bool,
    {
        self.execute_with_outcome_if(operation, context, retryable).await.into_result()
    }

    /// Like [`RetryManager::execute`], also reporting attempts and delays.
    pub async fn execute_with_outcome<F, Fut, T, E>(
        &self,
        operation: F,
        context: &str,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: fmt::Display,
    {
        self.execute_with_outcome_if(operation, context, |_: &E| true).await
    }

    #[instrument(skip(self, operation, retryable), fields(max_attempts = self.config.max_attempts))]
    async fn execute_with_outcome_if<F, Fut, T, E, R>(
        &self,
        mut operation: F,
        context: &str,
        retryable: R,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: fmt::Display,
        R: Fn(&E) -> bool,
    {
        let first_attempt_time = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut delays = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(context, attempt, max_attempts, "Executing operation");

            let failure = match operation().await {
                Ok(Some(value)) => {
                    if attempt > 1 {
                        info!(context, attempt, "Operation succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        delays,
                        first_attempt_time,
                    };
                }
                Ok(None) => Attempt::Empty,
                Err(err) if !retryable(&err) => {
                    warn!(context, attempt, error = %err, "Operation failed with non-retryable error");
                    return RetryOutcome {
                        result: Err(RetryError::NonRetryable { attempts: attempt, last_error: err }),
                        attempts: attempt,
                        delays,
                        first_attempt_time,
                    };
                }
                Err(err) => Attempt::Failed(err),
            };

            if attempt >= max_attempts {
                let result = match failure {
                    Attempt::Empty => {
                        error!(context, attempts = attempt, "Operation produced an empty result");
                        Err(RetryError::EmptyResult { attempts: attempt })
                    }
                    Attempt::Failed(last_error) => {
                        error!(
                            context,
                            attempts = attempt,
                            error = %last_error,
                            "All retry attempts exhausted"
                        );
                        Err(RetryError::Exhausted { attempts: attempt, last_error })
                    }
                };
                return RetryOutcome { result, attempts: attempt, delays, first_attempt_time };
            }

            let delay = self.config.delay_for_attempt(attempt);
            match &failure {
                Attempt::Empty => warn!(
                    context,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Operation returned an empty result, retrying"
                ),
                Attempt::Failed(err) => warn!(
                    context,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                ),
            }

            tokio::time::sleep(delay).await;
            delays.push(delay);
        }
    }
}

enum Attempt<E> {
    Empty,
    Failed(E),
}
