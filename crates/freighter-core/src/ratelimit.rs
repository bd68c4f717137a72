//! Client-side request throttling
//!
//! All fetch workers share a token-bucket limiter so that the pipeline
//! never exceeds the configured burst per period against a web API,
//! regardless of worker count. Limiters live in an explicit registry owned
//! by the pipeline rather than in process-wide state, so tests and
//! concurrent pipelines stay independent.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A limiter shared by every worker fetching for one request (or the whole
/// pipeline).
pub type SharedRateLimiter = Arc<DefaultDirectRateLimiter>;

/// Errors produced by rate-limit configuration or waiting
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// A required configuration field is missing or zero
    #[error("missing rate limit field: {0}")]
    MissingField(&'static str),

    /// The run was cancelled while waiting for a token
    #[error("deadline exceeded waiting for rate limiter")]
    DeadlineExceeded,
}

/// Burst/period configuration for a token-bucket limiter
///
/// `burst` requests are allowed per `period_secs` seconds; tokens replenish
/// evenly across the period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Number of requests allowed per period
    pub burst: u32,

    /// Length of the period in seconds
    pub period_secs: u64,
}

impl RateLimitConfig {
    pub fn new(burst: u32, period_secs: u64) -> Self {
        Self { burst, period_secs }
    }

    /// Validate that both fields are present and non-zero.
    ///
    /// # Errors
    ///
    /// - `MissingField` - `burst` or `period_secs` is zero
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.burst == 0 {
            return Err(RateLimitError::MissingField("burst"));
        }

        if self.period_secs == 0 {
            return Err(RateLimitError::MissingField("period"));
        }

        Ok(())
    }

    /// Build a limiter replenishing `burst` tokens evenly over the period.
    pub fn build(&self) -> Result<SharedRateLimiter, RateLimitError> {
        self.validate()?;

        let burst =
            NonZeroU32::new(self.burst).ok_or(RateLimitError::MissingField("burst"))?;
        let replenish = Duration::from_millis(self.period_secs * 1_000 / u64::from(self.burst));
        let quota = Quota::with_period(replenish)
            .ok_or(RateLimitError::MissingField("period"))?
            .allow_burst(burst);

        Ok(Arc::new(RateLimiter::direct(quota)))
    }
}

/// Registry of limiters for one pipeline run
///
/// Holds the pipeline-wide limiter and builds per-request overrides; every
/// chunk flattened from one request shares that request's limiter.
#[derive(Clone)]
pub struct RateLimiterRegistry {
    default: SharedRateLimiter,
}

impl RateLimiterRegistry {
    /// Build the registry from the pipeline-wide configuration.
    pub fn new(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        Ok(Self {
            default: config.build()?,
        })
    }

    /// Limiter for one request: its override when configured, otherwise the
    /// shared pipeline limiter.
    pub fn limiter_for(
        &self,
        request_override: Option<&RateLimitConfig>,
    ) -> Result<SharedRateLimiter, RateLimitError> {
        match request_override {
            Some(config) => config.build(),
            None => Ok(Arc::clone(&self.default)),
        }
    }
}

/// Wait for a token, or fail with `DeadlineExceeded` if the run is
/// cancelled first. This is the pipeline's single intentional throttling
/// point.
pub async fn wait(
    limiter: &SharedRateLimiter,
    cancel: &CancellationToken,
) -> Result<(), RateLimitError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RateLimitError::DeadlineExceeded),
        _ = limiter.until_ready() => Ok(()),
    }
}
