//! Generic retry policy and executor.
//!
//! Retrying is split into a pure decision side and a driving side:
//!
//! - [`RetryPolicy`] answers "can this attempt be retried, and after how
//!   long" from an immutable [`RetryContext`] snapshot. The bundled
//!   [`BackoffPolicy`] derives both answers from a
//!   [`RetryConfig`](crate::config::RetryConfig), so policies are trivially
//!   unit-testable.
//! - [`execute`] drives an arbitrary fallible async operation through a
//!   policy until success, a non-retryable failure, or exhaustion.
//!
//! # Backoff shapes
//!
//! With attempt counts 1-based:
//!
//! ```text
//! FIXED:       interval = base
//! LINEAR:      interval = min(base * attempt, max)
//! EXPONENTIAL: interval = min(base * multiplier^(attempt - 1), max)
//! ```
//!
//! For example base=1000ms, multiplier=2, max=30000ms yields
//! 1000, 2000, 4000, 8000, 16000, 30000 (capped) for attempts 1..=6.
//!
//! Waits between attempts are cancellable: a shutdown token aborts the sleep
//! and the operation fails with [`ClientError::Interrupted`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BackoffKind, RetryConfig};
use crate::error::{ClientError, TransportError};

/// Immutable snapshot of one failed attempt.
///
/// Created fresh by the executor on every failure; never mutated, only
/// superseded by the next attempt's context.
#[derive(Debug, Clone)]
pub struct RetryContext {
    attempt_count: u32,
    first_attempt: Instant,
    last_error: Option<TransportError>,
    tag: String,
}

impl RetryContext {
    /// Builds a context for the given attempt.
    ///
    /// `tag` is an opaque operation label (target topic, server address)
    /// used only for logging.
    pub fn new(
        attempt_count: u32,
        first_attempt: Instant,
        last_error: Option<TransportError>,
        tag: &str,
    ) -> Self {
        Self {
            attempt_count,
            first_attempt,
            last_error,
            tag: tag.to_string(),
        }
    }

    /// 1-based attempt count; the first try is attempt 1.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// When the first attempt started; preserved across retries.
    pub fn first_attempt(&self) -> Instant {
        self.first_attempt
    }

    /// The most recent failure. None only before the first failure.
    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    /// The operation's diagnostic tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// Decision interface consulted by the executor after each failure.
pub trait RetryPolicy: Send + Sync {
    /// Whether another attempt should be made for this context.
    fn can_retry(&self, ctx: &RetryContext) -> bool;

    /// How long to wait before the next attempt.
    fn next_interval(&self, ctx: &RetryContext) -> Duration;

    /// Diagnostic hook invoked just before a retry wait. Has no effect on
    /// control flow.
    fn before_retry(&self, _ctx: &RetryContext) {}
}

/// Computes the backoff interval for a 1-based attempt count.
///
/// Pure function of `(attempt, config)`; linear and exponential results are
/// clamped to `config.max_interval_ms`.
pub fn interval_for(attempt: u32, config: &RetryConfig) -> Duration {
    let base = config.base_interval_ms;
    let max = config.max_interval_ms;
    let millis = match config.backoff {
        BackoffKind::Fixed => base,
        BackoffKind::Linear => base.saturating_mul(u64::from(attempt)).min(max),
        BackoffKind::Exponential => {
            let raw = base as f64 * config.multiplier.powi(attempt.saturating_sub(1) as i32);
            if raw >= max as f64 {
                max
            } else {
                raw as u64
            }
        }
    };
    Duration::from_millis(millis)
}

/// Config-driven retry policy for one operation class.
///
/// Two independent instances exist per client: one built from the connect
/// retry configuration and one from the publish configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: RetryConfig,
    class: &'static str,
}

impl BackoffPolicy {
    /// Policy for connect operations.
    pub fn connect(config: RetryConfig) -> Self {
        Self {
            config,
            class: "connect",
        }
    }

    /// Policy for publish operations.
    pub fn publish(config: RetryConfig) -> Self {
        Self {
            config,
            class: "publish",
        }
    }

    /// The retry configuration backing this policy.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl RetryPolicy for BackoffPolicy {
    fn can_retry(&self, ctx: &RetryContext) -> bool {
        if !self.config.enabled {
            return false;
        }

        if ctx.attempt_count() >= self.config.max_attempts {
            warn!(
                "{} retry for '{}' exceeded maximum attempts: {}",
                self.class,
                ctx.tag(),
                self.config.max_attempts
            );
            return false;
        }

        if let Some(err) = ctx.last_error() {
            if !err.is_retryable() {
                warn!(
                    "{} failure for '{}' is not retryable: {}",
                    self.class,
                    ctx.tag(),
                    err
                );
                return false;
            }
        }

        true
    }

    fn next_interval(&self, ctx: &RetryContext) -> Duration {
        interval_for(ctx.attempt_count(), &self.config)
    }

    fn before_retry(&self, ctx: &RetryContext) {
        info!(
            "{} retry attempt {} for '{}' in {} ms",
            self.class,
            ctx.attempt_count() + 1,
            ctx.tag(),
            self.next_interval(ctx).as_millis()
        );
    }
}

/// Drives a fallible async operation through a retry policy.
///
/// The attempt counter starts at 1. On success the result is returned
/// immediately. On failure a fresh [`RetryContext`] is built (first-attempt
/// timestamp preserved) and the policy consulted; if it refuses, the whole
/// operation fails with [`ClientError::RetryExhausted`] wrapping the last
/// failure and the attempt count. Otherwise the executor waits for the
/// policy's interval, racing the wait against `cancel`, and loops.
///
/// There is no wall-clock cap independent of the attempt budget; "keep
/// trying for a long time" is expressed through a large `max_attempts` with
/// a capped backoff.
pub async fn execute<T, F, Fut>(
    policy: &dyn RetryPolicy,
    cancel: &CancellationToken,
    tag: &str,
    mut operation: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let first_attempt = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let ctx = RetryContext::new(attempt, first_attempt, Some(err.clone()), tag);

                if !policy.can_retry(&ctx) {
                    error!("operation '{}' failed after {} attempts: {}", tag, attempt, err);
                    return Err(ClientError::RetryExhausted {
                        attempts: attempt,
                        source: err,
                    });
                }

                policy.before_retry(&ctx);
                let wait = policy.next_interval(&ctx);

                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!("retry wait for '{}' interrupted by shutdown", tag);
                        return Err(ClientError::Interrupted);
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
}
