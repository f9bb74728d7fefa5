//! The resilience pipeline.
//!
//! Every database, object-store, and backend call runs through a
//! [`Pipeline`]: transient failures retry with backoff and jitter, up to
//! the configured attempt limit; validation, not-found, precondition, and
//! fatal backend failures surface immediately. Ambiguous failures retry
//! only when a per-failure override opts them in, on the assumption that
//! the wrapped call is idempotent. Waits between attempts park on the
//! caller's cancellation token, so shutdown interrupts a backoff promptly.

use tracing::debug;
use tyger_retry::{
    FailureKind, PerFailureConfig, RetryPolicy, RetryStrategyConfig, backoff_delay,
    config_for_failure,
};

use crate::error::{Error, Result};
use crate::shutdown::Cancellation;

#[derive(Clone)]
pub struct Pipeline {
    config: RetryStrategyConfig,
    per_failure: PerFailureConfig,
}

impl Pipeline {
    pub fn new(config: RetryStrategyConfig, per_failure: PerFailureConfig) -> Self {
        Self {
            config,
            per_failure,
        }
    }

    pub fn from_policy(policy: RetryPolicy) -> Self {
        Self::new(policy.to_config(), PerFailureConfig::default())
    }

    /// Run an operation with retries, without an external cancellation
    /// signal.
    pub fn run<T>(&self, op: impl FnMut() -> Result<T>) -> Result<T> {
        self.run_cancellable(&Cancellation::new(), op)
    }

    /// Run an operation with retries, giving up as soon as `cancel` fires.
    pub fn run_cancellable<T>(
        &self,
        cancel: &Cancellation,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt: u32 = 1;
        loop {
            cancel.check()?;
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let kind = err.failure_kind();
            let config = match kind {
                FailureKind::Transient => {
                    config_for_failure(&self.config, Some(&self.per_failure), kind)
                }
                // Ambiguous and permanent failures retry only with an
                // explicit override.
                FailureKind::Ambiguous | FailureKind::Permanent => {
                    match self.per_failure.override_for(kind) {
                        Some(config) => config.clone(),
                        None => return Err(err),
                    }
                }
            };
            if attempt >= config.max_attempts {
                return Err(err);
            }

            let delay = backoff_delay(&config, attempt);
            debug!(attempt, ?delay, error = %err, "retrying after transient failure");
            if !cancel.sleep(delay) {
                return Err(Error::Cancelled);
            }
            attempt += 1;
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::from_policy(RetryPolicy::Default)
    }
}

/// A strategy with no delays, for wrapping calls whose failures should
/// still classify but never block a test.
#[cfg(test)]
pub(crate) fn immediate(max_attempts: u32) -> Pipeline {
    Pipeline::new(
        RetryStrategyConfig {
            strategy: tyger_retry::RetryStrategyType::Immediate,
            max_attempts,
            base_delay: std::time::Duration::ZERO,
            max_delay: std::time::Duration::ZERO,
            jitter: 0.0,
        },
        PerFailureConfig::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn transient_failures_retry_until_success() {
        let attempts = AtomicU32::new(0);
        let result = immediate(5).run(|| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transient("socket reset"))
            } else {
                Ok("up")
            }
        });
        assert_eq!(result.unwrap(), "up");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn transient_failures_exhaust_the_attempt_limit() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = immediate(3).run(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::transient("still down"))
        });
        assert!(matches!(result, Err(Error::BackendTransient(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn permanent_failures_surface_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = immediate(5).run(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::validation("bad tag"))
        });
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ambiguous_failures_retry_only_with_an_override() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = immediate(5).run(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Internal(anyhow::anyhow!("wire dropped mid-call")))
        });
        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let mut per_failure = PerFailureConfig::default();
        per_failure.ambiguous = Some(RetryStrategyConfig {
            strategy: tyger_retry::RetryStrategyType::Immediate,
            max_attempts: 2,
            base_delay: std::time::Duration::ZERO,
            max_delay: std::time::Duration::ZERO,
            jitter: 0.0,
        });
        let pipeline = Pipeline::new(immediate(5).config, per_failure);

        let attempts = AtomicU32::new(0);
        let result: Result<()> = pipeline.run(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Internal(anyhow::anyhow!("wire dropped mid-call")))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn per_failure_override_bounds_transient_attempts() {
        let mut per_failure = PerFailureConfig::default();
        per_failure.transient = Some(RetryStrategyConfig {
            strategy: tyger_retry::RetryStrategyType::Immediate,
            max_attempts: 2,
            base_delay: std::time::Duration::ZERO,
            max_delay: std::time::Duration::ZERO,
            jitter: 0.0,
        });
        let pipeline = Pipeline::new(RetryPolicy::Default.to_config(), per_failure);

        let attempts = AtomicU32::new(0);
        let result: Result<()> = pipeline.run(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::transient("down"))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancellation_stops_the_pipeline_before_the_next_attempt() {
        let cancel = Cancellation::new();
        cancel.cancel();
        let attempts = AtomicU32::new(0);
        let result: Result<()> = immediate(5).run_cancellable(&cancel, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::transient("down"))
        });
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
