//! Backoff strategies and failure classification for the tyger control
//! plane.
//!
//! This crate holds the policy vocabulary of the resilience pipeline:
//! backoff strategies (immediate, exponential, linear, constant), jitter to
//! keep replicas from retrying in lockstep, failure classification, and
//! per-failure-kind overrides. The pipeline itself lives in the core crate,
//! where it can honor cancellation tokens; this crate only answers "should
//! a retry happen, and after how long".
//!
//! # Example
//!
//! ```
//! use tyger_retry::{RetryPolicy, RetryStrategyConfig, backoff_delay};
//! use std::time::Duration;
//!
//! // Use a predefined policy
//! let config = RetryPolicy::Default.to_config();
//! let delay = backoff_delay(&config, 2);
//! println!("retry after: {:?}", delay);
//!
//! // Custom configuration
//! let custom = RetryStrategyConfig {
//!     max_attempts: 5,
//!     base_delay: Duration::from_secs(1),
//!     max_delay: Duration::from_secs(30),
//!     ..Default::default()
//! };
//! assert!(backoff_delay(&custom, 1) >= Duration::from_millis(500));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries
    Immediate,
    /// Exponential backoff: delay doubles each attempt (default)
    #[default]
    Exponential,
    /// Linear backoff: delay increases linearly each attempt
    Linear,
    /// Constant delay: same delay every attempt
    Constant,
}

/// Predefined retry policies for the pipelines the control plane runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Default behavior for backend and object-store calls
    #[default]
    Default,
    /// Short, dense retries for database round-trips
    Database,
    /// Few, widely spaced retries for data-plane operations
    DataPlane,
    /// Fully custom configuration via retry settings
    Custom,
}

impl RetryPolicy {
    /// Get the retry configuration for this policy.
    pub fn to_config(&self) -> RetryStrategyConfig {
        match self {
            RetryPolicy::Default => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 6,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(120),
                jitter: 0.5,
            },
            RetryPolicy::Database => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 6,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(15),
                jitter: 0.3,
            },
            RetryPolicy::DataPlane => RetryStrategyConfig {
                strategy: RetryStrategyType::Linear,
                max_attempts: 3,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(60),
                jitter: 0.1,
            },
            RetryPolicy::Custom => RetryStrategyConfig::default(),
        }
    }
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    /// Strategy type for calculating delay between retries.
    #[serde(default)]
    pub strategy: RetryStrategyType,
    /// Maximum number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Maximum delay cap for backoff.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor for randomized delays (0.0 = no jitter, 1.0 = full jitter).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    6
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}

fn default_jitter() -> f64 {
    0.5
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Failure classification for retry decisions.
///
/// Only transient failures are retried by default; ambiguous failures (the
/// operation may have taken effect) retry only when a per-failure override
/// opts in; permanent failures surface immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The failure is transient and the call should be retried
    #[default]
    Transient,
    /// The outcome is unknown (the call may have succeeded)
    Ambiguous,
    /// The failure is permanent and retrying cannot help
    Permanent,
}

/// Per-failure-kind retry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerFailureConfig {
    /// Retry configuration for transient failures (network faults, throttling).
    #[serde(default)]
    pub transient: Option<RetryStrategyConfig>,
    /// Retry configuration for ambiguous failures. Setting this opts
    /// ambiguous failures into retries.
    #[serde(default)]
    pub ambiguous: Option<RetryStrategyConfig>,
    /// Retry configuration for permanent failures. Permanent failures are
    /// not retried unless this is set explicitly.
    #[serde(default)]
    pub permanent: Option<RetryStrategyConfig>,
}

impl PerFailureConfig {
    /// The explicit override for a failure kind, if one is configured.
    pub fn override_for(&self, kind: FailureKind) -> Option<&RetryStrategyConfig> {
        match kind {
            FailureKind::Transient => self.transient.as_ref(),
            FailureKind::Ambiguous => self.ambiguous.as_ref(),
            FailureKind::Permanent => self.permanent.as_ref(),
        }
    }
}

/// The delay to wait after a failed attempt before retrying.
///
/// `attempt` is the 1-indexed number of the attempt that just failed. The
/// strategy multiplier is capped so exponential growth saturates instead of
/// overflowing, and the result never exceeds `max_delay` before jitter.
///
/// # Example
///
/// ```
/// use tyger_retry::{RetryStrategyConfig, RetryStrategyType, backoff_delay};
/// use std::time::Duration;
///
/// let config = RetryStrategyConfig {
///     strategy: RetryStrategyType::Exponential,
///     base_delay: Duration::from_secs(1),
///     max_delay: Duration::from_secs(60),
///     jitter: 0.0,
///     max_attempts: 10,
/// };
///
/// assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
/// assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
/// ```
pub fn backoff_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let multiplier: u32 = match config.strategy {
        RetryStrategyType::Immediate => return Duration::ZERO,
        RetryStrategyType::Exponential => 1u32 << attempt.saturating_sub(1).min(16),
        RetryStrategyType::Linear => attempt,
        RetryStrategyType::Constant => 1,
    };
    let delay = config.base_delay.saturating_mul(multiplier).min(config.max_delay);
    jittered(delay, config.jitter)
}

/// Scale a delay by a random factor in `[1 - jitter, 1 + jitter]`.
fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    use rand::RngExt;
    let factor = 1.0 - jitter + rand::rng().random::<f64>() * 2.0 * jitter;
    delay.mul_f64(factor.max(0.0))
}

/// Get the retry configuration for a failure kind, falling back to the
/// default configuration when no override is present.
pub fn config_for_failure(
    default_config: &RetryStrategyConfig,
    per_failure: Option<&PerFailureConfig>,
    kind: FailureKind,
) -> RetryStrategyConfig {
    per_failure
        .and_then(|p| p.override_for(kind))
        .cloned()
        .unwrap_or_else(|| default_config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_pipeline_profile() {
        let config = RetryPolicy::Default.to_config();
        assert_eq!(config.strategy, RetryStrategyType::Exponential);
        assert_eq!(config.max_attempts, 6);
        assert_eq!(config.base_delay, Duration::from_secs(2));
        assert_eq!(config.max_delay, Duration::from_secs(120));
    }

    #[test]
    fn database_policy_is_denser_than_default() {
        let config = RetryPolicy::Database.to_config();
        assert_eq!(config.max_attempts, 6);
        assert!(config.base_delay < RetryPolicy::Default.to_config().base_delay);
    }

    #[test]
    fn immediate_strategy_never_waits() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            max_attempts: 3,
        };

        assert_eq!(backoff_delay(&config, 1), Duration::ZERO);
        assert_eq!(backoff_delay(&config, 5), Duration::ZERO);
    }

    #[test]
    fn exponential_delays_double_per_attempt() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            max_attempts: 10,
        };

        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(8));
    }

    #[test]
    fn linear_delays_grow_by_the_base() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Linear,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            max_attempts: 10,
        };

        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(6));
    }

    #[test]
    fn delays_saturate_at_the_cap() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(15),
            jitter: 0.0,
            max_attempts: 10,
        };

        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(15));
        // Deep attempt numbers saturate the shift rather than overflowing.
        assert_eq!(backoff_delay(&config, 60), Duration::from_secs(15));
    }

    #[test]
    fn jittered_delays_stay_in_band() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Constant,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
            max_attempts: 3,
        };

        for _ in 0..100 {
            let delay = backoff_delay(&config, 1);
            assert!(delay >= Duration::from_secs(5), "delay too short: {delay:?}");
            assert!(delay <= Duration::from_secs(15), "delay too long: {delay:?}");
        }
    }

    #[test]
    fn config_for_failure_prefers_override() {
        let default_config = RetryPolicy::Default.to_config();
        let per_failure = PerFailureConfig {
            transient: Some(RetryStrategyConfig {
                max_attempts: 99,
                ..Default::default()
            }),
            ambiguous: None,
            permanent: None,
        };

        let resolved =
            config_for_failure(&default_config, Some(&per_failure), FailureKind::Transient);
        assert_eq!(resolved.max_attempts, 99);

        let fallback =
            config_for_failure(&default_config, Some(&per_failure), FailureKind::Ambiguous);
        assert_eq!(fallback.max_attempts, default_config.max_attempts);
    }

    #[test]
    fn override_lookup_matches_the_kind() {
        let per_failure = PerFailureConfig {
            transient: None,
            ambiguous: Some(RetryStrategyConfig::default()),
            permanent: None,
        };
        assert!(per_failure.override_for(FailureKind::Transient).is_none());
        assert!(per_failure.override_for(FailureKind::Ambiguous).is_some());
        assert!(per_failure.override_for(FailureKind::Permanent).is_none());
    }

    #[test]
    fn strategy_config_roundtrips_through_serde() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Linear,
            max_attempts: 4,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(40),
            jitter: 0.25,
        };

        let json = serde_json::to_string(&config).expect("serialize");
        let parsed: RetryStrategyConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.strategy, RetryStrategyType::Linear);
        assert_eq!(parsed.max_attempts, 4);
        assert_eq!(parsed.base_delay, Duration::from_secs(3));
        assert_eq!(parsed.max_delay, Duration::from_secs(40));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Without jitter the delay never exceeds the configured cap.
            #[test]
            fn delay_respects_cap(
                base_ms in 1u64..5_000,
                max_ms in 1u64..60_000,
                attempt in 1u32..20,
            ) {
                let config = RetryStrategyConfig {
                    strategy: RetryStrategyType::Exponential,
                    base_delay: Duration::from_millis(base_ms),
                    max_delay: Duration::from_millis(max_ms),
                    jitter: 0.0,
                    max_attempts: 20,
                };
                let delay = backoff_delay(&config, attempt);
                prop_assert!(delay <= Duration::from_millis(max_ms));
            }

            // Exponential delays are non-decreasing in the attempt number.
            #[test]
            fn exponential_is_monotonic(
                base_ms in 1u64..1_000,
                attempt in 1u32..16,
            ) {
                let config = RetryStrategyConfig {
                    strategy: RetryStrategyType::Exponential,
                    base_delay: Duration::from_millis(base_ms),
                    max_delay: Duration::from_secs(3600),
                    jitter: 0.0,
                    max_attempts: 20,
                };
                let d1 = backoff_delay(&config, attempt);
                let d2 = backoff_delay(&config, attempt + 1);
                prop_assert!(d2 >= d1);
            }
        }
    }
}
