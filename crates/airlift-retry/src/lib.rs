//! Backoff policies for artifact downloads.
//!
//! The update orchestrator retries failed catalog fetches with a bounded,
//! exponentially growing delay between attempts. This crate holds the
//! delay calculation and its configuration so the schedule can be stated
//! in config files and asserted in tests without touching the wall clock:
//! the orchestrator asks "how long before attempt N" and does its own
//! waiting across ticks.
//!
//! # Example
//!
//! ```
//! use airlift_retry::{BackoffConfig, delay_before};
//! use std::time::Duration;
//!
//! let config = BackoffConfig::default();
//! // The stock download ladder: 1s, 2s, 4s, ... capped at 30s.
//! assert_eq!(delay_before(&config, 1), Duration::from_secs(1));
//! assert_eq!(delay_before(&config, 2), Duration::from_secs(2));
//! assert_eq!(delay_before(&config, 6), Duration::from_secs(30));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay between retries.
    Immediate,
    /// Delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Same delay every attempt.
    Constant,
}

/// Predefined backoff presets for the transports the agent talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPreset {
    /// The artifact-download ladder: 1s, 2s, 4s, 8s... capped at 30s,
    /// three retries, no jitter so the schedule is exact.
    #[default]
    Download,
    /// Patient variant for metered or flaky links: fewer attempts,
    /// longer waits.
    Patient,
    /// Fully custom configuration via the `[update.download]` config
    /// section.
    Custom,
}

impl BackoffPreset {
    pub fn to_config(self) -> BackoffConfig {
        match self {
            BackoffPreset::Download => BackoffConfig::default(),
            BackoffPreset::Patient => BackoffConfig {
                strategy: BackoffStrategy::Linear,
                max_attempts: 2,
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(60),
                jitter: 0.0,
            },
            BackoffPreset::Custom => BackoffConfig::default(),
        }
    }
}

/// Configuration for one backoff schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Strategy for calculating the delay between retries.
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Maximum number of retry attempts after the first failure.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap applied to the calculated delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor (0.0 = deterministic, 1.0 = full jitter). The
    /// agent's default schedule is deterministic; jitter exists for
    /// fleets large enough to stampede a catalog.
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: 0.0,
        }
    }
}

/// Classification of a failed attempt for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient; retry with backoff.
    #[default]
    Retryable,
    /// Retrying cannot help (bad digest, missing signature, capacity).
    Permanent,
}

/// Calculate the delay to wait before retry `attempt` (1-indexed: the
/// delay between the first failure and the second try is attempt 1).
pub fn delay_before(config: &BackoffConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        BackoffStrategy::Immediate => Duration::ZERO,
        BackoffStrategy::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        BackoffStrategy::Linear => config.base_delay.saturating_mul(attempt),
        BackoffStrategy::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Upper bound on the time a full retry cycle can spend waiting.
pub fn total_delay_budget(config: &BackoffConfig) -> Duration {
    (1..=config.max_attempts)
        .map(|attempt| {
            // Jitter multiplies by at most (1 + jitter); budget for it.
            let base = delay_before(
                &BackoffConfig {
                    jitter: 0.0,
                    ..config.clone()
                },
                attempt,
            );
            Duration::from_millis((base.as_millis() as f64 * (1.0 + config.jitter)).ceil() as u64)
        })
        .sum()
}

/// Jitter factor of 0.5 maps a delay to delay * (0.5 .. 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::RngExt;

    let jitter_range = 2.0 * jitter;
    let mut rng = rand::rng();
    let random_value: f64 = rng.random();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}
