//! # Layered settings
//!
//! Assembles a [`Settings`] from compiled-in defaults, an optional TOML file,
//! and `TASKQ_`-prefixed environment variable overrides, using the `config`
//! crate's layered-provider builder. Validation runs once at construction
//! (`Settings::load`) rather than being re-checked on every read, so a bad
//! deployment fails fast instead of surfacing as a confusing runtime error
//! deep in the executor or beat scheduler.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::TaskQueueError;
use crate::executor::{ExecutorConfig, RetryBackoff};
use crate::resilience::CircuitBreakerConfig;

/// Worker executor settings, in their wire/file form (plain seconds rather
/// than [`Duration`], since `config`/TOML has no native duration type).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WorkerSettings {
    #[validate(range(min = 1, max = 4096))]
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub shutdown_grace_seconds: u64,
    pub default_soft_time_limit_seconds: Option<u64>,
    pub default_hard_time_limit_seconds: Option<u64>,
    pub default_partition_lock_ttl_seconds: u64,
    pub retry_backoff_base_seconds: u64,
    pub retry_backoff_cap_seconds: u64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub retry_backoff_jitter: f64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            concurrency: defaults.concurrency,
            queues: defaults.queues,
            shutdown_grace_seconds: defaults.shutdown_grace.as_secs(),
            default_soft_time_limit_seconds: defaults.default_soft_time_limit.map(|d| d.as_secs()),
            default_hard_time_limit_seconds: defaults.default_hard_time_limit.map(|d| d.as_secs()),
            default_partition_lock_ttl_seconds: defaults.default_partition_lock_ttl.as_secs(),
            retry_backoff_base_seconds: defaults.retry_backoff.base.as_secs(),
            retry_backoff_cap_seconds: defaults.retry_backoff.cap.as_secs(),
            retry_backoff_jitter: defaults.retry_backoff.jitter,
        }
    }
}

impl WorkerSettings {
    /// Materializes the `Duration`-based [`ExecutorConfig`] the executor
    /// actually runs with.
    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            concurrency: self.concurrency,
            queues: self.queues.clone(),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_seconds),
            default_soft_time_limit: self.default_soft_time_limit_seconds.map(Duration::from_secs),
            default_hard_time_limit: self.default_hard_time_limit_seconds.map(Duration::from_secs),
            default_partition_lock_ttl: Duration::from_secs(self.default_partition_lock_ttl_seconds),
            retry_backoff: RetryBackoff {
                base: Duration::from_secs(self.retry_backoff_base_seconds),
                cap: Duration::from_secs(self.retry_backoff_cap_seconds),
                jitter: self.retry_backoff_jitter,
            },
        }
    }
}

/// Beat scheduler settings, in wire/file form.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BeatSettings {
    pub tick_seconds: u64,
    pub jitter_seconds: u64,
    pub persist_state: bool,
    pub state_path: Option<String>,
}

impl Default for BeatSettings {
    fn default() -> Self {
        Self {
            tick_seconds: 1,
            jitter_seconds: 0,
            persist_state: false,
            state_path: None,
        }
    }
}

/// Partition-lock and outbox/inbox dispatcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReliabilitySettings {
    pub outbox_poll_interval_seconds: u64,
    #[validate(range(min = 1))]
    pub outbox_batch_size: usize,
    pub delayed_dispatch_tick_millis: u64,
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        Self {
            outbox_poll_interval_seconds: 1,
            outbox_batch_size: 100,
            delayed_dispatch_tick_millis: 100,
        }
    }
}

/// Circuit breaker defaults applied to the broker/backend contracts.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ResilienceSettings {
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    pub open_duration_seconds: u64,
    #[validate(range(min = 1))]
    pub success_threshold: u32,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_seconds: 30,
            success_threshold: 2,
        }
    }
}

impl ResilienceSettings {
    /// Materializes the `Duration`-based [`CircuitBreakerConfig`] applied to
    /// the broker/backend decorators.
    pub fn to_circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold as u64,
            open_duration: Duration::from_secs(self.open_duration_seconds),
            success_threshold: self.success_threshold as u64,
        }
    }
}

/// Root settings object. Assembled by [`Settings::load`]; never constructed
/// directly from a bare `Default` in production code, since that would skip
/// the file/env layers and the `validator` pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    #[validate(nested)]
    pub worker: WorkerSettings,
    #[validate(nested)]
    pub beat: BeatSettings,
    #[validate(nested)]
    pub reliability: ReliabilitySettings,
    #[validate(nested)]
    pub resilience: ResilienceSettings,
}

impl Settings {
    const ENV_PREFIX: &'static str = "TASKQ";

    /// Loads defaults, overlays `path` if it exists, then overlays
    /// `TASKQ_`-prefixed environment variables (double underscore as the
    /// nested-key separator, e.g. `TASKQ_WORKER__CONCURRENCY=8`), and
    /// validates the result. Fails fast: a malformed file or an
    /// out-of-range value is an error here, not a surprise at first use.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TaskQueueError> {
        let path = path.as_ref();
        let defaults_toml = toml::to_string(&Settings::default()).map_err(|e| TaskQueueError::Config(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(config::File::from_str(&defaults_toml, config::FileFormat::Toml));

        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix(Self::ENV_PREFIX).separator("__").try_parsing(true));

        let settings: Settings = builder
            .build()
            .map_err(|e| TaskQueueError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| TaskQueueError::Config(e.to_string()))?;

        settings.validate().map_err(|e| TaskQueueError::Config(e.to_string()))?;
        Ok(settings)
    }

    /// Loads from defaults and environment only, skipping any file — the
    /// common case for tests and the demo binary.
    pub fn load_from_env() -> Result<Self, TaskQueueError> {
        Self::load("/dev/null")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_the_executor_and_beat_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.worker.to_executor_config().concurrency, ExecutorConfig::default().concurrency);
        assert_eq!(settings.beat.tick_seconds, 1);
    }

    // Mutates a process-global env var, so these two must not interleave.
    #[test]
    #[serial]
    fn load_from_env_applies_a_taskq_prefixed_override() {
        std::env::set_var("TASKQ_WORKER__CONCURRENCY", "7");
        let settings = Settings::load_from_env().expect("settings should load");
        std::env::remove_var("TASKQ_WORKER__CONCURRENCY");
        assert_eq!(settings.worker.concurrency, 7);
    }

    #[test]
    #[serial]
    fn out_of_range_priority_like_values_fail_validation() {
        std::env::set_var("TASKQ_WORKER__CONCURRENCY", "0");
        let err = Settings::load_from_env().unwrap_err();
        std::env::remove_var("TASKQ_WORKER__CONCURRENCY");
        assert!(matches!(err, TaskQueueError::Config(_)));
    }

    #[test]
    fn resilience_settings_materialize_into_a_circuit_breaker_config() {
        let settings = ResilienceSettings::default();
        let cb = settings.to_circuit_breaker_config();
        assert_eq!(cb.failure_threshold, 5);
        assert_eq!(cb.open_duration, Duration::from_secs(30));
        assert_eq!(cb.success_threshold, 2);
    }

    #[test]
    fn loading_a_missing_file_falls_back_to_defaults_and_env() {
        let settings = Settings::load("/nonexistent/path/taskforge.toml").expect("missing file is not an error");
        assert_eq!(settings.worker.queues, vec!["celery".to_string()]);
    }
}
