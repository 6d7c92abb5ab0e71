//! Engine configuration.
//!
//! [`ConfigOptions`] is the raw, serde-friendly option set (defaults, env
//! overrides). [`OrchestratorConfig`] is the validated, immutable form the
//! orchestrator is built from.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use taskforge_core::{JitterSeed, RetryPolicy, StrategyKind};

const ENV_PREFIX: &str = "TASKFORGE_";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Concurrency budget for one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneOptions {
    /// Executions allowed to run at once.
    pub max_concurrent: usize,
    /// Admitted executions allowed to wait for a slot.
    pub queue_bound: usize,
}

impl LaneOptions {
    pub const fn new(max_concurrent: usize, queue_bound: usize) -> Self {
        Self {
            max_concurrent,
            queue_bound,
        }
    }
}

/// Every recognised option, with defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOptions {
    pub cooperative: LaneOptions,
    pub thread: LaneOptions,
    pub process: LaneOptions,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub backoff_cap_ms: u64,
    pub jitter: f64,
    pub jitter_seed: u64,
    /// Applied to jobs submitted without a timeout. `None` disables it.
    pub default_timeout_ms: Option<u64>,
    pub poll_interval_ms: u64,
    /// How long a timed-out cooperative task gets to reach a yield point.
    pub cancel_grace_ms: u64,
    /// Wait before resubmitting a job the pool turned away.
    pub submit_backoff_ms: u64,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            cooperative: LaneOptions::new(10, 1000),
            thread: LaneOptions::new(5, 1000),
            process: LaneOptions::new(4, 1000),
            base_delay_ms: 1_000,
            multiplier: 2.0,
            backoff_cap_ms: 300_000,
            jitter: 0.2,
            jitter_seed: 0,
            default_timeout_ms: Some(3_600_000),
            poll_interval_ms: 100,
            cancel_grace_ms: 250,
            submit_backoff_ms: 50,
        }
    }
}

impl ConfigOptions {
    /// Defaults overridden by `TASKFORGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `TASKFORGE_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();
        for kind in StrategyKind::ALL {
            let prefix = kind.as_str().to_ascii_uppercase();
            let lane = options.lane_mut(kind);
            override_with(&lookup, &format!("{prefix}_MAX_CONCURRENT"), &mut lane.max_concurrent)?;
            override_with(&lookup, &format!("{prefix}_QUEUE_BOUND"), &mut lane.queue_bound)?;
        }
        override_with(&lookup, "BASE_DELAY_MS", &mut options.base_delay_ms)?;
        override_with(&lookup, "BACKOFF_MULTIPLIER", &mut options.multiplier)?;
        override_with(&lookup, "BACKOFF_CAP_MS", &mut options.backoff_cap_ms)?;
        override_with(&lookup, "JITTER", &mut options.jitter)?;
        override_with(&lookup, "JITTER_SEED", &mut options.jitter_seed)?;
        override_with(&lookup, "POLL_INTERVAL_MS", &mut options.poll_interval_ms)?;
        override_with(&lookup, "CANCEL_GRACE_MS", &mut options.cancel_grace_ms)?;
        override_with(&lookup, "SUBMIT_BACKOFF_MS", &mut options.submit_backoff_ms)?;

        let key = format!("{ENV_PREFIX}DEFAULT_TIMEOUT_MS");
        if let Some(raw) = lookup(&key) {
            options.default_timeout_ms = match raw.trim() {
                "" | "none" | "0" => None,
                value => Some(
                    value
                        .parse()
                        .map_err(|e: std::num::ParseIntError| ConfigError::invalid(&key, e.to_string()))?,
                ),
            };
        }

        Ok(options)
    }

    pub fn lane(&self, kind: StrategyKind) -> LaneOptions {
        match kind {
            StrategyKind::Cooperative => self.cooperative,
            StrategyKind::Thread => self.thread,
            StrategyKind::Process => self.process,
        }
    }

    fn lane_mut(&mut self, kind: StrategyKind) -> &mut LaneOptions {
        match kind {
            StrategyKind::Cooperative => &mut self.cooperative,
            StrategyKind::Thread => &mut self.thread,
            StrategyKind::Process => &mut self.process,
        }
    }

    pub fn with_lane(mut self, kind: StrategyKind, lane: LaneOptions) -> Self {
        *self.lane_mut(kind) = lane;
        self
    }
}

fn override_with<F, T>(lookup: &F, suffix: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{suffix}");
    if let Some(raw) = lookup(&key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(&key, e.to_string()))?;
    }
    Ok(())
}

/// Validated engine configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    lanes: [LaneOptions; 3],
    retry: RetryPolicy,
    jitter_seed: JitterSeed,
    default_timeout: Option<Duration>,
    poll_interval: Duration,
    cancel_grace: Duration,
    submit_backoff: Duration,
}

impl OrchestratorConfig {
    pub fn from_options(options: ConfigOptions) -> Result<Self, ConfigError> {
        for kind in StrategyKind::ALL {
            let lane = options.lane(kind);
            if lane.max_concurrent == 0 {
                return Err(ConfigError::invalid(
                    format!("{kind}.max_concurrent"),
                    "must be at least 1",
                ));
            }
            if lane.queue_bound == 0 {
                return Err(ConfigError::invalid(format!("{kind}.queue_bound"), "must be at least 1"));
            }
        }
        if options.default_timeout_ms == Some(0) {
            return Err(ConfigError::invalid("default_timeout_ms", "must be non-zero"));
        }
        if options.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be non-zero"));
        }

        let retry = RetryPolicy::new(
            Duration::from_millis(options.base_delay_ms),
            options.multiplier,
            Duration::from_millis(options.backoff_cap_ms),
            options.jitter,
        )
        .map_err(|e| ConfigError::invalid("retry", e.to_string()))?;

        Ok(Self {
            lanes: [options.cooperative, options.thread, options.process],
            retry,
            jitter_seed: JitterSeed(options.jitter_seed),
            default_timeout: options.default_timeout_ms.map(Duration::from_millis),
            poll_interval: Duration::from_millis(options.poll_interval_ms),
            cancel_grace: Duration::from_millis(options.cancel_grace_ms),
            submit_backoff: Duration::from_millis(options.submit_backoff_ms),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_options(ConfigOptions::from_env()?)
    }

    pub fn lane(&self, kind: StrategyKind) -> LaneOptions {
        match kind {
            StrategyKind::Cooperative => self.lanes[0],
            StrategyKind::Thread => self.lanes[1],
            StrategyKind::Process => self.lanes[2],
        }
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn jitter_seed(&self) -> JitterSeed {
        self.jitter_seed
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }

    pub fn submit_backoff(&self) -> Duration {
        self.submit_backoff
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let options = ConfigOptions::default();
        Self {
            lanes: [options.cooperative, options.thread, options.process],
            retry: RetryPolicy::default(),
            jitter_seed: JitterSeed(options.jitter_seed),
            default_timeout: options.default_timeout_ms.map(Duration::from_millis),
            poll_interval: Duration::from_millis(options.poll_interval_ms),
            cancel_grace: Duration::from_millis(options.cancel_grace_ms),
            submit_backoff: Duration::from_millis(options.submit_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_validate() {
        let config = OrchestratorConfig::from_options(ConfigOptions::default()).unwrap();
        assert_eq!(config.lane(StrategyKind::Thread).max_concurrent, 5);
        assert_eq!(config.lane(StrategyKind::Cooperative).max_concurrent, 10);
        assert_eq!(config.default_timeout(), Some(Duration::from_secs(3600)));
        assert_eq!(config.retry().cap(), Duration::from_secs(300));
    }

    #[test]
    fn lookup_overrides_defaults() {
        let options = ConfigOptions::from_lookup(lookup_from(&[
            ("TASKFORGE_THREAD_MAX_CONCURRENT", "2"),
            ("TASKFORGE_PROCESS_QUEUE_BOUND", "7"),
            ("TASKFORGE_BACKOFF_CAP_MS", "5000"),
            ("TASKFORGE_JITTER_SEED", "42"),
            ("TASKFORGE_DEFAULT_TIMEOUT_MS", "none"),
        ]))
        .unwrap();

        assert_eq!(options.thread.max_concurrent, 2);
        assert_eq!(options.process.queue_bound, 7);
        assert_eq!(options.backoff_cap_ms, 5000);
        assert_eq!(options.jitter_seed, 42);
        assert_eq!(options.default_timeout_ms, None);
        assert_eq!(options.cooperative, ConfigOptions::default().cooperative);
    }

    #[test]
    fn malformed_value_names_the_key() {
        let err = ConfigOptions::from_lookup(lookup_from(&[("TASKFORGE_JITTER", "lots")])).unwrap_err();
        let ConfigError::Invalid { key, .. } = err;
        assert_eq!(key, "TASKFORGE_JITTER");
    }

    #[test]
    fn zero_concurrency_rejected() {
        let options = ConfigOptions::default().with_lane(StrategyKind::Process, LaneOptions::new(0, 10));
        let err = OrchestratorConfig::from_options(options).unwrap_err();
        assert!(err.to_string().contains("process.max_concurrent"));
    }

    #[test]
    fn base_delay_above_cap_rejected() {
        let options = ConfigOptions {
            base_delay_ms: 10_000,
            backoff_cap_ms: 1_000,
            ..ConfigOptions::default()
        };
        assert!(OrchestratorConfig::from_options(options).is_err());
    }

    #[test]
    fn options_deserialize_with_partial_fields() {
        let options: ConfigOptions =
            serde_json::from_str(r#"{"thread": {"max_concurrent": 1, "queue_bound": 3}, "jitter": 0.0}"#)
                .unwrap();
        assert_eq!(options.thread, LaneOptions::new(1, 3));
        assert_eq!(options.jitter, 0.0);
        assert_eq!(options.base_delay_ms, 1_000);
    }

    proptest::proptest! {
        #[test]
        fn positive_lane_limits_from_lookup_are_kept(max in 1usize..512, bound in 1usize..10_000) {
            let (max_s, bound_s) = (max.to_string(), bound.to_string());
            let options = ConfigOptions::from_lookup(lookup_from(&[
                ("TASKFORGE_COOPERATIVE_MAX_CONCURRENT", max_s.as_str()),
                ("TASKFORGE_COOPERATIVE_QUEUE_BOUND", bound_s.as_str()),
            ]))
            .unwrap();
            let config = OrchestratorConfig::from_options(options).unwrap();
            proptest::prop_assert_eq!(config.lane(StrategyKind::Cooperative), LaneOptions::new(max, bound));
            proptest::prop_assert_eq!(config.lane(StrategyKind::Thread), LaneOptions::new(5, 1_000));
        }
    }
}
