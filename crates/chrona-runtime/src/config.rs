//! Runtime configuration

use std::str::FromStr;
use std::time::Duration;

use chrona_core::{ChronaError, ChronaResult};
use chrona_state::GuardConfig;
use chrona_stm::{RetryPolicy, DEFAULT_TOP_N};

use crate::{LogFormat, LoggingConfig};

/// Coordinator worker configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Requests that may wait in the queue before `submit` blocks
    pub queue_capacity: usize,
    /// Name of the worker thread
    pub thread_name: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            queue_capacity: 64,
            thread_name: "chrona-coordinator".to_string(),
        }
    }
}

/// Everything a `Runtime` needs
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    pub guard: GuardConfig,
    /// Policy used by `Runtime::transact`
    pub retry: RetryPolicy,
    pub coordinator: CoordinatorConfig,
    /// Hotspots listed in the telemetry report
    pub hotspot_top_n: usize,
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            guard: GuardConfig::default(),
            retry: RetryPolicy::default(),
            coordinator: CoordinatorConfig::default(),
            hotspot_top_n: DEFAULT_TOP_N,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Tuned for many short transactions on few variables
    pub fn contended() -> Self {
        RuntimeConfig {
            retry: RetryPolicy::contended(),
            ..Default::default()
        }
    }

    /// Default configuration overridden by `CHRONA_*` environment variables
    pub fn from_env() -> ChronaResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Default configuration overridden by whatever `lookup` returns
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ChronaResult<Self> {
        let mut config = RuntimeConfig::default();

        if let Some(strict) = parse_flag(&lookup, "CHRONA_STRICT")? {
            config.guard.strict = strict;
        }
        if let Some(paranoid) = parse_flag(&lookup, "CHRONA_PARANOID_LOCKS")? {
            config.guard.paranoid_lock_order = paranoid;
        }
        if let Some(attempts) = parse_value::<u32>(&lookup, "CHRONA_MAX_ATTEMPTS")? {
            if attempts == 0 {
                return Err(ChronaError::Config(
                    "CHRONA_MAX_ATTEMPTS must be at least 1".to_string(),
                ));
            }
            config.retry.max_attempts = attempts;
        }
        if let Some(delay) = parse_duration(&lookup, "CHRONA_BASE_DELAY")? {
            config.retry.base_delay = delay;
        }
        if let Some(delay) = parse_duration(&lookup, "CHRONA_MAX_DELAY")? {
            config.retry.max_delay = delay;
        }
        if let Some(deadline) = parse_duration(&lookup, "CHRONA_DEADLINE")? {
            config.retry.deadline = Some(deadline);
        }
        if let Some(capacity) = parse_value::<usize>(&lookup, "CHRONA_QUEUE_CAPACITY")? {
            if capacity == 0 {
                return Err(ChronaError::Config(
                    "CHRONA_QUEUE_CAPACITY must be at least 1".to_string(),
                ));
            }
            config.coordinator.queue_capacity = capacity;
        }
        if let Some(top_n) = parse_value::<usize>(&lookup, "CHRONA_TOP_N")? {
            config.hotspot_top_n = top_n;
        }
        if let Some(filter) = lookup("CHRONA_LOG") {
            config.logging.filter = filter;
        }
        if let Some(format) = parse_value::<LogFormat>(&lookup, "CHRONA_LOG_FORMAT")? {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ChronaResult<()> {
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ChronaError::Config(format!(
                "base delay {} exceeds max delay {}",
                humantime::format_duration(self.retry.base_delay),
                humantime::format_duration(self.retry.max_delay),
            )));
        }
        Ok(())
    }
}

fn parse_value<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> ChronaResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ChronaError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

fn parse_duration(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> ChronaResult<Option<Duration>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => humantime::parse_duration(raw.trim())
            .map(Some)
            .map_err(|e| ChronaError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> ChronaResult<Option<bool>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ChronaError::Config(format!(
            "{key}={raw:?}: expected a boolean"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert!(config.guard.strict);
        assert_eq!(config.coordinator.queue_capacity, 64);
    }

    #[test]
    fn test_overrides_applied() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("CHRONA_STRICT", "off"),
            ("CHRONA_PARANOID_LOCKS", "1"),
            ("CHRONA_MAX_ATTEMPTS", "3"),
            ("CHRONA_BASE_DELAY", "1ms"),
            ("CHRONA_MAX_DELAY", "20ms"),
            ("CHRONA_DEADLINE", "2s"),
            ("CHRONA_QUEUE_CAPACITY", "8"),
            ("CHRONA_TOP_N", "10"),
            ("CHRONA_LOG", "chrona=debug"),
            ("CHRONA_LOG_FORMAT", "json"),
        ]))
        .unwrap();

        assert!(!config.guard.strict);
        assert!(config.guard.paranoid_lock_order);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(1));
        assert_eq!(config.retry.max_delay, Duration::from_millis(20));
        assert_eq!(config.retry.deadline, Some(Duration::from_secs(2)));
        assert_eq!(config.coordinator.queue_capacity, 8);
        assert_eq!(config.hotspot_top_n, 10);
        assert_eq!(config.logging.filter, "chrona=debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_malformed_values_rejected() {
        for pairs in [
            [("CHRONA_STRICT", "maybe")],
            [("CHRONA_MAX_ATTEMPTS", "many")],
            [("CHRONA_MAX_ATTEMPTS", "0")],
            [("CHRONA_BASE_DELAY", "soon")],
            [("CHRONA_QUEUE_CAPACITY", "0")],
            [("CHRONA_LOG_FORMAT", "xml")],
        ] {
            let result = RuntimeConfig::from_lookup(lookup(&pairs));
            assert!(matches!(result, Err(ChronaError::Config(_))), "{pairs:?}");
        }
    }

    #[test]
    fn test_inverted_delays_rejected() {
        let result = RuntimeConfig::from_lookup(lookup(&[
            ("CHRONA_BASE_DELAY", "100ms"),
            ("CHRONA_MAX_DELAY", "1ms"),
        ]));
        assert!(matches!(result, Err(ChronaError::Config(_))));
    }

    proptest! {
        #[test]
        fn prop_attempts_and_delays_parse(attempts in 1u32..100_000, base_ms in 0u64..100, extra_ms in 0u64..1_000) {
            let attempts_raw = attempts.to_string();
            let base_raw = format!("{base_ms}ms");
            let max_raw = format!("{}ms", base_ms + extra_ms);
            let config = RuntimeConfig::from_lookup(lookup(&[
                ("CHRONA_MAX_ATTEMPTS", attempts_raw.as_str()),
                ("CHRONA_BASE_DELAY", base_raw.as_str()),
                ("CHRONA_MAX_DELAY", max_raw.as_str()),
            ]))
            .unwrap();

            prop_assert_eq!(config.retry.max_attempts, attempts);
            prop_assert_eq!(config.retry.base_delay, Duration::from_millis(base_ms));
            prop_assert_eq!(config.retry.max_delay, Duration::from_millis(base_ms + extra_ms));
        }
    }
}
