// Service configuration, read from the environment.

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub bind_addr: String,
    /// Maximum jobs executing at once.
    pub max_concurrency: usize,
    /// Maximum jobs waiting for a slot; submissions beyond it are refused.
    pub max_queue_depth: usize,
    /// Wait after which a normal job is promoted into the high queue.
    pub aging_threshold: Duration,
    pub aging_tick: Duration,
    pub violation_log_capacity: usize,
    pub health_window: usize,
    pub health_min_samples: usize,
    pub degraded_queue_depth: u64,
    pub degraded_avg_wait_ms: u64,
    pub degraded_failure_rate: f64,
    pub result_cache_capacity: usize,
    pub redis_url: Option<String>,
}

/// The admin panel shows the last five violations; never keep fewer.
pub const MIN_VIOLATION_LOG_CAPACITY: usize = 5;

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            max_concurrency: 4,
            max_queue_depth: 1000,
            aging_threshold: Duration::from_millis(30_000),
            aging_tick: Duration::from_millis(1_000),
            violation_log_capacity: 20,
            health_window: 100,
            health_min_samples: 10,
            degraded_queue_depth: 50,
            degraded_avg_wait_ms: 10_000,
            degraded_failure_rate: 0.5,
            result_cache_capacity: 10_000,
            redis_url: None,
        }
    }
}

impl QueueConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values are logged
    /// and replaced by the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_concurrency: usize =
            parse_or(&lookup, "QUEUE_MAX_CONCURRENCY", defaults.max_concurrency);
        let violation_log_capacity: usize = parse_or(
            &lookup,
            "VIOLATION_LOG_CAPACITY",
            defaults.violation_log_capacity,
        );

        Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_concurrency: max_concurrency.max(1),
            max_queue_depth: parse_or(&lookup, "QUEUE_MAX_DEPTH", defaults.max_queue_depth),
            aging_threshold: Duration::from_millis(parse_or(
                &lookup,
                "QUEUE_AGING_THRESHOLD_MS",
                defaults.aging_threshold.as_millis() as u64,
            )),
            aging_tick: Duration::from_millis(
                parse_or(
                    &lookup,
                    "QUEUE_AGING_TICK_MS",
                    defaults.aging_tick.as_millis() as u64,
                )
                .max(10),
            ),
            violation_log_capacity: violation_log_capacity.max(MIN_VIOLATION_LOG_CAPACITY),
            health_window: parse_or(&lookup, "HEALTH_WINDOW", defaults.health_window).max(1),
            health_min_samples: parse_or(&lookup, "HEALTH_MIN_SAMPLES", defaults.health_min_samples),
            degraded_queue_depth: parse_or(
                &lookup,
                "DEGRADED_QUEUE_DEPTH",
                defaults.degraded_queue_depth,
            ),
            degraded_avg_wait_ms: parse_or(
                &lookup,
                "DEGRADED_AVG_WAIT_MS",
                defaults.degraded_avg_wait_ms,
            ),
            degraded_failure_rate: parse_or(
                &lookup,
                "DEGRADED_FAILURE_RATE",
                defaults.degraded_failure_rate,
            ),
            result_cache_capacity: parse_or(
                &lookup,
                "RESULT_CACHE_CAPACITY",
                defaults.result_cache_capacity,
            )
            .max(1),
            redis_url: lookup("REDIS_URL").filter(|url| !url.trim().is_empty()),
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = %default, "Invalid config value, using default");
                default
            }
        },
        None => default,
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
    fn test_defaults_when_unset() {
        let config = QueueConfig::from_lookup(|_| None);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.max_queue_depth, 1000);
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = QueueConfig::from_lookup(lookup_from(&[
            ("QUEUE_MAX_CONCURRENCY", "8"),
            ("QUEUE_AGING_THRESHOLD_MS", "1500"),
            ("DEGRADED_FAILURE_RATE", "0.25"),
            ("REDIS_URL", "redis://cache:6379"),
        ]));
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.aging_threshold, Duration::from_millis(1500));
        assert_eq!(config.degraded_failure_rate, 0.25);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = QueueConfig::from_lookup(lookup_from(&[
            ("QUEUE_MAX_CONCURRENCY", "lots"),
            ("QUEUE_MAX_DEPTH", "-3"),
        ]));
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.max_queue_depth, 1000);
    }

    #[test]
    fn test_lower_bounds_are_enforced() {
        let config = QueueConfig::from_lookup(lookup_from(&[
            ("QUEUE_MAX_CONCURRENCY", "0"),
            ("VIOLATION_LOG_CAPACITY", "2"),
            ("REDIS_URL", "  "),
        ]));
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.violation_log_capacity, MIN_VIOLATION_LOG_CAPACITY);
        assert!(config.redis_url.is_none());
    }
}
