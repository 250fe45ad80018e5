use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Tunables for storage, delivery and session orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Root directory for the retry queue and snapshot cache
    pub storage_dir: PathBuf,
    /// Collector base URL
    pub base_url: String,
    /// Maximum number of pending deliveries kept on disk
    pub max_stored_payloads: usize,
    /// Maximum number of cached snapshots kept on disk
    pub max_cached_snapshots: usize,
    /// Concurrent background jobs
    pub worker_threads: usize,
    /// First retry delay after a transient failure (ms)
    pub retry_initial_delay_ms: u64,
    /// Upper bound for the exponential retry delay (ms)
    pub retry_max_delay_ms: u64,
    /// Attempts after which a pending delivery is dropped
    pub max_retry_count: u32,
    /// Age after which a pending delivery is dropped (ms)
    pub max_pending_age_ms: i64,
    /// Cooldown used when a 429 carries no Retry-After header (ms)
    pub rate_limit_default_cooldown_ms: u64,
    /// Cap for the escalating default cooldown (ms)
    pub rate_limit_max_cooldown_ms: u64,
    pub request_timeout_secs: u64,
    /// Interval between periodic snapshots of the active envelope (ms)
    pub periodic_cache_interval_ms: u64,
    /// Sessions younger than this cannot be ended manually (ms)
    pub min_manual_session_ms: i64,
    pub background_activity_enabled: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./.telemetry"),
            base_url: "https://collector.localhost".to_string(),
            max_stored_payloads: 500,
            max_cached_snapshots: 100,
            worker_threads: 4,
            retry_initial_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            max_retry_count: 10,
            max_pending_age_ms: 7 * 24 * 60 * 60 * 1000,
            rate_limit_default_cooldown_ms: 3000,
            rate_limit_max_cooldown_ms: 300_000,
            request_timeout_secs: 30,
            periodic_cache_interval_ms: 2000,
            min_manual_session_ms: 5000,
            background_activity_enabled: true,
        }
    }
}

impl DeliveryConfig {
    /// Build a config from `TELEMETRY_*` environment variables, falling back
    /// to defaults. A `.env` file is loaded first when present.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unparseable values are
    /// logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("TELEMETRY_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("TELEMETRY_BASE_URL") {
            config.base_url = url;
        }
        override_parsed(&lookup, "TELEMETRY_MAX_STORED_PAYLOADS", &mut config.max_stored_payloads);
        override_parsed(&lookup, "TELEMETRY_MAX_CACHED_SNAPSHOTS", &mut config.max_cached_snapshots);
        override_parsed(&lookup, "TELEMETRY_WORKER_THREADS", &mut config.worker_threads);
        override_parsed(&lookup, "TELEMETRY_RETRY_INITIAL_DELAY_MS", &mut config.retry_initial_delay_ms);
        override_parsed(&lookup, "TELEMETRY_RETRY_MAX_DELAY_MS", &mut config.retry_max_delay_ms);
        override_parsed(&lookup, "TELEMETRY_MAX_RETRY_COUNT", &mut config.max_retry_count);
        override_parsed(&lookup, "TELEMETRY_MAX_PENDING_AGE_MS", &mut config.max_pending_age_ms);
        override_parsed(
            &lookup,
            "TELEMETRY_RATE_LIMIT_DEFAULT_COOLDOWN_MS",
            &mut config.rate_limit_default_cooldown_ms,
        );
        override_parsed(&lookup, "TELEMETRY_RATE_LIMIT_MAX_COOLDOWN_MS", &mut config.rate_limit_max_cooldown_ms);
        override_parsed(&lookup, "TELEMETRY_REQUEST_TIMEOUT_SECS", &mut config.request_timeout_secs);
        override_parsed(&lookup, "TELEMETRY_PERIODIC_CACHE_INTERVAL_MS", &mut config.periodic_cache_interval_ms);
        override_parsed(&lookup, "TELEMETRY_MIN_MANUAL_SESSION_MS", &mut config.min_manual_session_ms);
        override_parsed(
            &lookup,
            "TELEMETRY_BACKGROUND_ACTIVITY_ENABLED",
            &mut config.background_activity_enabled,
        );

        if config.worker_threads == 0 {
            log::warn!("[CONFIG] worker_threads must be at least 1, using 1");
            config.worker_threads = 1;
        }

        config
    }

    /// Exponential backoff delay for the given number of failed attempts.
    pub fn retry_delay_ms(&self, retry_count: u32) -> u64 {
        let factor = 2u64.saturating_pow(retry_count.saturating_sub(1));
        self.retry_initial_delay_ms
            .saturating_mul(factor)
            .min(self.retry_max_delay_ms)
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.storage_dir.join("pending")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.storage_dir.join("snapshots")
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => log::warn!("[CONFIG] Ignoring invalid value for {}: {:?}", key, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = DeliveryConfig::from_lookup(|_| None);
        assert_eq!(config.max_stored_payloads, 500);
        assert_eq!(config.min_manual_session_ms, 5000);
        assert!(config.background_activity_enabled);
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = DeliveryConfig::from_lookup(lookup_from(&[
            ("TELEMETRY_STORAGE_DIR", "/tmp/telemetry"),
            ("TELEMETRY_MAX_STORED_PAYLOADS", "42"),
            ("TELEMETRY_BACKGROUND_ACTIVITY_ENABLED", "false"),
        ]));
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/telemetry"));
        assert_eq!(config.max_stored_payloads, 42);
        assert!(!config.background_activity_enabled);
        assert_eq!(config.pending_dir(), PathBuf::from("/tmp/telemetry/pending"));
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = DeliveryConfig::from_lookup(lookup_from(&[
            ("TELEMETRY_MAX_RETRY_COUNT", "lots"),
            ("TELEMETRY_WORKER_THREADS", "0"),
        ]));
        assert_eq!(config.max_retry_count, 10);
        assert_eq!(config.worker_threads, 1);
    }

    #[test]
    fn test_retry_delay_is_exponential_and_capped() {
        let config = DeliveryConfig {
            retry_initial_delay_ms: 1000,
            retry_max_delay_ms: 10_000,
            ..Default::default()
        };
        assert_eq!(config.retry_delay_ms(0), 1000);
        assert_eq!(config.retry_delay_ms(1), 1000);
        assert_eq!(config.retry_delay_ms(2), 2000);
        assert_eq!(config.retry_delay_ms(3), 4000);
        assert_eq!(config.retry_delay_ms(5), 10_000);
        assert_eq!(config.retry_delay_ms(200), 10_000);
    }
}
