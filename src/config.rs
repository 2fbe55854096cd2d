//! Client configuration management.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::metrics::MetricsConfig;
use crate::persistence::PersistenceConfig;
use crate::relay_url::normalize_relay_url;

/// Well-known relays used for bootstrap and as the selection fallback.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://relay.primal.net",
];

/// Main configuration for a relay-mesh client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay lists.
    #[serde(default)]
    pub relays: RelayListConfig,

    /// Connection management.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Periodic health sweep.
    #[serde(default)]
    pub health: HealthConfig,

    /// Circuit breaker defaults.
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Cache tiers and quota policy.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Persistence/storage configuration.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Prometheus metrics.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Relay list configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayListConfig {
    /// Known-good relays used for bootstrap and fallback.
    pub default_relays: Vec<String>,

    /// Relays configured by the user.
    #[serde(default)]
    pub user_relays: Vec<String>,
}

impl Default for RelayListConfig {
    fn default() -> Self {
        Self {
            default_relays: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            user_relays: Vec::new(),
        }
    }
}

/// Connection management configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Deadline for a socket to open.
    pub connect_timeout_ms: u64,

    /// Maximum reconnect attempts after an unexpected close.
    pub max_retries: u32,

    /// Base delay of the exponential backoff.
    pub base_backoff_ms: u64,

    /// Upper bound of the exponential backoff.
    pub max_backoff_ms: u64,

    /// Maximum age of the last-connected snapshot for it to be restored.
    pub restore_window_ms: u64,

    /// Relays with this many recorded failures or more are skipped when
    /// connectivity comes back.
    pub online_failure_limit: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            max_retries: 6,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            restore_window_ms: 30_000,
            online_failure_limit: 3,
        }
    }
}

impl ConnectionConfig {
    /// Connect deadline as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Backoff delay before reconnect attempt `retry_count`:
    /// `min(base * 2^retry_count, max)`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_count);
        let delay = self.base_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Health sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between liveness sweeps.
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that trip a closed circuit.
    pub failure_threshold: u32,

    /// Cool-down before an open circuit allows a trial request.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Expiry pair for one cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierExpiry {
    /// Lifetime of ordinary entries while online.
    pub standard_secs: u64,
    /// Lifetime of important entries, and of every entry while offline.
    pub offline_secs: u64,
}

impl TierExpiry {
    /// Create an expiry pair.
    pub const fn new(standard_secs: u64, offline_secs: u64) -> Self {
        Self {
            standard_secs,
            offline_secs,
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Interval of the expiry sweep.
    pub cleanup_interval_secs: u64,

    /// Interval of the storage quota check.
    pub quota_check_interval_secs: u64,

    /// Usage ratio that triggers a proactive sweep and batch shrinking.
    pub warning_threshold: f64,

    /// Usage ratio that triggers emergency cleanup.
    pub danger_threshold: f64,

    /// Largest batch written while usage is at or above the warning threshold.
    pub reduced_batch_size: usize,

    /// Oldest non-important profiles trimmed by emergency cleanup.
    pub emergency_profile_trim: usize,

    /// Event tier expiry.
    pub events: TierExpiry,

    /// Profile tier expiry.
    pub profiles: TierExpiry,

    /// Thread tier expiry.
    pub threads: TierExpiry,

    /// Feed tier expiry.
    pub feeds: TierExpiry,

    /// List tier expiry.
    pub lists: TierExpiry,
}

impl Default for CacheConfig {
    fn default() -> Self {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;
        const DAY: u64 = 24 * HOUR;

        Self {
            cleanup_interval_secs: 2 * MINUTE,
            quota_check_interval_secs: MINUTE,
            warning_threshold: 0.70,
            danger_threshold: 0.85,
            reduced_batch_size: 20,
            emergency_profile_trim: 50,
            events: TierExpiry::new(10 * MINUTE, DAY),
            profiles: TierExpiry::new(30 * MINUTE, 7 * DAY),
            threads: TierExpiry::new(10 * MINUTE, DAY),
            feeds: TierExpiry::new(5 * MINUTE, DAY),
            lists: TierExpiry::new(HOUR, 7 * DAY),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check value ranges and relay URLs.
    pub fn validate(&self) -> Result<()> {
        if self.relays.default_relays.is_empty() {
            return Err(Error::Config(
                "At least one default relay is required".to_string(),
            ));
        }

        for url in self
            .relays
            .default_relays
            .iter()
            .chain(self.relays.user_relays.iter())
        {
            normalize_relay_url(url).map_err(|e| Error::Config(e.to_string()))?;
        }

        let cache = &self.cache;
        if !(0.0 < cache.warning_threshold
            && cache.warning_threshold < cache.danger_threshold
            && cache.danger_threshold <= 1.0)
        {
            return Err(Error::Config(format!(
                "Quota thresholds must satisfy 0 < warning ({}) < danger ({}) <= 1",
                cache.warning_threshold, cache.danger_threshold
            )));
        }

        if self.circuit.failure_threshold == 0 {
            return Err(Error::Config(
                "Circuit failure threshold must be positive".to_string(),
            ));
        }

        if self.connection.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "Connect timeout must be positive".to_string(),
            ));
        }

        if let Some(addr) = &self.metrics.listen_address {
            addr.parse::<std::net::SocketAddr>().map_err(|e| {
                Error::Config(format!("Invalid metrics listen address {}: {}", addr, e))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        tokio_test::assert_ok!(config.validate());
        assert_eq!(config.relays.default_relays.len(), DEFAULT_RELAYS.len());
        assert_eq!(config.circuit.failure_threshold, 3);
        assert_eq!(config.cache.warning_threshold, 0.70);
        assert_eq!(config.cache.danger_threshold, 0.85);
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let config = ConnectionConfig::default();

        assert_eq!(config.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(5), Duration::from_secs(32));
        assert_eq!(config.backoff_delay(6), Duration::from_secs(60));
        assert_eq!(config.backoff_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = ClientConfig::default();
        config.cache.warning_threshold = 0.9;
        config.cache.danger_threshold = 0.8;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_relay_url() {
        let mut config = ClientConfig::default();
        config.relays.user_relays.push("https://not-a-relay".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_metrics_address() {
        let mut config = ClientConfig::default();
        config.metrics.listen_address = Some("not-an-address".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.metrics.listen_address = Some("0.0.0.0:9464".to_string());
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_load_partial_config_from_toml() {
        let toml_content = r#"
[relays]
default_relays = ["wss://relay.damus.io"]
user_relays = ["wss://nostr.wine"]

[circuit]
failure_threshold = 5
reset_timeout_ms = 10000

[persistence]
enabled = false

[metrics]
enabled = false
listen_address = "127.0.0.1:9464"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = ClientConfig::load(temp_file.path()).unwrap();

        assert_eq!(config.relays.user_relays, vec!["wss://nostr.wine"]);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert!(!config.persistence.enabled);
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.prefix, "relay_mesh");
        assert_eq!(config.metrics.listen_address.as_deref(), Some("127.0.0.1:9464"));
        // Unspecified sections fall back to defaults.
        assert_eq!(config.connection.max_retries, 6);
        assert_eq!(config.health.interval_secs, 30);
    }

    #[test]
    fn test_save_and_reload() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut config = ClientConfig::default();
        config.cache.reduced_batch_size = 7;

        config.save(temp_file.path()).unwrap();
        let loaded = ClientConfig::load(temp_file.path()).unwrap();

        assert_eq!(loaded.cache.reduced_batch_size, 7);
        assert_eq!(loaded.cache.events, config.cache.events);
    }
}
