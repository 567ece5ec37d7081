use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Tether configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    /// Global configuration
    #[serde(default)]
    pub global: GlobalConfig,
    /// Session store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Idle pruning configuration
    #[serde(default)]
    pub pruning: PruningConfig,
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Default log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Which consistency model backs session metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process sharded map
    Local,
    /// Remote store with multi-command transactions and native sets
    Transactional,
    /// Remote key/value cache, eventually consistent secondary index
    Cache,
}

/// Session store settings exposed to the enclosing transport layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Prefix namespacing every stored key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Time-to-live applied to stored metadata, in seconds
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Identifier stamped on every write; derived from host and pid if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Optimistic update attempts for `touch` before giving up
    #[serde(default = "default_touch_attempts")]
    pub touch_attempts: usize,
}

/// Idle pruning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruningConfig {
    /// Tick interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Idle time after which sessions and metadata are reclaimed, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Upper bound on idle sessions kept resident in this process
    #[serde(default = "default_max_idle_sessions")]
    pub max_idle_sessions: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend() -> StoreBackend {
    StoreBackend::Local
}

fn default_key_prefix() -> String {
    "tether:session:".to_string()
}

fn default_ttl_secs() -> u64 {
    2 * 60 * 60
}

fn default_touch_attempts() -> usize {
    3
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_idle_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_max_idle_sessions() -> usize {
    10_000
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            key_prefix: default_key_prefix(),
            default_ttl_secs: default_ttl_secs(),
            instance_id: None,
            touch_attempts: default_touch_attempts(),
        }
    }
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_idle_sessions: default_max_idle_sessions(),
        }
    }
}

impl StoreConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Configured instance id, or `<hostname>-<pid>`
    pub fn resolved_instance_id(&self) -> String {
        match &self.instance_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => default_instance_id(),
        }
    }
}

impl PruningConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl TetherConfig {
    /// Reject values that would make the store or pruner misbehave
    pub fn validate(&self) -> Result<(), String> {
        if self.store.key_prefix.is_empty() {
            return Err("store.key_prefix must not be empty".to_string());
        }
        if self.store.default_ttl_secs == 0 {
            return Err("store.default_ttl_secs must be greater than zero".to_string());
        }
        if self.store.touch_attempts == 0 {
            return Err("store.touch_attempts must be at least 1".to_string());
        }
        if self.pruning.interval_ms == 0 {
            return Err("pruning.interval_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Local => write!(f, "local"),
            StoreBackend::Transactional => write!(f, "transactional"),
            StoreBackend::Cache => write!(f, "cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serialization() {
        let config = TetherConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: TetherConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.store.backend, StoreBackend::Local);
        assert_eq!(deserialized.store.key_prefix, "tether:session:");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_str = r#"
            [store]
            backend = "cache"
            instance_id = "node-a"

            [pruning]
            idle_timeout_secs = 60
        "#;
        let config: TetherConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Cache);
        assert_eq!(config.store.resolved_instance_id(), "node-a");
        assert_eq!(config.store.touch_attempts, 3);
        assert_eq!(config.pruning.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.pruning.max_idle_sessions, 10_000);
        assert_eq!(config.global.log_level, "info");
    }

    #[test]
    fn test_instance_id_fallback() {
        let config = StoreConfig {
            instance_id: Some("  ".to_string()),
            ..StoreConfig::default()
        };
        let id = config.resolved_instance_id();
        assert!(id.ends_with(&format!("-{}", std::process::id())));
    }

    #[test]
    fn test_validate() {
        let mut config = TetherConfig::default();
        assert!(config.validate().is_ok());

        config.store.touch_attempts = 0;
        assert!(config.validate().is_err());

        config.store.touch_attempts = 3;
        config.store.key_prefix.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(StoreBackend::Local.to_string(), "local");
        assert_eq!(StoreBackend::Transactional.to_string(), "transactional");
        assert_eq!(StoreBackend::Cache.to_string(), "cache");
    }
}
