//! # Dashboard Configuration
//!
//! Where the sources live, how long each entity is trusted, and how hard
//! the primary source is retried.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     BOTWATCH_API_URL=https://bot.example.com                           │
//! │     BOTWATCH_STORE_URL=wss://store.example.com/live                    │
//! │     BOTWATCH_STORE_KEY=...                                             │
//! │     BOTWATCH_REQUEST_TIMEOUT_SECS=10                                   │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/botwatch/botwatch.toml (Linux)                           │
//! │     ~/Library/Application Support/dev.botwatch.botwatch/... (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     localhost primary, no secondary, default TTL bands                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [primary]
//! base_url = "https://bot.example.com"
//! request_timeout_secs = 10
//!
//! [secondary]
//! url = "wss://store.example.com/live"
//! api_key = "..."
//!
//! [cache]
//! events_ttl_secs = 15
//! trades_ttl_secs = 15
//! account_ttl_secs = 30
//! correlation_pairs_ttl_secs = 60
//! performance_ttl_secs = 120
//!
//! [retry]
//! max_retries = 3
//! initial_backoff_ms = 1000
//! max_backoff_secs = 30
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use botwatch_core::EntityKind;

use crate::error::{SyncError, SyncResult};

/// Environment variable names.
pub const ENV_API_URL: &str = "BOTWATCH_API_URL";
pub const ENV_STORE_URL: &str = "BOTWATCH_STORE_URL";
pub const ENV_STORE_KEY: &str = "BOTWATCH_STORE_KEY";
pub const ENV_REQUEST_TIMEOUT: &str = "BOTWATCH_REQUEST_TIMEOUT_SECS";

// =============================================================================
// Primary Source
// =============================================================================

/// Request/response aggregation endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimarySettings {
    /// Base URL; endpoint paths such as `/api/trades` are joined onto it.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Upper bound for one request attempt (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for PrimarySettings {
    fn default() -> Self {
        PrimarySettings {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Secondary Source
// =============================================================================

/// Live-query store. Without a URL the fallback path reports the secondary
/// as unavailable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecondarySettings {
    /// WebSocket URL of the store.
    #[serde(default)]
    pub url: Option<String>,

    /// Credential sent in the auth handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

// =============================================================================
// Cache TTL Bands
// =============================================================================

/// Time-to-live per entity kind (seconds). Fast-moving data gets short TTLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_events_ttl")]
    pub events_ttl_secs: u64,

    #[serde(default = "default_trades_ttl")]
    pub trades_ttl_secs: u64,

    #[serde(default = "default_account_ttl")]
    pub account_ttl_secs: u64,

    #[serde(default = "default_correlation_pairs_ttl")]
    pub correlation_pairs_ttl_secs: u64,

    #[serde(default = "default_performance_ttl")]
    pub performance_ttl_secs: u64,
}

fn default_events_ttl() -> u64 {
    15
}
fn default_trades_ttl() -> u64 {
    15
}
fn default_account_ttl() -> u64 {
    30
}
fn default_correlation_pairs_ttl() -> u64 {
    60
}
fn default_performance_ttl() -> u64 {
    120
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            events_ttl_secs: default_events_ttl(),
            trades_ttl_secs: default_trades_ttl(),
            account_ttl_secs: default_account_ttl(),
            correlation_pairs_ttl_secs: default_correlation_pairs_ttl(),
            performance_ttl_secs: default_performance_ttl(),
        }
    }
}

impl CacheSettings {
    /// Returns the TTL for an entity kind.
    pub fn ttl_for(&self, kind: EntityKind) -> Duration {
        let secs = match kind {
            EntityKind::Events => self.events_ttl_secs,
            EntityKind::Trades => self.trades_ttl_secs,
            EntityKind::Account => self.account_ttl_secs,
            EntityKind::CorrelationPairs => self.correlation_pairs_ttl_secs,
            EntityKind::Performance => self.performance_ttl_secs,
        };
        Duration::from_secs(secs)
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Retry policy for source reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff cap (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Growth factor between delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    30
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetrySettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete data-layer configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default)]
    pub primary: PrimarySettings,

    #[serde(default)]
    pub secondary: SecondarySettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl DashboardConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (botwatch.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading dashboard config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load dashboard config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Dashboard config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let primary = url::Url::parse(&self.primary.base_url)?;
        if !matches!(primary.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "Primary URL must start with http:// or https://, got: {}",
                self.primary.base_url
            )));
        }

        if let Some(ref raw) = self.secondary.url {
            let store = url::Url::parse(raw)?;
            if !matches!(store.scheme(), "ws" | "wss") {
                return Err(SyncError::InvalidUrl(format!(
                    "Store URL must start with ws:// or wss://, got: {}",
                    raw
                )));
            }
        }

        if self.primary.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.retry.multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(
                "retry multiplier must be at least 1.0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from a variable lookup.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL) {
            debug!(url = %url, "Overriding primary URL from environment");
            self.primary.base_url = url;
        }

        if let Some(url) = lookup(ENV_STORE_URL) {
            debug!(url = %url, "Overriding store URL from environment");
            self.secondary.url = Some(url);
        }

        if let Some(key) = lookup(ENV_STORE_KEY) {
            self.secondary.api_key = Some(key);
        }

        if let Some(timeout) = lookup(ENV_REQUEST_TIMEOUT) {
            match timeout.parse::<u64>() {
                Ok(secs) => self.primary.request_timeout_secs = secs,
                Err(_) => warn!(value = %timeout, "Ignoring non-numeric request timeout"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "botwatch", "botwatch")
            .map(|dirs| dirs.config_dir().join("botwatch.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.primary.request_timeout_secs)
    }

    pub fn ttl_for(&self, kind: EntityKind) -> Duration {
        self.cache.ttl_for(kind)
    }

    pub fn store_url(&self) -> Option<&str> {
        self.secondary.url.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = DashboardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert!(config.store_url().is_none());
    }

    #[test]
    fn test_default_ttl_bands() {
        let config = DashboardConfig::default();
        assert_eq!(config.ttl_for(EntityKind::Events), Duration::from_secs(15));
        assert_eq!(config.ttl_for(EntityKind::Trades), Duration::from_secs(15));
        assert_eq!(config.ttl_for(EntityKind::Account), Duration::from_secs(30));
        assert_eq!(config.ttl_for(EntityKind::CorrelationPairs), Duration::from_secs(60));
        assert_eq!(config.ttl_for(EntityKind::Performance), Duration::from_secs(120));
    }

    #[test]
    fn test_config_validation() {
        let mut config = DashboardConfig::default();

        config.primary.base_url = "ftp://bot".to_string();
        assert!(config.validate().is_err());

        config.primary.base_url = "https://bot.example.com".to_string();
        config.secondary.url = Some("http://store".to_string());
        assert!(config.validate().is_err());

        config.secondary.url = Some("wss://store.example.com/live".to_string());
        assert!(config.validate().is_ok());

        config.primary.request_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_API_URL, "https://api.example.com"),
            (ENV_STORE_URL, "ws://localhost:9000"),
            (ENV_STORE_KEY, "secret"),
            (ENV_REQUEST_TIMEOUT, "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = DashboardConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.primary.base_url, "https://api.example.com");
        assert_eq!(config.store_url(), Some("ws://localhost:9000"));
        assert_eq!(config.secondary.api_key.as_deref(), Some("secret"));
        assert_eq!(config.primary.request_timeout_secs, 10);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: DashboardConfig = toml::from_str(
            r#"
            [cache]
            trades_ttl_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.trades_ttl_secs, 5);
        assert_eq!(config.cache.account_ttl_secs, 30);
        assert_eq!(config.primary.base_url, "http://localhost:8000");
    }

    #[test]
    fn test_save_and_load_roundtrip_through_file() {
        let path = std::env::temp_dir().join(format!("botwatch-config-{}.toml", uuid::Uuid::new_v4()));
        let mut config = DashboardConfig::default();
        config.cache.events_ttl_secs = 7;
        config.save(Some(path.clone())).unwrap();

        let loaded: DashboardConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.cache.events_ttl_secs, 7);

        let _ = std::fs::remove_file(path);
    }
}
