//! Avisos engine settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AvisosError, Result};

/// Root configuration (`~/.avisos/config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvisosConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppSettings,
}

impl AvisosConfig {
    /// Load config from the default path, or defaults when absent.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AvisosError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AvisosError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.tick_secs == 0 {
            return Err(AvisosError::Config("scheduler.tick_secs must be > 0".into()));
        }
        if s.tick_secs > 60 {
            tracing::warn!(
                "⚠️ scheduler.tick_secs = {} exceeds a minute; fixed-time rules may be missed",
                s.tick_secs
            );
        }
        if s.max_workers == 0 || s.per_rule_concurrency == 0 {
            return Err(AvisosError::Config(
                "scheduler.max_workers and scheduler.per_rule_concurrency must be > 0".into(),
            ));
        }
        if s.max_attempts == 0 {
            return Err(AvisosError::Config("scheduler.max_attempts must be > 0".into()));
        }
        self.scheduler.timezone()?;
        Ok(())
    }

    /// Save config to a path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AvisosError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Avisos home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".avisos")
    }
}

/// Scheduler loop, retry and concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Concurrent (tenant, rule) units per tick.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Concurrent sends within one rule.
    #[serde(default = "default_per_rule_concurrency")]
    pub per_rule_concurrency: usize,
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff; doubled on every further attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// Pause between consecutive sends of one rule.
    #[serde(default)]
    pub send_spacing_ms: u64,
}

fn default_tick_secs() -> u64 { 60 }
fn default_max_workers() -> usize { 8 }
fn default_per_rule_concurrency() -> usize { 4 }
fn default_dispatch_timeout_secs() -> u64 { 15 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 500 }
fn default_claim_ttl_secs() -> u64 { 300 }
fn default_timezone() -> String { "America/Argentina/Buenos_Aires".into() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            max_workers: default_max_workers(),
            per_rule_concurrency: default_per_rule_concurrency(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            claim_ttl_secs: default_claim_ttl_secs(),
            default_timezone: default_timezone(),
            send_spacing_ms: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn send_spacing(&self) -> Duration {
        Duration::from_millis(self.send_spacing_ms)
    }

    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        self.default_timezone.parse::<chrono_tz::Tz>().map_err(|_| {
            AvisosError::Config(format!(
                "Unknown scheduler.default_timezone '{}'",
                self.default_timezone
            ))
        })
    }
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.avisos/avisos.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl StoreConfig {
    /// `db_path` with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }
}

/// WhatsApp Business Cloud API credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppSettings {
    #[serde(default)]
    pub access_token: String,
    /// Default sender; tenants may override it.
    #[serde(default)]
    pub phone_number_id: String,
    /// WhatsApp Business Account id, needed for the template catalog.
    #[serde(default)]
    pub business_account_id: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_api_version() -> String { "v22.0".into() }
fn default_base_url() -> String { "https://graph.facebook.com".into() }

impl Default for WhatsAppSettings {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            phone_number_id: String::new(),
            business_account_id: String::new(),
            api_version: default_api_version(),
            base_url: default_base_url(),
        }
    }
}

impl WhatsAppSettings {
    /// Configured token, else `META_WHATSAPP_TOKEN`, else `WHATSAPP_TOKEN`.
    pub fn resolved_token(&self) -> Option<String> {
        if !self.access_token.is_empty() {
            return Some(self.access_token.clone());
        }
        ["META_WHATSAPP_TOKEN", "WHATSAPP_TOKEN"]
            .iter()
            .filter_map(|k| std::env::var(k).ok())
            .find(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AvisosConfig::from_toml("").unwrap();
        assert_eq!(config.scheduler.tick_secs, 60);
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.whatsapp.api_version, "v22.0");
        assert_eq!(
            config.scheduler.timezone().unwrap(),
            chrono_tz::America::Argentina::Buenos_Aires
        );
    }

    #[test]
    fn test_partial_override() {
        let config = AvisosConfig::from_toml(
            r#"
            [scheduler]
            tick_secs = 30
            default_timezone = "Europe/Madrid"

            [whatsapp]
            phone_number_id = "1234"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.tick_period(), Duration::from_secs(30));
        assert_eq!(config.scheduler.max_workers, 8);
        assert_eq!(config.whatsapp.phone_number_id, "1234");
        assert_eq!(config.whatsapp.base_url, "https://graph.facebook.com");
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(AvisosConfig::from_toml("[scheduler]\ntick_secs = 0").is_err());
        let unknown_zone = "[scheduler]\ndefault_timezone = \"Nowhere/City\"";
        assert!(AvisosConfig::from_toml(unknown_zone).is_err());
        assert!(AvisosConfig::from_toml("[scheduler\n").is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = AvisosConfig::default();
        config.scheduler.max_workers = 2;
        config.save_to(&path).unwrap();
        let loaded = AvisosConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.max_workers, 2);
    }
}
