//! Server configuration.
//!
//! Loaded from `config.toml` (or the path in `AUTOCOMBAT_CONFIG`). Every field
//! has a default so a missing file still yields a runnable server.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ConfigError;

pub const CONFIG_PATH_ENV: &str = "AUTOCOMBAT_CONFIG";
pub const BIND_ENV: &str = "AUTOCOMBAT_BIND";
pub const DATABASE_URL_ENV: &str = "AUTOCOMBAT_DATABASE_URL";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub combat: CombatSection,
    pub refresh: RefreshSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: String,
    pub database_url: String,
    pub data_dir: PathBuf,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:2568".to_string(),
            database_url: "sqlite:autocombat.db?mode=rwc".to_string(),
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CombatSection {
    /// Delay between two rounds of the same character
    pub tick_interval_ms: u64,
    pub lock_ttl_ms: u64,
    /// How long a tick waits for a busy lock. 0 = single attempt.
    pub lock_wait_ms: u64,
    pub lock_poll_ms: u64,
    /// Must stay below `lock_ttl_ms`
    pub tick_timeout_ms: u64,
    pub lease_ttl_secs: u64,
    /// Consecutive lease-store failures a loop rides out before it is force-stopped
    pub store_retry_limit: u32,
    pub worker_count: usize,
    /// Below this share of max hp the loop stops on its own
    pub auto_stop_hp_percent: i32,
    pub base_damage: i32,
}

impl Default for CombatSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: 3000,
            lock_ttl_ms: 15_000,
            lock_wait_ms: 0,
            lock_poll_ms: 50,
            tick_timeout_ms: 10_000,
            lease_ttl_secs: 3600,
            store_retry_limit: 3,
            worker_count: 4,
            auto_stop_hp_percent: 20,
            base_damage: 3,
        }
    }
}

impl CombatSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms.max(1))
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_millis(self.tick_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshSection {
    pub sweep_interval_secs: u64,
    /// Age after which an encounter is regenerated even if monsters remain
    pub encounter_ttl_secs: u64,
}

impl Default for RefreshSection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            encounter_ttl_secs: 300,
        }
    }
}

impl RefreshSection {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn encounter_ttl(&self) -> Duration {
        Duration::from_secs(self.encounter_ttl_secs)
    }
}

impl ServerConfig {
    /// Load configuration from the default location, then apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.toml".to_string());
        let mut config = Self::load_from_file(Path::new(&path))?;

        if let Ok(bind) = std::env::var(BIND_ENV) {
            config.server.bind_addr = bind;
        }
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            config.server.database_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let combat = &self.combat;
        if combat.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("combat.tick_interval_ms must be > 0".into()));
        }
        if combat.worker_count == 0 {
            return Err(ConfigError::Invalid("combat.worker_count must be > 0".into()));
        }
        // A slow tick must never outlive its lock
        if combat.tick_timeout_ms >= combat.lock_ttl_ms {
            return Err(ConfigError::Invalid(format!(
                "combat.tick_timeout_ms ({}) must be below combat.lock_ttl_ms ({})",
                combat.tick_timeout_ms, combat.lock_ttl_ms
            )));
        }
        if !(0..=100).contains(&combat.auto_stop_hp_percent) {
            return Err(ConfigError::Invalid(
                "combat.auto_stop_hp_percent must be within 0..=100".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.combat.tick_interval(), Duration::from_secs(3));
        assert!(config.combat.tick_timeout() < config.combat.lock_ttl());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ServerConfig::load_from_file(Path::new("does/not/exist.toml")).unwrap();
        assert_eq!(config.combat.worker_count, 4);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[combat]
tick_interval_ms = 1500

[refresh]
encounter_ttl_secs = 120
"#,
        )
        .unwrap();

        let config = ServerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.combat.tick_interval_ms, 1500);
        assert_eq!(config.combat.lock_ttl_ms, 15_000);
        assert_eq!(config.refresh.encounter_ttl_secs, 120);
        assert_eq!(config.server.bind_addr, "0.0.0.0:2568");
    }

    #[test]
    fn test_timeout_must_be_below_lock_ttl() {
        let mut config = ServerConfig::default();
        config.combat.tick_timeout_ms = config.combat.lock_ttl_ms;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[combat\ntick_interval_ms = ").unwrap();
        assert!(matches!(
            ServerConfig::load_from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
