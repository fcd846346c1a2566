use std::env;
use std::path::Path;
use std::time::Duration;

use aes_gcm::aead::{KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const ENV_DATABASE_URL: &str = "WIRESMITH_DATABASE_URL";
pub const ENV_KEY_SECRET: &str = "WIRESMITH_KEY_SECRET";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineToml {
    pub database_url: String,
    /// 64 hex characters; encrypts private and preshared keys at rest.
    pub key_secret: Option<String>,
    /// Re-apply servers that were running before the last shutdown.
    pub restore_on_startup: bool,
    pub drivers: DriverSection,
    pub hooks: HookSection,
    pub events: EventSection,
    pub stats: StatsSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSection {
    pub timeout_secs: u64,
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSection {
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSection {
    pub interval_secs: u64,
    pub only_with_subscribers: bool,
}

impl Default for EngineToml {
    fn default() -> Self {
        Self {
            database_url: "sqlite:///var/lib/wiresmith/wiresmith.db".to_string(),
            key_secret: None,
            restore_on_startup: true,
            drivers: DriverSection::default(),
            hooks: HookSection::default(),
            events: EventSection::default(),
            stats: StatsSection::default(),
        }
    }
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            probe_timeout_secs: 10,
        }
    }
}

impl Default for HookSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            concurrency: 4,
        }
    }
}

impl Default for EventSection {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            only_with_subscribers: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("key_secret must be exactly 64 hex characters (32 bytes)")]
    InvalidKeySecret,

    #[error("key_secret is not set (config file or {ENV_KEY_SECRET})")]
    MissingKeySecret,

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

/// Runtime knobs handed to the engine, derived from [`EngineToml`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub driver_timeout: Duration,
    pub probe_timeout: Duration,
    pub hook_timeout: Duration,
    pub hook_concurrency: usize,
    pub event_queue_capacity: usize,
    pub stats_interval: Duration,
    pub stats_only_with_subscribers: bool,
    pub restore_on_startup: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineToml::default().settings()
    }
}

impl EngineToml {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            driver_timeout: Duration::from_secs(self.drivers.timeout_secs),
            probe_timeout: Duration::from_secs(self.drivers.probe_timeout_secs),
            hook_timeout: Duration::from_secs(self.hooks.timeout_secs),
            hook_concurrency: self.hooks.concurrency,
            event_queue_capacity: self.events.queue_capacity,
            stats_interval: Duration::from_secs(self.stats.interval_secs),
            stats_only_with_subscribers: self.stats.only_with_subscribers,
            restore_on_startup: self.restore_on_startup,
        }
    }

    pub fn key_secret(&self) -> Result<[u8; 32], ConfigError> {
        let hex = self
            .key_secret
            .as_deref()
            .ok_or(ConfigError::MissingKeySecret)?;
        parse_hex_32(hex)
    }

    /// Environment variables win over file values.
    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var(ENV_DATABASE_URL) {
            debug!("database url overridden from environment");
            self.database_url = url;
        }
        if let Ok(secret) = env::var(ENV_KEY_SECRET) {
            debug!("key secret overridden from environment");
            self.key_secret = Some(secret);
        }
    }
}

/// A fresh random `key_secret` value.
pub fn generate_key_secret() -> String {
    Aes256Gcm::generate_key(&mut OsRng)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn parse_hex_32(hex: &str) -> Result<[u8; 32], ConfigError> {
    let hex = hex.trim();
    if hex.len() != 64 || !hex.is_ascii() {
        return Err(ConfigError::InvalidKeySecret);
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| ConfigError::InvalidKeySecret)?;
    }
    Ok(out)
}

pub async fn load(path: &Path) -> Result<EngineToml, ConfigError> {
    debug!(path = %path.display(), "loading config");

    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: EngineToml = toml::from_str(&contents)?;
            info!(
                path = %path.display(),
                restore_on_startup = config.restore_on_startup,
                "loaded config"
            );
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            Ok(EngineToml::default())
        }
        Err(e) => Err(ConfigError::Read(e)),
    }
}

pub async fn save(path: &Path, config: &EngineToml) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let contents = toml::to_string_pretty(config)?;
    tokio::fs::write(path, contents).await?;
    info!(path = %path.display(), "saved config");
    Ok(())
}

pub fn validate(config: &EngineToml) -> Result<(), ConfigError> {
    let checks: [(&'static str, bool); 5] = [
        ("drivers.timeout_secs", config.drivers.timeout_secs > 0),
        ("drivers.probe_timeout_secs", config.drivers.probe_timeout_secs > 0),
        ("hooks.timeout_secs", config.hooks.timeout_secs > 0),
        ("hooks.concurrency", config.hooks.concurrency > 0),
        ("events.queue_capacity", config.events.queue_capacity > 0),
    ];
    for (field, ok) in checks {
        if !ok {
            return Err(ConfigError::Zero { field });
        }
    }
    if config.stats.interval_secs == 0 {
        return Err(ConfigError::Zero {
            field: "stats.interval_secs",
        });
    }
    config.key_secret()?;
    debug!("config validated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const SECRET: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn sample_config() -> EngineToml {
        EngineToml {
            key_secret: Some(SECRET.into()),
            ..EngineToml::default()
        }
    }

    #[test]
    fn round_trip_toml() {
        let config = sample_config();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: EngineToml = toml::from_str(&serialized).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn parse_empty_file() {
        let parsed: EngineToml = toml::from_str("").unwrap();
        assert_eq!(parsed, EngineToml::default());
        assert_eq!(parsed.drivers.timeout_secs, 30);
        assert_eq!(parsed.events.queue_capacity, 256);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let parsed: EngineToml = toml::from_str("[hooks]\nconcurrency = 8\n").unwrap();
        assert_eq!(parsed.hooks.concurrency, 8);
        assert_eq!(parsed.hooks.timeout_secs, 30);
    }

    #[test]
    fn key_secret_decodes() {
        let key = sample_config().key_secret().unwrap();
        assert_eq!(key[0], 0);
        assert_eq!(key[31], 0x1f);
    }

    #[test_case(Some(SECRET), true; "valid")]
    #[test_case(Some("abcd"), false; "short")]
    #[test_case(Some("zz0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"), false; "not hex")]
    #[test_case(None, false; "missing")]
    fn validate_key_secret(secret: Option<&str>, ok: bool) {
        let config = EngineToml {
            key_secret: secret.map(str::to_string),
            ..EngineToml::default()
        };
        assert_eq!(validate(&config).is_ok(), ok);
    }

    #[test]
    fn generated_secret_validates() {
        let config = EngineToml {
            key_secret: Some(generate_key_secret()),
            ..EngineToml::default()
        };
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut config = sample_config();
        config.events.queue_capacity = 0;
        assert!(matches!(
            validate(&config),
            Err(ConfigError::Zero { field: "events.queue_capacity" })
        ));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults_and_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded, EngineToml::default());

        save(&path, &sample_config()).await.unwrap();
        let reloaded = load(&path).await.unwrap();
        assert_eq!(reloaded, sample_config());
    }
}
