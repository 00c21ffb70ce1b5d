//! Configuration loading for TinyExchange.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Error;
use crate::exchange::AutoAcceptPolicy;

pub type Result<T> = std::result::Result<T, Error>;

/// Get the TinyExchange home directory (~/.tinyexchange).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".tinyexchange"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.tinyexchange/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}. Run 'tinyexchange config init' first.",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Write settings to ~/.tinyexchange/settings.json
pub fn save_settings(settings: &Settings) -> Result<PathBuf> {
    validate_settings(settings)?;

    let path = get_settings_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(settings)?)?;

    tracing::info!("Saved settings to {}", path.display());
    Ok(path)
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.pickup.max_batch_size == 0 {
        return Err(Error::Config(
            "pickup.max_batch_size must be greater than zero".to_string(),
        ));
    }
    if settings.pickup.max_queue_size_per_connection == Some(0) {
        return Err(Error::Config(
            "pickup.max_queue_size_per_connection must be greater than zero when set".to_string(),
        ));
    }
    if !matches!(settings.exchange.protocol_version.as_str(), "v1" | "v2") {
        return Err(Error::Config(format!(
            "exchange.protocol_version '{}' is not one of v1, v2",
            settings.exchange.protocol_version
        )));
    }
    Ok(())
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

/// Exchange protocol configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ExchangeSettings {
    #[serde(default)]
    pub credential_auto_accept: AutoAcceptPolicy,
    #[serde(default)]
    pub proof_auto_accept: AutoAcceptPolicy,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

fn default_protocol_version() -> String {
    "v2".to_string()
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            credential_auto_accept: AutoAcceptPolicy::default(),
            proof_auto_accept: AutoAcceptPolicy::default(),
            protocol_version: default_protocol_version(),
        }
    }
}

/// When queued messages are removed from the holder's queue.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Removed only once the recipient acknowledges them.
    #[default]
    AtLeastOnce,
    /// Removed as soon as they are read for delivery.
    AtMostOnce,
}

/// Message pickup configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PickupSettings {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    pub max_queue_size_per_connection: Option<usize>,
}

fn default_max_batch_size() -> usize {
    10
}

impl Default for PickupSettings {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            delivery_mode: DeliveryMode::default(),
            max_queue_size_per_connection: None,
        }
    }
}

/// Storage configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StorageSettings {
    pub queue_db_path: Option<PathBuf>,
}

impl StorageSettings {
    /// Queue database path, defaulting to ~/.tinyexchange/queue.db.
    pub fn queue_db_path(&self) -> Result<PathBuf> {
        match &self.queue_db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("queue.db")),
        }
    }
}

/// TinyExchange settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub exchange: ExchangeSettings,

    #[serde(default)]
    pub pickup: PickupSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.pickup.max_batch_size, 10);
        assert_eq!(settings.pickup.delivery_mode, DeliveryMode::AtLeastOnce);
        assert_eq!(settings.exchange.protocol_version, "v2");
        assert_eq!(settings.exchange.credential_auto_accept, AutoAcceptPolicy::Never);
        assert!(validate_settings(&settings).is_ok());
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{
            "exchange": { "proof_auto_accept": "content_approved" },
            "pickup": { "max_batch_size": 25, "delivery_mode": "at_most_once" }
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.exchange.proof_auto_accept, AutoAcceptPolicy::ContentApproved);
        assert_eq!(settings.pickup.max_batch_size, 25);
        assert_eq!(settings.pickup.delivery_mode, DeliveryMode::AtMostOnce);
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let mut settings = Settings::default();
        settings.pickup.max_batch_size = 0;
        assert!(matches!(validate_settings(&settings), Err(Error::Config(_))));

        let mut settings = Settings::default();
        settings.exchange.protocol_version = "v3".to_string();
        assert!(validate_settings(&settings).is_err());
    }
}
