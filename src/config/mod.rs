use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid setting {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Communication layer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    pub memory_timeout_ms: u64,
    pub firmware_timeout_ms: u64,
    pub download_packet_timeout_ms: u64,
    pub download_settle_ms: u64,
    pub connect_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub reconnect_on_transient: bool,
    pub frame_commands: bool,
    pub serial_baud_rate: u32,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            memory_timeout_ms: 2000,
            firmware_timeout_ms: 5000,
            download_packet_timeout_ms: 2000,
            download_settle_ms: 500,
            connect_timeout_ms: 5000,
            disconnect_timeout_ms: 1000,
            reconnect_on_transient: true,
            frame_commands: true,
            serial_baud_rate: 115200,
        }
    }
}

impl CommConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: CommConfig = serde_json::from_str(&text)?;
        config.validate()?;
        log::info!("Loaded communication settings from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.validate()?;
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("memory_timeout_ms", self.memory_timeout_ms),
            ("firmware_timeout_ms", self.firmware_timeout_ms),
            ("download_packet_timeout_ms", self.download_packet_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("disconnect_timeout_ms", self.disconnect_timeout_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::InvalidValue { field, reason: "must be greater than zero".into() });
            }
        }
        if self.serial_baud_rate == 0 {
            return Err(ConfigError::InvalidValue {
                field: "serial_baud_rate",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn memory_timeout(&self) -> Duration {
        Duration::from_millis(self.memory_timeout_ms)
    }

    pub fn firmware_timeout(&self) -> Duration {
        Duration::from_millis(self.firmware_timeout_ms)
    }

    pub fn download_packet_timeout(&self) -> Duration {
        Duration::from_millis(self.download_packet_timeout_ms)
    }

    pub fn download_settle(&self) -> Duration {
        Duration::from_millis(self.download_settle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("{}-{}.json", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_defaults() {
        let config = CommConfig::default();
        assert_eq!(config.memory_timeout(), Duration::from_millis(2000));
        assert_eq!(config.firmware_timeout(), Duration::from_millis(5000));
        assert!(config.reconnect_on_transient);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = temp_path("comm-partial");
        std::fs::write(&path, r#"{ "memory_timeout_ms": 750, "frame_commands": false }"#).unwrap();
        let config = CommConfig::load(&path).unwrap();
        assert_eq!(config.memory_timeout_ms, 750);
        assert!(!config.frame_commands);
        assert_eq!(config.firmware_timeout_ms, 5000);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("comm-save");
        let config = CommConfig { connect_timeout_ms: 1234, ..CommConfig::default() };
        config.save(&path).unwrap();
        assert_eq!(CommConfig::load(&path).unwrap(), config);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = CommConfig { memory_timeout_ms: 0, ..CommConfig::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "memory_timeout_ms", .. })
        ));
    }
}
