//! Persisted settings.
//!
//! One TOML file, read before the loop starts. Every section and field has a
//! default, so a missing default file or a partial file is fine. Command line
//! flags are applied on top afterwards.

use crate::controller::event_processor::ProcessorSettings;
use crate::controller::{ControllerKind, KeyCode, DEFAULT_QUIT_BUTTON};
use crate::dispatch::timing::MAX_PRECISION_BITS;
use crate::priority::DEFAULT_RT_PRIORITY;
use crate::transport::serial::DEFAULT_BAUD_RATE;
use crate::transport::SendFailurePolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const CONFIG_DIR: &str = "padlink";
const CONFIG_FILE: &str = "config.toml";

// Config errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub control: ControlConfig,
    pub transport: TransportConfig,
    pub mapping: MappingConfig,
    pub priority: PriorityConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub refresh_ms: u64,
    pub precision_bits: u8,
    pub force_updates: bool,
    pub controller: ControllerKind,
    /// Seconds between loop statistics reports, 0 disables them.
    pub stats_interval_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            refresh_ms: 10,
            precision_bits: 8,
            force_updates: false,
            controller: ControllerKind::default(),
            stats_interval_secs: 10,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Serial,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Serial device path or `host:port`.
    pub target: Option<String>,
    pub baud_rate: u32,
    pub on_send_failure: SendFailurePolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            target: None,
            baud_rate: DEFAULT_BAUD_RATE,
            on_send_failure: SendFailurePolicy::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MappingConfig {
    pub deadzone: f32,
    pub mouse_sensitivity: f64,
    pub mouse_axes: [usize; 2],
    /// Key name to frame button.
    pub keys: BTreeMap<String, u8>,
    pub gamepad_index: Option<usize>,
    /// Gamepad button that quits, `None` forwards every button.
    pub quit_button: Option<u8>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            deadzone: 0.05,
            mouse_sensitivity: 1.0,
            mouse_axes: [2, 3],
            keys: BTreeMap::new(),
            gamepad_index: None,
            quit_button: Some(DEFAULT_QUIT_BUTTON),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PriorityConfig {
    pub enabled: bool,
    pub level: i32,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: DEFAULT_RT_PRIORITY,
        }
    }
}

/// `<config dir>/padlink/config.toml`, if the platform has a config dir.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut path| {
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    })
}

impl AppConfig {
    /// Loads `path`, or the default location when `None`.
    ///
    /// An explicit path must exist. A missing default file yields defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_path() {
                Some(path) => (path, false),
                None => {
                    debug!("No config directory on this platform, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !explicit && !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::ReadError {
                path: path.clone(),
                source,
            })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::ParseError {
            path: path.clone(),
            source,
        })?;

        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control.refresh_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "control.refresh_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.control.precision_bits == 0 || self.control.precision_bits > MAX_PRECISION_BITS {
            return Err(ConfigError::InvalidValue {
                field: "control.precision_bits",
                reason: format!("must be between 1 and {}", MAX_PRECISION_BITS),
            });
        }
        if !(0.0..1.0).contains(&self.mapping.deadzone) {
            return Err(ConfigError::InvalidValue {
                field: "mapping.deadzone",
                reason: "must be in [0, 1)".to_string(),
            });
        }
        if self.mapping.quit_button.is_some_and(|button| button >= 32) {
            return Err(ConfigError::InvalidValue {
                field: "mapping.quit_button",
                reason: "must be a button index below 32".to_string(),
            });
        }
        for name in self.mapping.keys.keys() {
            if KeyCode::from_name(name).is_none() {
                return Err(ConfigError::InvalidValue {
                    field: "mapping.keys",
                    reason: format!("unknown key name '{}'", name),
                });
            }
        }
        Ok(())
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_millis(self.control.refresh_ms)
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        let keys = self
            .mapping
            .keys
            .iter()
            .filter_map(|(name, button)| KeyCode::from_name(name).map(|key| (key, *button)))
            .collect();

        ProcessorSettings {
            deadzone: self.mapping.deadzone,
            mouse_sensitivity: self.mapping.mouse_sensitivity,
            mouse_axes: self.mapping.mouse_axes,
            keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = AppConfig::parse(
            r#"
            [control]
            refresh_ms = 4
            controller = "360pad"

            [transport]
            kind = "serial"
            target = "/dev/ttyUSB0"
            on_send_failure = "abort"

            [mapping.keys]
            space = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.control.refresh_ms, 4);
        assert_eq!(config.control.precision_bits, 8);
        assert_eq!(config.control.controller, ControllerKind::X360Pad);
        assert_eq!(config.transport.kind, TransportKind::Serial);
        assert_eq!(config.transport.on_send_failure, SendFailurePolicy::Abort);
        assert_eq!(config.transport.baud_rate, DEFAULT_BAUD_RATE);
        assert!(config.priority.enabled);
        assert_eq!(config.mapping.quit_button, Some(DEFAULT_QUIT_BUTTON));
        assert_eq!(config.processor_settings().keys.get(&KeyCode(32)), Some(&0));
        config.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.control.refresh_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.control.precision_bits = 17;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.mapping.quit_button = Some(40);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.mapping.keys.insert("nonsense".to_string(), 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "mapping.keys", .. })
        ));
    }

    #[test]
    fn serialized_defaults_parse_back() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(AppConfig::parse(&text).unwrap(), config);
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/padlink.toml")))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[tokio::test]
    async fn load_reads_a_real_file() {
        let path = std::env::temp_dir().join(format!("padlink-config-{}.toml", std::process::id()));
        tokio::fs::write(&path, "[control]\nprecision_bits = 16\n").await.unwrap();

        let config = AppConfig::load(Some(&path)).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(config.control.precision_bits, 16);
    }
}
