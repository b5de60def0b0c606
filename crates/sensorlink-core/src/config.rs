//! Application configuration management.
//!
//! Handles loading, saving, and validating sensorlink configuration:
//! - Operation timeout and retry policy for sessions
//! - Reconnect behaviour of the registry
//! - Profile parameters (wheel circumference)
//! - HTTP server settings
//! - Peripherals managed at startup
//!
//! Configuration is layered with the `config` crate: built-in defaults, then
//! an optional TOML file, then `SENSORLINK__`-prefixed environment variables
//! (e.g. `SENSORLINK__SESSION__MAX_RETRIES=5`).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{is_valid_mac_address, PeripheralHandle, PeripheralId, Profile};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SENSORLINK";

/// Errors from loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No file at the given path.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Merging or deserializing the layered sources failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// Serializing to TOML failed.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// No platform config directory could be determined.
    #[error("Cannot determine config directory")]
    NoConfigDirectory,

    /// A single field is invalid.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-session operation policy.
    pub session: SessionConfig,
    /// Registry behaviour.
    pub registry: RegistryConfig,
    /// Profile parameters.
    pub profiles: ProfilesConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Peripherals connected at startup.
    pub peripherals: Vec<PeripheralConfig>,
}

/// Timeout and retry policy applied to every wire operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Per-attempt timeout in milliseconds.
    pub operation_timeout_ms: u64,
    /// Retries after the first attempt for retriable failures.
    pub max_retries: u8,
    /// Linear backoff step in milliseconds: the n-th retry waits `n × step`.
    pub retry_backoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 10_000,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl SessionConfig {
    /// Per-attempt timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Backoff step.
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Registry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Re-issue connects for managed peripherals when the radio comes back.
    pub reconnect_on_radio_enabled: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reconnect_on_radio_enabled: true,
        }
    }
}

/// Profile parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    /// Wheel circumference for cycling speed, in millimetres.
    pub wheel_circumference_mm: u16,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        // 700x25c road tyre
        Self {
            wheel_circumference_mm: 2105,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to bind.
    pub bind_address: String,
    /// JSON file logging and compact stdout when `true`.
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            production: false,
        }
    }
}

/// A peripheral to manage from startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralConfig {
    /// Bluetooth address.
    pub address: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Profile to speak.
    pub profile: Profile,
}

impl Config {
    /// Load from the platform default path, falling back to defaults when
    /// the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or fails validation.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load from `path` (optional) layered over defaults and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result fails
    /// validation.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        let loaded: Self = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?)
            .add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Load from `path`, which must exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file is missing, otherwise as
    /// [`Self::load_from`].
    pub fn load_existing(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::load_from(path)
    }

    /// Save as pretty TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default configuration file path.
    ///
    /// `/etc/sensorlink/config.toml` on Linux, the platform config directory
    /// elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDirectory`] if no home directory is known.
    pub fn default_path() -> ConfigResult<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/etc/sensorlink/config.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", "sensorlink")
                .ok_or(ConfigError::NoConfigDirectory)?;
            Ok(dirs.config_dir().join("config.toml"))
        }
    }

    /// Validate every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single error, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: String| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message,
            });
        };

        if !(100..=120_000).contains(&self.session.operation_timeout_ms) {
            invalid(
                "session.operation_timeout_ms",
                format!(
                    "must be between 100 and 120000, got {}",
                    self.session.operation_timeout_ms
                ),
            );
        }
        if self.session.max_retries > 10 {
            invalid(
                "session.max_retries",
                format!("must be at most 10, got {}", self.session.max_retries),
            );
        }
        if self.session.retry_backoff_ms > 60_000 {
            invalid(
                "session.retry_backoff_ms",
                format!(
                    "must be at most 60000, got {}",
                    self.session.retry_backoff_ms
                ),
            );
        }
        if !(500..=4000).contains(&self.profiles.wheel_circumference_mm) {
            invalid(
                "profiles.wheel_circumference_mm",
                format!(
                    "must be between 500 and 4000, got {}",
                    self.profiles.wheel_circumference_mm
                ),
            );
        }
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            invalid(
                "server.bind_address",
                format!("'{}' is not a socket address", self.server.bind_address),
            );
        }

        let mut seen = HashSet::new();
        for (index, peripheral) in self.peripherals.iter().enumerate() {
            let field = format!("peripherals[{index}].address");
            if !is_valid_mac_address(&peripheral.address) {
                invalid(
                    &field,
                    format!("'{}' is not a Bluetooth address", peripheral.address),
                );
            } else if !seen.insert(peripheral.address.to_ascii_uppercase()) {
                invalid(&field, format!("duplicate address '{}'", peripheral.address));
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Handles and profiles for the startup peripherals.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid address.
    pub fn managed_peripherals(&self) -> ConfigResult<Vec<(PeripheralHandle, Profile)>> {
        self.peripherals
            .iter()
            .enumerate()
            .map(|(index, p)| {
                let id: PeripheralId =
                    p.address
                        .parse()
                        .map_err(|_| ConfigError::ValidationError {
                            field: format!("peripherals[{index}].address"),
                            message: format!("'{}' is not a Bluetooth address", p.address),
                        })?;
                let handle = match &p.name {
                    Some(name) => PeripheralHandle::new(id).with_name(name.clone()),
                    None => PeripheralHandle::new(id),
                };
                Ok((handle, p.profile))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.operation_timeout(), Duration::from_secs(10));
        assert!(config.registry.reconnect_on_radio_enabled);
        assert!(config.peripherals.is_empty());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.session.max_retries = 50;
        config.profiles.wheel_circumference_mm = 10;
        config.server.bind_address = "not an address".into();
        config.peripherals.push(PeripheralConfig {
            address: "bogus".into(),
            name: None,
            profile: Profile::HeartRate,
        });

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 4),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_single_validation_error_is_not_wrapped() {
        let mut config = Config::default();
        config.session.operation_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { ref field, .. }) if field == "session.operation_timeout_ms"
        ));
    }

    #[test]
    fn test_duplicate_peripherals_rejected() {
        let mut config = Config::default();
        for address in ["AA:BB:CC:DD:EE:FF", "aa:bb:cc:dd:ee:ff"] {
            config.peripherals.push(PeripheralConfig {
                address: address.into(),
                name: None,
                profile: Profile::HeartRate,
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.session.max_retries = 5;
        config.peripherals.push(PeripheralConfig {
            address: "01:02:03:04:05:06".into(),
            name: Some("Strap".into()),
            profile: Profile::HeartRate,
        });
        config.save(&path).unwrap();

        let loaded = Config::load_existing(&path).unwrap();
        assert_eq!(loaded, config);

        let managed = loaded.managed_peripherals().unwrap();
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].0.name.as_deref(), Some("Strap"));
        assert_eq!(managed[0].1, Profile::HeartRate);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());
        assert!(matches!(
            Config::load_existing(&path),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[profiles]\nwheel_circumference_mm = 2000\n").unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.profiles.wheel_circumference_mm, 2000);
        assert_eq!(loaded.session, SessionConfig::default());
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nmax_retries = 99\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
