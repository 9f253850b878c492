//! Configuration management infrastructure.
//!
//! This module provides configuration file support, allowing users to save
//! and load envelope preferences: format family, buffer sizing and logging
//! defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::constants;
use crate::domain::types::EnvelopeFormat;
use crate::engine::envelope::EnvelopeOptions;
use crate::infra::error::{EnvelopeError, EnvelopeResult};

/// Application configuration with all envelope preferences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeConfiguration {
    /// Default envelope format family ("cms", "cryptlib", "smime")
    pub default_format: String,

    /// Hard cap on the main wire buffer, in bytes
    pub buffer_limit: usize,

    /// Plaintext bytes per wire segment
    pub segment_size: usize,

    /// Whether to show verbose output
    pub verbose: bool,
}

impl Default for EnvelopeConfiguration {
    fn default() -> Self {
        Self {
            default_format: "cms".to_string(),
            buffer_limit: constants::DEFAULT_BUFFER_LIMIT,
            segment_size: constants::DEFAULT_SEGMENT_SIZE,
            verbose: false,
        }
    }
}

impl EnvelopeConfiguration {
    /// Parse the configured format name.
    pub fn format(&self) -> EnvelopeResult<EnvelopeFormat> {
        let format = match self.default_format.as_str() {
            "cms" => EnvelopeFormat::Cms,
            "cryptlib" => EnvelopeFormat::Cryptlib,
            "smime" => EnvelopeFormat::Smime,
            "pgp" => EnvelopeFormat::Pgp,
            other => {
                return Err(EnvelopeError::ConfigurationError(format!(
                    "unknown envelope format: {other}"
                )))
            }
        };
        format.validate().map_err(|_| {
            EnvelopeError::ConfigurationError(format!(
                "envelope format {} is not supported",
                self.default_format
            ))
        })
    }

    /// Build engine options from this configuration.
    pub fn options(&self) -> EnvelopeResult<EnvelopeOptions> {
        Ok(EnvelopeOptions {
            format: self.format()?,
            buffer_limit: self.buffer_limit,
            segment_size: self.segment_size,
            ..EnvelopeOptions::default()
        })
    }
}

/// Configuration manager for handling config files
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with default path
    pub fn new() -> EnvelopeResult<Self> {
        let config_path = Self::default_config_path()?;
        Ok(Self { config_path })
    }

    /// Create a configuration manager with custom path
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
        }
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> EnvelopeResult<PathBuf> {
        if let Some(config_dir) = dirs::config_dir() {
            let envelope_dir = config_dir.join("cms-envelope");
            Ok(envelope_dir.join("config.toml"))
        } else {
            // Fallback to current directory
            Ok(PathBuf::from("cms-envelope-config.toml"))
        }
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub fn load_or_create_default(&self) -> EnvelopeResult<EnvelopeConfiguration> {
        if self.config_path.exists() {
            self.load()
        } else {
            log::info!(
                "Configuration file not found, creating default: {}",
                self.config_path.display()
            );
            let default_config = EnvelopeConfiguration::default();
            self.save(&default_config)?;
            Ok(default_config)
        }
    }

    /// Load configuration from file
    pub fn load(&self) -> EnvelopeResult<EnvelopeConfiguration> {
        log::info!("Loading configuration from: {}", self.config_path.display());

        let content = fs::read_to_string(&self.config_path).map_err(|e| {
            EnvelopeError::ConfigurationError(format!(
                "Failed to read config file {}: {}",
                self.config_path.display(),
                e
            ))
        })?;

        let config: EnvelopeConfiguration = toml::from_str(&content).map_err(|e| {
            EnvelopeError::ConfigurationError(format!("Failed to parse config file: {e}"))
        })?;

        self.validate_config(&config)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, config: &EnvelopeConfiguration) -> EnvelopeResult<()> {
        log::info!("Saving configuration to: {}", self.config_path.display());

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EnvelopeError::ConfigurationError(format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let content = toml::to_string_pretty(config).map_err(|e| {
            EnvelopeError::ConfigurationError(format!("Failed to serialize config: {e}"))
        })?;

        fs::write(&self.config_path, content).map_err(|e| {
            EnvelopeError::ConfigurationError(format!(
                "Failed to write config file {}: {}",
                self.config_path.display(),
                e
            ))
        })?;

        log::info!("Configuration saved successfully");
        Ok(())
    }

    /// Validate configuration values
    fn validate_config(&self, config: &EnvelopeConfiguration) -> EnvelopeResult<()> {
        config.format()?;
        config.options()?.validate().map_err(|e| {
            EnvelopeError::ConfigurationError(format!("invalid buffer configuration: {e}"))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_is_valid() {
        let config = EnvelopeConfiguration::default();
        assert_eq!(config.format().unwrap(), EnvelopeFormat::Cms);
        assert!(config.options().is_ok());
    }

    #[test]
    fn pgp_format_rejected_by_configuration() {
        let config = EnvelopeConfiguration {
            default_format: "pgp".to_string(),
            ..EnvelopeConfiguration::default()
        };
        assert!(matches!(
            config.format(),
            Err(EnvelopeError::ConfigurationError(_))
        ));
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = std::env::temp_dir().join("cms-envelope-config-test");
        let path = dir.join("config.toml");
        let manager = ConfigManager::with_path(&path);

        let mut config = EnvelopeConfiguration::default();
        config.segment_size = 1024;
        manager.save(&config).unwrap();
        let loaded = manager.load().unwrap();
        assert_eq!(loaded.segment_size, 1024);
        assert_eq!(loaded.default_format, "cms");

        let _ = fs::remove_dir_all(&dir);
    }
}
