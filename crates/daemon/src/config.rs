//! Configuration management for the DriveShare daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/driveshare/config.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for `server.max_servers`.
pub const MAX_SERVERS_LIMIT: usize = 64;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_servers must be between 1 and 64, got {0}")]
    InvalidMaxServers(usize),

    #[error("base_port must be at least 1, got {0}")]
    InvalidBasePort(u16),

    #[error("port range {base}..{base}+{count} exceeds 65535")]
    PortRangeOverflow { base: u16, count: usize },

    #[error("backlog must be greater than 0, got {0}")]
    InvalidBacklog(u32),

    #[error("socket_buffer_size must be greater than 0, got {0}")]
    InvalidSocketBufferSize(usize),

    #[error("scratch_prefix must be an absolute path, got {0}")]
    InvalidScratchPrefix(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the DriveShare daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Removable-drive mount configuration.
    pub mount: MountConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address every server instance binds to.
    pub bind_address: IpAddr,

    /// Port of the first server; later servers take the following ports.
    pub base_port: u16,

    /// Maximum number of concurrently running server instances.
    pub max_servers: usize,

    /// Listen backlog for each server socket.
    pub backlog: u32,

    /// Requested send/receive buffer size for each server socket, in bytes.
    pub socket_buffer_size: usize,
}

/// Removable-drive mount configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MountConfig {
    /// Prefix for mount points created by the daemon. Only mount points under
    /// this prefix are ever unmounted.
    pub scratch_prefix: PathBuf,

    /// Userspace NTFS driver binary that must be present for NTFS drives.
    pub ntfs_driver: String,

    /// Attempt to install the NTFS driver when it is missing.
    pub install_ntfs_driver: bool,

    /// Run mount/umount through sudo.
    pub use_sudo: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            base_port: 8000,
            max_servers: 5,
            backlog: 50,
            socket_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            scratch_prefix: PathBuf::from("/tmp/driveshare_"),
            ntfs_driver: "ntfs-3g".to_string(),
            install_ntfs_driver: true,
            use_sudo: true,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("driveshare")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DRIVESHARE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - DRIVESHARE_BASE_PORT: Override the first server port
    /// - DRIVESHARE_MAX_SERVERS: Override the server instance limit
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("DRIVESHARE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Some(port) = env_parsed::<u16>("DRIVESHARE_BASE_PORT") {
            tracing::info!("Overriding base_port from environment: {}", port);
            self.server.base_port = port;
        }

        if let Some(max) = env_parsed::<usize>("DRIVESHARE_MAX_SERVERS") {
            tracing::info!("Overriding max_servers from environment: {}", max);
            self.server.max_servers = max;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;

        if server.max_servers < 1 || server.max_servers > MAX_SERVERS_LIMIT {
            return Err(ConfigError::InvalidMaxServers(server.max_servers));
        }

        if server.base_port == 0 {
            return Err(ConfigError::InvalidBasePort(server.base_port));
        }

        let last_port = server.base_port as usize + server.max_servers - 1;
        if last_port > u16::MAX as usize {
            return Err(ConfigError::PortRangeOverflow {
                base: server.base_port,
                count: server.max_servers,
            });
        }

        if server.backlog == 0 {
            return Err(ConfigError::InvalidBacklog(server.backlog));
        }

        if server.socket_buffer_size == 0 {
            return Err(ConfigError::InvalidSocketBufferSize(server.socket_buffer_size));
        }

        if !self.mount.scratch_prefix.is_absolute() {
            return Err(ConfigError::InvalidScratchPrefix(
                self.mount.scratch_prefix.display().to_string(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Read a non-empty, parsable environment variable.
fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    if raw.is_empty() {
        return None;
    }
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("DRIVESHARE_LOG_LEVEL");
        std::env::remove_var("DRIVESHARE_BASE_PORT");
        std::env::remove_var("DRIVESHARE_MAX_SERVERS");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.server.base_port, 8000);
        assert_eq!(config.server.max_servers, 5);
        assert_eq!(config.server.backlog, 50);
        assert_eq!(config.server.socket_buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.mount.scratch_prefix, PathBuf::from("/tmp/driveshare_"));
        assert_eq!(config.mount.ntfs_driver, "ntfs-3g");
        assert!(config.mount.use_sudo);
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[server]
max_servers = 2
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.server.max_servers, 2);
        // Other values should be defaults
        assert_eq!(config.server.base_port, 8000);
        assert_eq!(config.mount, MountConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"

[server]
bind_address = "127.0.0.1"
base_port = 9000
max_servers = 3
backlog = 16
socket_buffer_size = 1048576

[mount]
scratch_prefix = "/run/driveshare/mnt_"
ntfs_driver = "ntfs3"
install_ntfs_driver = false
use_sudo = false
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.server.bind_address, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.server.base_port, 9000);
        assert_eq!(config.server.max_servers, 3);
        assert_eq!(config.server.backlog, 16);
        assert_eq!(config.server.socket_buffer_size, 1048576);
        assert_eq!(
            config.mount.scratch_prefix,
            PathBuf::from("/run/driveshare/mnt_")
        );
        assert_eq!(config.mount.ntfs_driver, "ntfs3");
        assert!(!config.mount.install_ntfs_driver);
        assert!(!config.mount.use_sudo);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[server
base_port = 1
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[server]
base_port = "eight thousand"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.server.base_port = 8100;
        original.mount.use_sudo = false;

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.server.max_servers = 4;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("driveshare"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_ports() {
        clear_env();
        std::env::set_var("DRIVESHARE_BASE_PORT", "9100");
        std::env::set_var("DRIVESHARE_MAX_SERVERS", "2");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.base_port, 9100);
        assert_eq!(config.server.max_servers, 2);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unparsable_is_ignored() {
        clear_env();
        std::env::set_var("DRIVESHARE_BASE_PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.base_port, 8000);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        clear_env();
        std::env::set_var("DRIVESHARE_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        std::env::set_var("DRIVESHARE_LOG_LEVEL", "");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "info");

        clear_env();
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_max_servers() {
        let mut config = Config::default();
        config.server.max_servers = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxServers(0)));

        config.server.max_servers = MAX_SERVERS_LIMIT + 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxServers(MAX_SERVERS_LIMIT + 1))
        );

        config.server.max_servers = MAX_SERVERS_LIMIT;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_ports() {
        let mut config = Config::default();
        config.server.base_port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBasePort(0)));

        config.server.base_port = 65535;
        config.server.max_servers = 2;
        assert_eq!(
            config.validate(),
            Err(ConfigError::PortRangeOverflow {
                base: 65535,
                count: 2
            })
        );

        config.server.max_servers = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_backlog_and_buffers() {
        let mut config = Config::default();
        config.server.backlog = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBacklog(0)));

        let mut config = Config::default();
        config.server.socket_buffer_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidSocketBufferSize(0)));
    }

    #[test]
    fn test_validate_scratch_prefix() {
        let mut config = Config::default();
        config.mount.scratch_prefix = PathBuf::from("relative/prefix_");
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidScratchPrefix("relative/prefix_".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();

        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
