//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the persisted configuration inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.ron";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Which receiver to talk to and how to introduce ourselves.
    pub device: DeviceConfig,
    /// Socket and buffering settings.
    pub connection: ConnectionConfig,
    /// Reconnection backoff.
    pub reconnect: ReconnectSettings,
    /// Latency probe.
    pub probe: ProbeSettings,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Receiver address and client identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Receiver host name or IP address.
    pub host: String,
    /// Receiver control port.
    pub port: u16,
    /// Client name announced in the handshake.
    pub client_name: String,
    /// Client token announced in the handshake.
    pub uuid: String,
}

/// Connection tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Pause between startup requests in milliseconds.
    pub startup_delay_ms: u64,
    /// Bytes requested per socket read.
    pub read_chunk_size: usize,
    /// Undecodable bytes tolerated in the receive buffer before it is discarded.
    pub max_pending_bytes: usize,
}

/// Reconnection backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Attempts before the session gives up.
    pub max_attempts: u32,
    /// Attempt `n` waits `n × base_delay_ms`.
    pub base_delay_ms: u64,
    /// Upper bound on a single wait.
    pub max_delay_ms: u64,
}

/// Latency probe settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeSettings {
    /// Send probes while connected.
    pub enabled: bool,
    /// Time between probes in milliseconds.
    pub interval_ms: u64,
    /// Time to wait for a response in milliseconds.
    pub timeout_ms: u64,
    /// Request code sent as the probe.
    pub request_code: String,
    /// Consecutive timeouts that force a reconnect (0 disables).
    pub max_missed: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 20000,
            client_name: "PythonQtClient".to_string(),
            uuid: "da9c9e4b-64b7-4bf2-8a26-5550d58c42d1-02:00:00:00:00:00".to_string(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            startup_delay_ms: 100,
            read_chunk_size: 64 * 1024,
            max_pending_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
            timeout_ms: 1_000,
            request_code: "22".to_string(),
            max_missed: 3,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Platform config directory for satlink, e.g. `~/.config/satlink` on Linux.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("satlink")
}

// --- Load / Save / Reload ---

impl Config {
    /// Reject values no receiver session can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });

        if self.device.host.trim().is_empty() {
            return invalid("device.host", "must not be empty");
        }
        if self.device.port == 0 {
            return invalid("device.port", "must be non-zero");
        }
        if self.connection.read_chunk_size == 0 {
            return invalid("connection.read_chunk_size", "must be non-zero");
        }
        if self.probe.enabled && self.probe.interval_ms == 0 {
            return invalid("probe.interval_ms", "must be non-zero while the probe is enabled");
        }
        if self.probe.enabled && self.probe.request_code.trim().is_empty() {
            return invalid("probe.request_code", "must not be empty while the probe is enabled");
        }
        Ok(())
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Parse and validate one config file.
    fn read(config_path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        let config: Config = ron::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Write {
            path: config_path,
            source,
        })
    }

    /// Re-read the file: `Some(new_config)` if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE_NAME))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_receiver_protocol() {
        let config = Config::default();
        assert_eq!(config.device.port, 20000);
        assert_eq!(config.device.client_name, "PythonQtClient");
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.base_delay_ms, 5_000);
        assert_eq!(config.probe.request_code, "22");
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(2))
                .unwrap();
        assert!(ron_str.contains("port: 20000"));
        assert!(ron_str.contains("max_attempts: 5"));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(device: (host: \"10.0.0.7\"), debug: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.device.host, "10.0.0.7");
        assert_eq!(config.device.port, 20000);
        assert_eq!(config.probe, ProbeSettings::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_first_load_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.device.host = "10.0.0.1".to_string();
        config.probe.enabled = false;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut modified = config.clone();
        modified.reconnect.max_attempts = 9;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap();
        assert_eq!(reloaded.map(|c| c.reconnect.max_attempts), Some(9));
    }

    #[test]
    fn test_invalid_ron_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{{not valid}}").unwrap();
        let result = Config::load_or_create(dir.path());
        match result {
            Err(ConfigError::Parse { path, .. }) => assert!(path.ends_with(CONFIG_FILE_NAME)),
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_unusable_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "(device: (port: 0))").unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "device.port", .. }));
        assert_eq!(err.to_string(), "invalid setting `device.port`: must be non-zero");

        let mut config = Config::default();
        config.probe.interval_ms = 0;
        assert!(config.validate().is_err());
        config.probe.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reload_of_missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::default().reload(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_default_dir_is_named_after_app() {
        assert!(default_config_dir().ends_with("satlink"));
    }
}
