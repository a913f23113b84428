//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Top-level gateway configuration, shared by the server and client binaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Server (gateway) settings.
    pub server: ServerConfig,
    /// Client settings.
    pub client: ClientConfig,
    /// Ticket issue/validation settings.
    pub ticket: TicketConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// What the gateway does when a ticket validates but its owner differs from
/// the identity that presented it (e.g. a lent license).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OwnerMismatchPolicy {
    /// Admit the connection and append a caveat to the success notice.
    #[default]
    AcceptFlagged,
    /// Treat the mismatch as a validation failure.
    Reject,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listen socket binds to.
    pub bind_address: String,
    /// Listen port.
    pub port: u16,
    /// Maximum concurrent connections, counting ones still being accepted.
    pub max_connections: usize,
    /// Upper bound on messages drained from the transport per poll cycle.
    pub max_messages_per_poll: usize,
    /// Poll loop period in milliseconds.
    pub poll_interval_ms: u64,
    /// Callback pump period in milliseconds.
    pub callback_interval_ms: u64,
    /// Seconds a connection may stay unauthenticated before it is closed.
    pub handshake_timeout_secs: u64,
    /// Policy for validated tickets whose owner differs from the presenter.
    pub owner_mismatch: OwnerMismatchPolicy,
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address to connect to.
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
    /// Account identity the client presents.
    pub identity: u64,
    /// License owner embedded in issued tickets. Defaults to `identity`.
    pub owner: Option<u64>,
    /// Client poll loop period in milliseconds.
    pub poll_interval_ms: u64,
}

/// Ticket issue/validation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TicketConfig {
    /// Shared key used to sign and verify tickets.
    pub issuer_key: String,
    /// How long an issued ticket stays acceptable, in seconds.
    pub lifetime_secs: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Directory for the JSON log file, if any.
    pub log_dir: Option<PathBuf>,
    /// Write a JSON log file into `log_dir`.
    pub json_log: bool,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 1234,
            max_connections: 100,
            max_messages_per_poll: 32,
            poll_interval_ms: 10,
            callback_interval_ms: 50,
            handshake_timeout_secs: 30,
            owner_mismatch: OwnerMismatchPolicy::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 1234,
            identity: 76_561_197_960_265_729,
            owner: None,
            poll_interval_ms: 10,
        }
    }
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            issuer_key: "turnstile-dev-key".to_string(),
            lifetime_secs: 300,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            json_log: false,
        }
    }
}

/// Platform config directory for Turnstile (`<config_dir>/turnstile`).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("turnstile"))
        .ok_or(ConfigError::NoConfigDir)
}

// --- Load / Save ---

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    /// Load `config.ron` from `config_dir`, writing the defaults there first
    /// when the file does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Wrote default gateway config to {}", path.display());
            return Ok(config);
        }

        let config = read_config(&path)?;
        log::info!("Loaded gateway config from {}", path.display());
        Ok(config)
    }

    /// Write this config to `config_dir/config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        let write_err = |source| ConfigError::Write {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(config_dir).map_err(write_err)?;
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .struct_names(false);
        let serialized = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;
        std::fs::write(&path, serialized).map_err(write_err)
    }
}

impl ClientConfig {
    /// Owner to embed in issued tickets.
    pub fn effective_owner(&self) -> u64 {
        self.owner.unwrap_or(self.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("port: 1234"));
        assert!(ron_str.contains("max_connections: 100"));
        assert!(ron_str.contains("AcceptFlagged"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.server.owner_mismatch = OwnerMismatchPolicy::Reject;
        config.client.owner = Some(42);
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(server: (port: 4000))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.max_connections, 100);
        assert_eq!(config.ticket, TicketConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.port = 4321;
        config.client.server_address = "10.0.0.1".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_invalid_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.ron"), "{{not valid}}").unwrap();

        match Config::load_or_create(dir.path()) {
            Err(ConfigError::Parse { path, .. }) => {
                assert_eq!(path, dir.path().join("config.ron"));
            }
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_effective_owner_falls_back_to_identity() {
        let mut client = ClientConfig::default();
        assert_eq!(client.effective_owner(), client.identity);
        client.owner = Some(7);
        assert_eq!(client.effective_owner(), 7);
    }
}
