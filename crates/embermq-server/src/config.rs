//! Broker configuration.
//!
//! Loaded from a TOML file with environment overrides:
//! - `EMBERMQ__` prefix with double underscores for nesting, e.g.
//!   `EMBERMQ__SERVER__BIND=0.0.0.0:1884`
//! - In-file substitution: `${VAR}` or `${VAR:-default}`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

/// Initial size of a connection's read and write buffers. Must be a
/// power of two.
pub const DEFAULT_CLIENT_INITIAL_BUFFER_SIZE: usize = 1024;

/// Cap on per-connection buffer growth and on accepted packet size.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Cap on QoS>0 messages queued for an offline session.
pub const DEFAULT_MAX_QOS_PACKETS: usize = 512;

/// Default session expiry for clients that don't request one (1 day).
pub const DEFAULT_SESSION_EXPIRY_INTERVAL: u32 = 86_400;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address.
    pub bind: SocketAddr,
    /// Worker thread count; 0 means one per CPU.
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1883".parse().expect("static address"),
            workers: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Initial per-connection buffer size (power of two).
    pub client_initial_buffer_size: usize,
    /// Maximum MQTT packet size; also caps buffer growth.
    pub max_packet_size: usize,
    /// Maximum QoS 1/2 messages queued per offline session.
    pub max_qos_packets: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            client_initial_buffer_size: DEFAULT_CLIENT_INITIAL_BUFFER_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_qos_packets: DEFAULT_MAX_QOS_PACKETS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Expiry in seconds for sessions whose client did not request one.
    pub session_expiry_interval: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_expiry_interval: DEFAULT_SESSION_EXPIRY_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    /// Directory holding the retained-message and session state files.
    pub dir: PathBuf,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub persistence: PersistenceConfig,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Config(config::ConfigError),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    /// Expand `${NAME}` and `${NAME:-fallback}` placeholders against
    /// the process environment. Names are restricted to the usual
    /// environment-variable characters; an unset variable without a
    /// fallback expands to the empty string.
    fn expand_env_placeholders(content: &str) -> String {
        let placeholder =
            Regex::new(r"\$\{(?P<name>[A-Za-z_][A-Za-z0-9_]*)(?::-(?P<fallback>[^}]*))?\}")
                .expect("placeholder pattern is valid");
        placeholder
            .replace_all(content, |caps: &regex::Captures<'_>| {
                match std::env::var(&caps["name"]) {
                    Ok(value) => value,
                    Err(_) => caps
                        .name("fallback")
                        .map_or_else(String::new, |m| m.as_str().to_string()),
                }
            })
            .into_owned()
    }

    /// Load from a TOML file (missing file = defaults) plus
    /// `EMBERMQ__`-prefixed environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let substituted = Self::expand_env_placeholders(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("EMBERMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string (for tests).
    #[allow(dead_code)]
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = Self::expand_env_placeholders(content);
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.limits.client_initial_buffer_size.is_power_of_two() {
            return Err(ConfigError::Validation(format!(
                "client_initial_buffer_size must be a power of two, got {}",
                self.limits.client_initial_buffer_size
            )));
        }
        if self.limits.client_initial_buffer_size > self.limits.max_packet_size {
            return Err(ConfigError::Validation(
                "client_initial_buffer_size exceeds max_packet_size".to_string(),
            ));
        }
        if self.limits.max_packet_size > embermq_core::codec::ABSOLUTE_MAX_PACKET_SIZE {
            return Err(ConfigError::Validation(format!(
                "max_packet_size exceeds the protocol maximum of {}",
                embermq_core::codec::ABSOLUTE_MAX_PACKET_SIZE
            )));
        }
        if self.persistence.enabled && self.persistence.dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "persistence.dir is required when persistence is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
