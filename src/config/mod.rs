//! Configuration module
//!
//! Handles loading and saving Pinwire configuration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{ClientConfig, ServerConfig};
use crate::protocol::{Protos, DEFAULT_PORT, PROTOCOL_VERSION};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid protos file {path}: {source}")]
    Protos {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Server role settings
    #[serde(default)]
    pub server: ServerSection,

    /// Client role settings
    #[serde(default)]
    pub client: ClientSection,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Client identifier sent in the handshake (auto-generated if not set)
    pub client_id: Option<String>,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log file path (optional)
    pub log_file: Option<PathBuf>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Heartbeat interval advertised to clients; 0 disables heartbeats
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Clients with any other version are rejected
    pub required_version: Option<String>,
    /// JSON file with `client` and `server` proto descriptor sets
    pub protos_file: Option<PathBuf>,
    /// Route compression dictionary
    #[serde(default)]
    pub dict: HashMap<String, u16>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_heartbeat_secs() -> u64 {
    10
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            heartbeat_secs: default_heartbeat_secs(),
            required_version: None,
            protos_file: None,
            dict: HashMap::new(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Server to connect to (host or host:port)
    pub server: Option<String>,
    /// `sys.type` sent in the handshake
    #[serde(default = "default_client_type")]
    pub client_type: String,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Handshake timeout in ms
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Request timeout in ms
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Close the connection when the server goes quiet
    #[serde(default)]
    pub close_on_heartbeat_timeout: bool,
}

fn default_client_type() -> String {
    "pinwire-client".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_request_timeout() -> u64 {
    30_000
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server: None,
            client_type: default_client_type(),
            connect_timeout_ms: default_connect_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            request_timeout_ms: default_request_timeout(),
            close_on_heartbeat_timeout: false,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("pinwire/config.toml")),
            Some(PathBuf::from("./pinwire.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the client ID, generating one if not set
    pub fn client_id(&self) -> String {
        self.general
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Runtime settings for the server role
    pub fn server_config(&self) -> ConfigResult<ServerConfig> {
        let protos = match &self.server.protos_file {
            Some(path) => load_protos(path)?,
            None => Protos::default(),
        };

        Ok(ServerConfig {
            bind_address: self
                .server
                .bind_address
                .clone()
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.server.port,
            heartbeat_secs: self.server.heartbeat_secs,
            dict: self.server.dict.clone(),
            protos,
            required_version: self.server.required_version.clone(),
        })
    }

    /// Runtime settings for the client role
    pub fn client_config(&self) -> ClientConfig {
        let mut user = Map::new();
        user.insert("clientId".to_string(), Value::String(self.client_id()));

        ClientConfig {
            connect_timeout: Duration::from_millis(self.client.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.client.handshake_timeout_ms),
            request_timeout: Duration::from_millis(self.client.request_timeout_ms),
            client_type: self.client.client_type.clone(),
            version: PROTOCOL_VERSION.to_string(),
            user,
            close_on_heartbeat_timeout: self.client.close_on_heartbeat_timeout,
        }
    }
}

fn load_protos(path: &Path) -> ConfigResult<Protos> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Protos {
        path: path.to_path_buf(),
        source,
    })
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            client_id: Some("my-test-client".to_string()),
            ..Default::default()
        },
        server: ServerSection {
            dict: {
                let mut m = HashMap::new();
                m.insert("connector.entryHandler.hello".to_string(), 1);
                m.insert("onChat".to_string(), 2);
                m
            },
            ..Default::default()
        },
        client: ClientSection {
            server: Some(format!("127.0.0.1:{}", DEFAULT_PORT)),
            ..Default::default()
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}
