use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::AuthType;
use crate::error::ServerError;

/// Environment variable naming a YAML config file.
pub const CONFIG_ENV: &str = "RPCMUX_CONFIG";
/// Environment variable overriding the listen address as `host:port`.
pub const LISTEN_ENV: &str = "LISTEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    pub backlog: u32,
    pub max_connections: usize,
    pub formats: FormatConfig,
    pub auth_type: AuthType,
    pub websocket_auth_type: AuthType,
    /// GET/HEAD requests are answered with a 301 to this URL.
    pub redirect_to: Option<String>,
    /// Peer addresses that speak the legacy binary RPC dialect.
    pub legacy_clients: Vec<String>,
    pub timeouts: TimeoutConfig,
}

/// Certificate material, each item either a path or inline PEM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_file: Option<PathBuf>,
    pub cert_data: Option<String>,
    pub key_file: Option<PathBuf>,
    pub key_data: Option<String>,
    pub dh_param_file: Option<PathBuf>,
    pub dh_param_data: Option<String>,
}

/// Which wire formats the listener accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    pub binary_rpc: bool,
    pub xml_rpc: bool,
    pub json_rpc: bool,
    pub websocket: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub read_ms: u64,
    pub write_ms: u64,
    pub handshake_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 2001,
            tls: None,
            backlog: 100,
            max_connections: 200,
            formats: FormatConfig::default(),
            auth_type: AuthType::None,
            websocket_auth_type: AuthType::None,
            redirect_to: None,
            legacy_clients: Vec::new(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            binary_rpc: true,
            xml_rpc: true,
            json_rpc: true,
            websocket: true,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_ms: 100,
            write_ms: 15_000,
            handshake_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }
}

impl ServerConfig {
    /// Defaults, or the YAML file named by `RPCMUX_CONFIG`, then the
    /// `LISTEN` override.
    pub fn load() -> Result<Self, ServerError> {
        let mut cfg = match std::env::var(CONFIG_ENV) {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| ServerError::Config(format!("cannot read {}: {}", path, e)))?;
                Self::from_yaml(&text)?
            }
            Err(_) => Self::default(),
        };

        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            cfg.apply_listen(&listen)?;
        }

        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ServerError> {
        serde_yaml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Split a `host:port` string into address and port.
    pub fn apply_listen(&mut self, listen: &str) -> Result<(), ServerError> {
        let (host, port) = listen
            .rsplit_once(':')
            .ok_or_else(|| ServerError::Config(format!("{} must be host:port, got {:?}", LISTEN_ENV, listen)))?;
        self.port = port
            .parse()
            .map_err(|_| ServerError::Config(format!("invalid port in {:?}", listen)))?;
        self.listen_address = host.trim_matches(|c| c == '[' || c == ']').to_string();
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be at least 1".into()));
        }
        if let Some(target) = &self.redirect_to {
            url::Url::parse(target)
                .map_err(|e| ServerError::Config(format!("invalid redirect_to {:?}: {}", target, e)))?;
        }
        if let Some(tls) = &self.tls {
            if tls.cert_file.is_none() && tls.cert_data.is_none() {
                return Err(ServerError::Config("tls needs cert_file or cert_data".into()));
            }
            if tls.key_file.is_none() && tls.key_data.is_none() {
                return Err(ServerError::Config("tls needs key_file or key_data".into()));
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        if self.listen_address.contains(':') {
            format!("[{}]:{}", self.listen_address, self.port)
        } else {
            format!("{}:{}", self.listen_address, self.port)
        }
    }

    pub fn is_legacy_client(&self, address: &str) -> bool {
        self.legacy_clients.iter().any(|a| a == address)
    }
}
