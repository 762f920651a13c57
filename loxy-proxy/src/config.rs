use std::path::{Path, PathBuf};
use std::time::Duration;

use loxy_net::Limits;
use loxy_transport::ClientConfig;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    pub mitm: MitmConfig,
    pub tunnel: TunnelConfig,
    pub timeouts: TimeoutConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MitmConfig {
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelConfig {
    /// Port used when a CONNECT target carries none.
    pub default_port: u16,
}

/// Deadlines in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_secs: u64,
    pub handshake_secs: u64,
    pub idle_secs: u64,
    /// Time allowed for an origin to answer with a response head.
    pub request_secs: u64,
    /// Longest silence tolerated while a response body is streaming.
    pub body_idle_secs: u64,
    pub tunnel_linger_secs: u64,
    pub pool_idle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    pub max_idle_per_host: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for MitmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert_path: None,
            key_path: None,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self { default_port: 443 }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            handshake_secs: 10,
            idle_secs: 60,
            request_secs: 60,
            body_idle_secs: 60,
            tunnel_linger_secs: 5,
            pool_idle_secs: 90,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            max_header_bytes: limits.max_header_bytes,
            max_body_bytes: limits.max_body_bytes,
            max_idle_per_host: 8,
        }
    }
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| ProxyError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ProxyError> {
        toml::from_str(text).map_err(|err| ProxyError::Config(err.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, ProxyError> {
        toml::to_string_pretty(self).map_err(|err| ProxyError::Config(err.to_string()))
    }

    pub fn listen_addr(&self) -> String {
        if self.listen.host.contains(':') {
            format!("[{}]:{}", self.listen.host, self.listen.port)
        } else {
            format!("{}:{}", self.listen.host, self.listen.port)
        }
    }

    pub fn http_limits(&self) -> Limits {
        Limits {
            max_header_bytes: self.limits.max_header_bytes,
            max_body_bytes: self.limits.max_body_bytes,
        }
    }

    /// Settings for the shared upstream transport.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: self.timeouts.connect(),
            handshake_timeout: self.timeouts.handshake(),
            request_timeout: self.timeouts.request(),
            body_idle_timeout: self.timeouts.body_idle(),
            pool_idle_timeout: Duration::from_secs(self.timeouts.pool_idle_secs),
            max_idle_per_host: self.limits.max_idle_per_host,
            verify_upstream_tls: true,
            limits: self.http_limits(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn body_idle(&self) -> Duration {
        Duration::from_secs(self.body_idle_secs)
    }

    pub fn tunnel_linger(&self) -> Duration {
        Duration::from_secs(self.tunnel_linger_secs)
    }
}
