/// Client configuration
///
/// Settings can be built in code or loaded from a JSON document; every field
/// has a default so partial documents are accepted.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{DEFAULT_DEBUG_PORT, DEFAULT_PORT};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or address of the target
    pub host: String,
    /// Port of the debug agent's command server
    pub port: u16,
    /// Local address the interrupt listener binds
    pub debug_bind_address: IpAddr,
    /// Local port the interrupt listener binds; 0 picks an ephemeral port
    pub debug_port: u16,
    /// Delay between interrupt listener polls
    pub poll_interval_ms: u64,
    /// Limit on each individual read from the primary connection, unbounded
    /// when absent
    pub read_timeout_ms: Option<u64>,
    /// Receive timeout applied while querying the extended firmware version
    pub ext_fw_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            debug_bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            debug_port: DEFAULT_DEBUG_PORT,
            poll_interval_ms: 100,
            read_timeout_ms: None,
            ext_fw_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn target_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn listener_address(&self) -> SocketAddr {
        SocketAddr::new(self.debug_bind_address, self.debug_port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn ext_fw_timeout(&self) -> Duration {
        Duration::from_millis(self.ext_fw_timeout_ms)
    }
}
