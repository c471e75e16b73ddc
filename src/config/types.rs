//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            admission: AdmissionConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address the device listens on.
    pub bind_addr: SocketAddr,
    /// Address every admitted connection is relayed to.
    pub target_addr: SocketAddr,
    /// First delay after a failed accept.
    #[serde(with = "humantime_serde", default = "default_accept_backoff_initial")]
    pub accept_backoff_initial: Duration,
    /// Ceiling for the accept-error backoff.
    #[serde(with = "humantime_serde", default = "default_accept_backoff_max")]
    pub accept_backoff_max: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 1080)),
            target_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            accept_backoff_initial: default_accept_backoff_initial(),
            accept_backoff_max: default_accept_backoff_max(),
        }
    }
}

/// Admission policy configuration
///
/// Entries in `allow` and `deny` may be bare IP addresses or CIDR blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    pub enabled: bool,
    pub default_policy: String,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_policy: "allow".to_string(),
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }
}

fn default_accept_backoff_initial() -> Duration {
    Duration::from_millis(10)
}

fn default_accept_backoff_max() -> Duration {
    Duration::from_secs(1)
}
