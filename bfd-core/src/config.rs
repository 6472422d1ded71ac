//! Daemon configuration model
//!
//! The daemon is configured from a YAML document with two top-level keys:
//! `listen` (a list of `host[:port]` strings) and `peers` (a mapping keyed
//! by peer IP address). Sessions are rebuilt from this document on every
//! startup; nothing is persisted.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Addresses to listen on, `host[:port]`; the port defaults to 3784
    #[serde(default)]
    pub listen: Vec<String>,

    /// Peers keyed by IP address
    #[serde(default)]
    pub peers: HashMap<String, PeerConfig>,
}

/// Per-peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Display name of the peer
    pub name: String,

    /// Destination port; 0 means the default BFD control port
    #[serde(default)]
    pub port: u16,

    /// Target interval in milliseconds, used for both the desired transmit
    /// and the required receive interval
    pub interval: u32,

    /// Detection multiplier
    #[serde(rename = "detectionMultiplier")]
    pub detection_multiplier: u8,
}

impl Config {
    /// Parse a configuration document from a YAML string
    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yaml::from_str(data)
            .map_err(|e| Error::Config(format!("error parsing data as yaml: {}", e)))
    }

    /// Read and parse a configuration file
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("error reading config file: {}", e)))?;
        Self::from_yaml(&data)
    }
}

impl PeerConfig {
    /// Render the `address[:port]` string for this peer entry
    pub fn address(&self, ip: &str) -> String {
        if self.port == 0 {
            ip.to_string()
        } else {
            format!("{}:{}", ip, self.port)
        }
    }
}
