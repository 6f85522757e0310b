use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timeouts::Timeouts;

/// A `(login, password)` pair, compared for equality only. No hashing or
/// timing-safe comparison is attempted (confidentiality is out of scope).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub login: String,
    pub password: String,
}

/// Inclusive bounds for dynamically allocated public ports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self { low: 1024, high: 65535 }
    }
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_bind_port() -> u16 {
    13882
}

/// Server- and client-shared configuration, loaded from a JSON file and
/// overridable from the CLI. Mirrors the shape of the original's
/// `config.json` (`host`, `port`, `allowed_port_range`, `accounts`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "host", default = "default_bind_host")]
    pub bind_host: String,
    #[serde(rename = "port", default = "default_bind_port")]
    pub bind_port: u16,
    #[serde(rename = "allowed_port_range")]
    pub port_range: PortRange,
    pub accounts: Vec<Account>,
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            port_range: PortRange::default(),
            accounts: Vec::new(),
            timeouts: Timeouts::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, #[source] source: serde_json::Error },
}

impl Config {
    /// Loads configuration from a JSON file, falling back to built-in
    /// defaults for any field the file omits.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_ref.display().to_string(),
            source,
        })
    }

    pub fn verify(&self, login: &str, password: &str) -> bool {
        self.accounts.iter().any(|account| account.login == login && account.password == password)
    }
}
