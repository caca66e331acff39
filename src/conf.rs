//! Server configuration
//!
//! Loaded either from `<configDir>/deployd.json` or from a configuration
//! backend named as `<type>,<host>,<path>` (`etcd` speaks the v2 REST API;
//! `default`/`fs`/`json` read local files). The cluster blob loads from
//! `cluster.json` or the backend's `<path>/cluster` key.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::errors::AgentError;
use crate::journal::JournalConfig;

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    8480
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfiguration {
    #[serde(default = "default_bind_addr", rename = "bind-addr")]
    pub addr: String,

    #[serde(default = "default_bind_port", rename = "bind-port")]
    pub port: u16,

    #[serde(default, rename = "allowed-tags")]
    pub allowed_tags: Vec<String>,

    #[serde(default, rename = "allow-untagged")]
    pub allow_untagged: bool,

    #[serde(default)]
    pub journal: Option<JournalConfig>,

    /// Bearer token required for mutating requests when set
    #[serde(default, rename = "auth-token")]
    pub auth_token: Option<String>,

    /// Upper bound on any single shell fragment, humantime syntax.
    /// Unset means unbounded.
    #[serde(default, rename = "command-timeout")]
    pub command_timeout: Option<String>,
}

impl ServerConfiguration {
    /// Read `deployd.json` from the configuration directory.
    pub fn load(config_dir: &Path) -> Result<Self, AgentError> {
        let file = config_dir.join("deployd.json");
        let data = std::fs::read_to_string(&file).map_err(|e| {
            error!("Failed to read file {}: {}", file.display(), e);
            AgentError::Config(format!("could not read {}: {}", file.display(), e))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            error!("Failed to parse json file {}: {}", file.display(), e);
            AgentError::Config(format!("could not parse {}: {}", file.display(), e))
        })
    }

    /// Read configuration through a backend described as `<type>,<host>,<path>`.
    pub async fn load_from(location: &str) -> Result<(Self, ConfigBackend), AgentError> {
        let backend = ConfigBackend::parse(location)?;
        let data = backend.get_string("config").await?;
        let config = serde_json::from_str(&data)
            .map_err(|e| AgentError::Config(format!("could not parse configuration: {}", e)))?;
        Ok((config, backend))
    }

    pub fn parsed_command_timeout(&self) -> Option<Duration> {
        let raw = self.command_timeout.as_deref()?;
        match humantime::parse_duration(raw) {
            Ok(timeout) => Some(timeout),
            Err(e) => {
                warn!("Invalid command-timeout {:?}: {}", raw, e);
                None
            }
        }
    }
}

/// Where configuration documents come from.
#[derive(Debug, Clone)]
pub enum ConfigBackend {
    /// Local directory holding `deployd.json` and `cluster.json`
    File { path: PathBuf },

    /// etcd v2 key space rooted at `path`
    Etcd { host: String, path: String },
}

impl ConfigBackend {
    pub fn parse(location: &str) -> Result<Self, AgentError> {
        let parts: Vec<&str> = location.split(',').collect();
        let (backend_type, host, path) = match parts.as_slice() {
            [t, h, p] => (*t, (*h).to_string(), (*p).to_string()),
            [t, h] => (*t, (*h).to_string(), "/deployd/config".to_string()),
            _ => {
                return Err(AgentError::Config(format!(
                    "invalid configuration location: {}",
                    location
                )))
            }
        };

        match backend_type {
            "etcd" => Ok(ConfigBackend::Etcd { host, path }),
            "default" | "fs" | "json" => Ok(ConfigBackend::File {
                path: PathBuf::from(host),
            }),
            other => {
                error!("{} is an unknown configuration provider", other);
                Err(AgentError::Config(format!(
                    "unknown configuration provider: {}",
                    other
                )))
            }
        }
    }

    /// Fetch a named document (`config`, `cluster`) as a string.
    pub async fn get_string(&self, name: &str) -> Result<String, AgentError> {
        match self {
            ConfigBackend::File { path } => {
                let file = match name {
                    "config" => path.join("deployd.json"),
                    "cluster" => path.join("cluster.json"),
                    other => path.join(other),
                };
                Ok(std::fs::read_to_string(&file)?)
            }
            ConfigBackend::Etcd { host, path } => {
                let endpoint = if host.starts_with("http://") || host.starts_with("https://") {
                    host.clone()
                } else {
                    format!("http://{}", host)
                };
                let url = format!(
                    "{}/v2/keys{}/{}",
                    endpoint.trim_end_matches('/'),
                    path.trim_end_matches('/'),
                    name
                );
                let response = reqwest::Client::new()
                    .get(&url)
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await?
                    .error_for_status()?;
                let body: serde_json::Value = response.json().await?;
                body.pointer("/node/value")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| {
                        AgentError::Config(format!("no value at configuration key {}", url))
                    })
            }
        }
    }

    /// Fetch the cluster configuration blob.
    pub async fn cluster_config(&self) -> Option<serde_json::Value> {
        info!("Loading cluster configuration from backend");
        match self.get_string("cluster").await {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(value) => Some(value),
                Err(e) => {
                    error!("Failed to parse cluster configuration: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Could not load cluster configuration: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend_locations() {
        assert!(matches!(
            ConfigBackend::parse("etcd,127.0.0.1:2379,/deployd").unwrap(),
            ConfigBackend::Etcd { .. }
        ));
        assert!(matches!(
            ConfigBackend::parse("fs,/etc/deployd").unwrap(),
            ConfigBackend::File { .. }
        ));
        assert!(ConfigBackend::parse("carrier-pigeon,roof").is_err());
        assert!(ConfigBackend::parse("etcd").is_err());
    }

    #[test]
    fn test_configuration_defaults() {
        let config: ServerConfiguration = serde_json::from_str("{}").unwrap();
        assert_eq!(config.addr, "0.0.0.0");
        assert_eq!(config.port, 8480);
        assert!(config.journal.is_none());
        assert!(config.auth_token.is_none());
        assert!(config.parsed_command_timeout().is_none());
    }

    #[test]
    fn test_command_timeout_parses_humantime() {
        let config: ServerConfiguration =
            serde_json::from_str(r#"{"command-timeout": "90s"}"#).unwrap();
        assert_eq!(
            config.parsed_command_timeout(),
            Some(Duration::from_secs(90))
        );
    }
}
