//! Error types for the deployd agent

use thiserror::Error;

use crate::kv::KvError;

/// Main error type for the deployd agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store error: {0}")]
    Store(#[from] KvError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("package error: {0}")]
    Package(String),

    #[error("deployment error: {0}")]
    Deploy(String),

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("another machine already holds id {0}")]
    PeerIdConflict(String),

    #[error("no such package: {0}")]
    PackageNotFound(String),

    #[error("no such deployment: {0}")]
    DeploymentNotFound(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("shutdown error: {0}")]
    Shutdown(String),
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Server(err.to_string())
    }
}
