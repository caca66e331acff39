//! Shared HTTP server state

use std::sync::Arc;

use crate::deployment::Repository;

/// State injected into every handler.
pub struct ServerState {
    pub repository: Arc<Repository>,
    pub auth_token: Option<String>,
}

impl ServerState {
    pub fn new(repository: Arc<Repository>, auth_token: Option<String>) -> Self {
        Self {
            repository,
            auth_token,
        }
    }
}
