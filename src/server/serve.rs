//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers::{
    auth_show, deployment_index, deployment_show, health_handler, package_deploy,
    package_deploy_template, package_index, package_show,
};
use super::state::ServerState;
use crate::errors::AgentError;

/// Start the HTTP server
pub async fn serve(
    addr: &str,
    port: u16,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), AgentError>>, AgentError> {
    let app = Router::new()
        // Health
        .route("/", get(health_handler))
        // Packages
        .route("/packages", get(package_index))
        .route("/packages/:packageId", get(package_show))
        .route("/packages/:packageId/deploy", post(package_deploy))
        .route(
            "/packages/:packageId/deploy/:templateName",
            post(package_deploy_template),
        )
        // Deployments
        .route("/deployments", get(deployment_index))
        .route("/deployments/:deploymentId", get(deployment_show))
        // Auth
        .route("/auth", get(auth_show))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let bind = format!("{}:{}", addr, port);
    info!("Starting HTTP server on {}", bind);

    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|e| AgentError::Server(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| AgentError::Server(e.to_string()))
    });

    Ok(handle)
}
