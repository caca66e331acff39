//! HTTP request handlers

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Form, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use super::auth;
use super::state::ServerState;
use crate::deployment::Deployment;
use crate::utils::{parse_bool_flag, version_info};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "deployd".to_string(),
        version: version.version,
    })
}

#[derive(Debug, Serialize)]
struct JsonError {
    code: u16,
    text: String,
}

fn not_found() -> (StatusCode, Json<JsonError>) {
    (
        StatusCode::NOT_FOUND,
        Json(JsonError {
            code: StatusCode::NOT_FOUND.as_u16(),
            text: "Not Found".to_string(),
        }),
    )
}

/// Return the listing of loaded packages
pub async fn package_index(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let packages: Vec<_> = state.repository.packages().to_vec();
    Json(packages)
}

/// Return package details for a specific package id
pub async fn package_show(
    State(state): State<Arc<ServerState>>,
    Path(package_id): Path<String>,
) -> impl IntoResponse {
    match state.repository.find_package(&package_id) {
        Some(pkg) => Json(pkg).into_response(),
        None => not_found().into_response(),
    }
}

/// List all deployments
pub async fn deployment_index(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let deployments: HashMap<String, Deployment> =
        state.repository.deployments_snapshot().await;
    Json(deployments)
}

/// Return deployment details for a deployment id
pub async fn deployment_show(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> impl IntoResponse {
    match state.repository.find_deployment(&deployment_id) {
        Some(deployment) => {
            let snapshot = deployment.read().await.clone();
            Json(snapshot).into_response()
        }
        None => not_found().into_response(),
    }
}

/// Deploy a full package. Form values become the deployment's variables;
/// `watch` parses as a boolean and defaults to true.
pub async fn package_deploy(
    State(state): State<Arc<ServerState>>,
    Path(package_id): Path<String>,
    headers: HeaderMap,
    Form(mut form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    if let Err(status) = auth::require_admin(&state, &headers) {
        return status.into_response();
    }
    let Some(pkg) = state.repository.find_package(&package_id) else {
        return not_found().into_response();
    };

    let watch = form
        .remove("watch")
        .map(|v| parse_bool_flag(&v, true))
        .unwrap_or(true);

    let deployment = state.repository.submit_deployment(pkg, form, watch);
    Json(deployment).into_response()
}

/// Deploy a single template of a package. `watch` defaults to false here.
pub async fn package_deploy_template(
    State(state): State<Arc<ServerState>>,
    Path((package_id, template_name)): Path<(String, String)>,
    headers: HeaderMap,
    Form(mut form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    if let Err(status) = auth::require_admin(&state, &headers) {
        return status.into_response();
    }
    let Some(pkg) = state.repository.find_package(&package_id) else {
        return not_found().into_response();
    };

    let watch = form
        .remove("watch")
        .map(|v| parse_bool_flag(&v, false))
        .unwrap_or(false);

    let deployment =
        state
            .repository
            .submit_template_deployment(pkg, &template_name, form, watch);
    Json(deployment).into_response()
}

/// Current principal
pub async fn auth_show(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    Json(auth::principal(&state, &headers))
}
