use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::app::AppServices;
use crate::models::{Connection, CreateConnectionRequest, UpdateConnectionRequest};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<AppServices>,
}

/// List all active connections
pub async fn list_connections(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let connections = state.services.registry.list().await?;

    Ok(Json(serde_json::json!({
        "connections": connections
    })))
}

/// Create a new database connection
pub async fn create_connection(
    State(state): State<AppState>,
    Json(payload): Json<CreateConnectionRequest>,
) -> Result<(StatusCode, Json<Connection>), AppError> {
    tracing::info!("Creating connection: {}", payload.name);
    let connection = state.services.registry.create(payload).await?;

    Ok((StatusCode::CREATED, Json(connection)))
}

/// Get connection details
pub async fn get_connection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Connection>, AppError> {
    let connection = state.services.registry.get(&name).await?;
    Ok(Json(connection))
}

/// Patch name, URL or the active flag
pub async fn update_connection(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut payload): Json<UpdateConnectionRequest>,
) -> Result<Json<Connection>, AppError> {
    tracing::info!("Updating connection: {}", name);
    let active = payload.active.take();

    let registry = &state.services.registry;
    let mut connection = registry.update(&name, payload).await?;
    if let Some(active) = active {
        connection = registry.set_active(&connection.name, active).await?;
    }

    Ok(Json(connection))
}

/// Delete a connection and its history
pub async fn delete_connection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    tracing::info!("Deleting connection: {}", name);
    state.services.registry.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
