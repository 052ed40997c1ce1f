use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::api::handlers::connection::AppState;
use crate::api::middleware::AppError;
use crate::models::{MetadataParams, SchemaSnapshot};

/// Get database metadata, introspecting when the cache is stale or `refresh=true`
pub async fn get_metadata(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<MetadataParams>,
) -> Result<Json<SchemaSnapshot>, AppError> {
    tracing::info!("Getting metadata for connection: {} (refresh: {})", name, params.refresh);

    let snapshot = state.services.schema(&name, params.refresh).await?;
    tracing::info!(
        "Metadata for {}: {} tables and {} views",
        name,
        snapshot.tables.len(),
        snapshot.views.len()
    );

    Ok(Json(snapshot))
}
