use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::api::handlers::connection::AppState;
use crate::api::middleware::AppError;
use crate::models::{
    DeleteHistoryRequest, DeleteHistoryResponse, HistoryPage, HistoryParams, HistorySummary,
};

/// Paged query history, newest first
pub async fn list_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryPage>, AppError> {
    let page = state.services.history(&name, &params).await?;
    Ok(Json(page))
}

pub async fn history_summary(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<HistorySummary>, AppError> {
    let summary = state.services.history_summary(&name).await?;
    Ok(Json(summary))
}

/// Delete a batch of entries (`{"ids": [...]}`), or all of them when the body
/// is empty or carries no ids
pub async fn delete_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<DeleteHistoryResponse>, AppError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        DeleteHistoryRequest::default()
    } else {
        serde_json::from_slice::<DeleteHistoryRequest>(&body)
            .map_err(|e| AppError::Validation(format!("Invalid request body: {}", e)))?
    };

    let deleted = state.services.delete_history(&name, &request).await?;
    tracing::info!("Deleted {} history entries for connection: {}", deleted, name);
    Ok(Json(DeleteHistoryResponse { deleted }))
}

pub async fn delete_history_item(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, i64)>,
) -> Result<StatusCode, AppError> {
    state.services.delete_history_item(&name, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
