use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::api::handlers::connection::AppState;
use crate::api::middleware::AppError;
use crate::models::{
    NaturalQueryRequest, NaturalQueryResponse, QueryRequest, QueryResult, SuggestedQueriesParams,
    SuggestedQueriesResponse,
};

/// Execute a read-only SQL query
pub async fn execute_query(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResult>, AppError> {
    tracing::info!("Executing SQL query for connection: {}", name);
    payload.validate()?;

    let result = state.services.run_sql(&name, payload.sql.trim()).await?;
    Ok(Json(result))
}

/// Generate SQL from a natural-language prompt, optionally running it
pub async fn execute_natural_language_query(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<NaturalQueryRequest>,
) -> Result<Json<NaturalQueryResponse>, AppError> {
    tracing::info!("Executing natural language query for connection: {}", name);
    payload.validate()?;

    let response = state
        .services
        .natural_query(&name, payload.prompt.trim(), payload.execute)
        .await?;

    tracing::info!("Generated SQL from natural language: {}", response.generated_sql);
    Ok(Json(response))
}

/// Validated query ideas for the connection's schema
pub async fn suggested_queries(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<SuggestedQueriesParams>,
) -> Result<Json<SuggestedQueriesResponse>, AppError> {
    tracing::info!("Suggesting queries for connection: {}", name);
    let response = state.services.suggested_queries(&name, &params).await?;
    Ok(Json(response))
}
