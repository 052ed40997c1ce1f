use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::middleware::AppError;
use crate::models::{
    Connection, HistoryPage, HistorySummary, NewExecution, QueryKind, QueryResult,
    QueryStatus, ResultColumn, MAX_PAGE_SIZE,
};
use crate::services::database::{Engine, RowSet};
use crate::storage::SqliteStorage;
use crate::validation::{SqlValidator, DEFAULT_LIMIT};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Rows inspected by [`QueryService::history_summary`].
const SUMMARY_WINDOW: u32 = 100;

/// What to run and how it is recorded.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub sql: &'a str,
    pub kind: QueryKind,
    /// SQL for direct queries, the prompt for natural-language ones
    pub input_text: &'a str,
}

impl<'a> ExecutionRequest<'a> {
    pub fn sql(sql: &'a str) -> Self {
        Self {
            sql,
            kind: QueryKind::Sql,
            input_text: sql,
        }
    }

    pub fn natural(sql: &'a str, prompt: &'a str) -> Self {
        Self {
            sql,
            kind: QueryKind::Natural,
            input_text: prompt,
        }
    }
}

/// Runs read-only queries under a deadline and keeps the per-connection
/// history. Every attempt, successful or not, writes one history row before
/// `execute` returns.
pub struct QueryService {
    storage: Arc<SqliteStorage>,
    timeout: Duration,
    default_limit: u64,
}

impl QueryService {
    pub fn new(storage: Arc<SqliteStorage>) -> Self {
        Self::with_limits(storage, DEFAULT_QUERY_TIMEOUT, DEFAULT_LIMIT)
    }

    pub fn with_limits(storage: Arc<SqliteStorage>, timeout: Duration, default_limit: u64) -> Self {
        Self {
            storage,
            timeout,
            default_limit,
        }
    }

    pub async fn execute(
        &self,
        connection: &Connection,
        engine: &dyn Engine,
        request: ExecutionRequest<'_>,
    ) -> Result<QueryResult, AppError> {
        let start_time = Instant::now();
        let dialect = connection.dialect;

        if let Err(e) = SqlValidator::validate(request.sql, dialect) {
            tracing::warn!("Rejected query on {}: {}", connection.name, e);
            self.record_failure(connection, &request, request.sql, start_time, &e)
                .await;
            return Err(e);
        }

        let executed_sql = SqlValidator::ensure_limit(request.sql, dialect, self.default_limit);
        tracing::info!("Executing query on {}: {}", connection.name, executed_sql);

        let row_set = match tokio::time::timeout(self.timeout, engine.fetch(&executed_sql)).await {
            Ok(Ok(row_set)) => row_set,
            Ok(Err(e)) => {
                tracing::warn!("Query failed on {}: {}", connection.name, e);
                self.record_failure(connection, &request, &executed_sql, start_time, &e)
                    .await;
                return Err(e);
            }
            Err(_) => {
                // The dropped fetch future cancels the statement natively
                let e = AppError::QueryTimeout {
                    seconds: self.timeout.as_secs(),
                };
                tracing::error!(
                    "Query on {} exceeded {:?} and was cancelled",
                    connection.name,
                    self.timeout
                );
                self.record_failure(connection, &request, &executed_sql, start_time, &e)
                    .await;
                return Err(e);
            }
        };

        let limit_info = SqlValidator::limit_info(&executed_sql, dialect);
        let RowSet { columns, rows } = row_set;
        let rows = rows_to_objects(&columns, rows);
        let elapsed_ms = start_time.elapsed().as_millis() as u64;

        self.record(NewExecution {
            connection_id: connection.id.clone(),
            connection_name: connection.name.clone(),
            kind: request.kind,
            input_text: request.input_text.to_string(),
            executed_sql: executed_sql.clone(),
            row_count: Some(rows.len() as i64),
            elapsed_ms: elapsed_ms as i64,
            status: QueryStatus::Success,
            error_message: None,
        })
        .await;

        tracing::info!(
            "Query on {} returned {} rows in {}ms",
            connection.name,
            rows.len(),
            elapsed_ms
        );

        Ok(QueryResult {
            executed_sql,
            row_count: rows.len(),
            elapsed_ms,
            columns,
            rows,
            has_limit: limit_info.has_limit,
            limit_value: limit_info.limit_value,
        })
    }

    // ==================== History ====================

    /// One page of history, newest first. `page` is 1-based.
    pub async fn history(
        &self,
        connection: &Connection,
        page: u32,
        page_size: u32,
    ) -> Result<HistoryPage, AppError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = u64::from(page - 1) * u64::from(page_size);

        let items = self
            .storage
            .list_history(&connection.id, page_size, offset)
            .await?;
        let total_count = self.storage.count_history(&connection.id).await?;

        Ok(HistoryPage {
            items,
            total_count,
            page,
            page_size,
        })
    }

    pub async fn history_count(&self, connection: &Connection) -> Result<i64, AppError> {
        Ok(self.storage.count_history(&connection.id).await?)
    }

    /// Total count plus success/error split over the most recent entries.
    pub async fn history_summary(&self, connection: &Connection) -> Result<HistorySummary, AppError> {
        let total_count = self.storage.count_history(&connection.id).await?;
        let recent = self
            .storage
            .list_history(&connection.id, SUMMARY_WINDOW, 0)
            .await?;
        let recent_success_count = recent
            .iter()
            .filter(|item| item.status == QueryStatus::Success)
            .count();

        Ok(HistorySummary {
            total_count,
            recent_success_count,
            recent_error_count: recent.len() - recent_success_count,
        })
    }

    pub async fn delete_history_item(&self, connection: &Connection, id: i64) -> Result<(), AppError> {
        if self.storage.delete_history_item(&connection.id, id).await? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("Query history item {} not found", id)))
        }
    }

    pub async fn delete_history_batch(&self, connection: &Connection, ids: &[i64]) -> Result<usize, AppError> {
        Ok(self.storage.delete_history_batch(&connection.id, ids).await?)
    }

    pub async fn clear_history(&self, connection: &Connection) -> Result<usize, AppError> {
        let deleted = self.storage.clear_history(&connection.id).await?;
        tracing::info!("Cleared {} history entries for {}", deleted, connection.name);
        Ok(deleted)
    }

    async fn record_failure(
        &self,
        connection: &Connection,
        request: &ExecutionRequest<'_>,
        executed_sql: &str,
        start_time: Instant,
        error: &AppError,
    ) {
        self.record(NewExecution {
            connection_id: connection.id.clone(),
            connection_name: connection.name.clone(),
            kind: request.kind,
            input_text: request.input_text.to_string(),
            executed_sql: executed_sql.to_string(),
            row_count: None,
            elapsed_ms: start_time.elapsed().as_millis() as i64,
            status: QueryStatus::Error,
            error_message: Some(error.history_message()),
        })
        .await;
    }

    /// History is secondary to the query outcome: a failed write is logged,
    /// never surfaced.
    async fn record(&self, execution: NewExecution) {
        if let Err(e) = self.storage.insert_execution(&execution).await {
            tracing::error!(
                "Failed to record query history for {}: {}",
                execution.connection_name,
                e
            );
        }
    }
}

fn rows_to_objects(columns: &[ResultColumn], rows: Vec<Vec<Value>>) -> Vec<Map<String, Value>> {
    rows.into_iter()
        .map(|row| {
            columns
                .iter()
                .map(|column| column.name.clone())
                .zip(row)
                .collect()
        })
        .collect()
}
