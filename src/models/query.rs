use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::api::middleware::AppError;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const SQL_MAX_LEN: usize = 100_000;
pub const PROMPT_MAX_LEN: usize = 5_000;
pub const DEFAULT_SUGGESTIONS: usize = 6;
pub const MIN_SUGGESTIONS: usize = 3;
pub const MAX_SUGGESTIONS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Sql,
    Natural,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Sql => "sql",
            QueryKind::Natural => "natural",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "natural" => QueryKind::Natural,
            _ => QueryKind::Sql,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => QueryStatus::Success,
            _ => QueryStatus::Error,
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExecution {
    pub id: i64,
    pub connection_id: String,
    pub connection_name: String,
    pub kind: QueryKind,
    pub input_text: String,
    pub executed_sql: String,
    pub row_count: Option<i64>,
    pub elapsed_ms: i64,
    pub status: QueryStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// History row before insertion.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub connection_id: String,
    pub connection_name: String,
    pub kind: QueryKind,
    pub input_text: String,
    pub executed_sql: String,
    pub row_count: Option<i64>,
    pub elapsed_ms: i64,
    pub status: QueryStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub executed_sql: String,
    pub row_count: usize,
    pub elapsed_ms: u64,
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Map<String, Value>>,
    pub has_limit: bool,
    pub limit_value: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub items: Vec<QueryExecution>,
    pub total_count: i64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySummary {
    pub total_count: i64,
    pub recent_success_count: usize,
    pub recent_error_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
}

impl QueryRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.sql.trim().is_empty() {
            return Err(AppError::Validation("SQL query cannot be empty".to_string()));
        }
        if self.sql.len() > SQL_MAX_LEN {
            return Err(AppError::Validation(format!(
                "SQL query exceeds {} characters",
                SQL_MAX_LEN
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct NaturalQueryRequest {
    pub prompt: String,
    #[serde(default = "default_execute")]
    pub execute: bool,
}

fn default_execute() -> bool {
    true
}

impl NaturalQueryRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        let len = self.prompt.trim().chars().count();
        if len == 0 || len > PROMPT_MAX_LEN {
            return Err(AppError::Validation(format!(
                "Prompt must be between 1 and {} characters",
                PROMPT_MAX_LEN
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct NaturalQueryResponse {
    pub generated_sql: String,
    pub explanation: Option<String>,
    pub result: Option<QueryResult>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl HistoryParams {
    /// 1-based page and a page size clamped to `1..=MAX_PAGE_SIZE`.
    pub fn normalized(&self) -> (u32, u32) {
        (self.page.max(1), self.page_size.clamp(1, MAX_PAGE_SIZE))
    }
}

/// Body of a history delete. `ids: None` clears the connection's history.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteHistoryRequest {
    pub ids: Option<Vec<i64>>,
}

#[derive(Debug, Serialize)]
pub struct DeleteHistoryResponse {
    pub deleted: usize,
}

/// A query idea for the connection's schema: what it answers plus the SQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedQuery {
    pub description: String,
    pub sql: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SuggestedQueriesParams {
    pub limit: Option<usize>,
    /// Varies the output between otherwise identical requests.
    pub seed: Option<u64>,
    /// Comma-separated descriptions the caller has already shown.
    pub exclude: Option<String>,
}

impl SuggestedQueriesParams {
    pub fn limit(&self) -> Result<usize, AppError> {
        match self.limit {
            None => Ok(DEFAULT_SUGGESTIONS),
            Some(limit) if (MIN_SUGGESTIONS..=MAX_SUGGESTIONS).contains(&limit) => Ok(limit),
            Some(_) => Err(AppError::Validation(format!(
                "limit must be between {} and {}",
                MIN_SUGGESTIONS, MAX_SUGGESTIONS
            ))),
        }
    }

    pub fn excluded(&self) -> Vec<String> {
        self.exclude
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct SuggestedQueriesResponse {
    pub suggestions: Vec<SuggestedQuery>,
}
