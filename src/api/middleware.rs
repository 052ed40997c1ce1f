use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("A connection named '{0}' already exists")]
    DuplicateName(String),

    #[error("Unsupported database dialect: {0}")]
    UnsupportedDialect(String),

    #[error("Malformed connection string: {0}")]
    MalformedConnectionString(String),

    #[error("Connection test failed")]
    ConnectionTestFailed { details: String },

    #[error("SQL syntax error: {message}")]
    SyntaxError {
        message: String,
        sql: String,
        line: Option<u64>,
        column: Option<u64>,
    },

    #[error("Only SELECT queries are allowed, found {kind}")]
    NonSelectStatement { kind: String },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Query timeout after {seconds} seconds")]
    QueryTimeout { seconds: u64 },

    #[error("Query execution failed")]
    ExecutionFailed { details: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM service error: {0}")]
    LlmService(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Coarse error classes the transport layer distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Timeout,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::DuplicateName(_)
            | AppError::UnsupportedDialect(_)
            | AppError::MalformedConnectionString(_)
            | AppError::ConnectionTestFailed { .. }
            | AppError::SyntaxError { .. }
            | AppError::NonSelectStatement { .. }
            | AppError::InvalidIdentifier(_)
            | AppError::Validation(_) => ErrorKind::Validation,
            AppError::QueryTimeout { .. } => ErrorKind::Timeout,
            AppError::ExecutionFailed { .. }
            | AppError::Database(_)
            | AppError::LlmService(_)
            | AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::DuplicateName(_) => "DUPLICATE_NAME",
            AppError::UnsupportedDialect(_) => "UNSUPPORTED_DIALECT",
            AppError::MalformedConnectionString(_) => "MALFORMED_CONNECTION_STRING",
            AppError::ConnectionTestFailed { .. } => "CONNECTION_TEST_FAILED",
            AppError::SyntaxError { .. } => "SQL_SYNTAX_ERROR",
            AppError::NonSelectStatement { .. } => "INVALID_STATEMENT_TYPE",
            AppError::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            AppError::QueryTimeout { .. } => "QUERY_TIMEOUT",
            AppError::ExecutionFailed { .. } => "EXECUTION_FAILED",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::LlmService(_) => "LLM_SERVICE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Driver or parser detail attached to the error, if any.
    pub fn details(&self) -> Option<String> {
        match self {
            AppError::ConnectionTestFailed { details } | AppError::ExecutionFailed { details } => {
                Some(details.clone())
            }
            AppError::SyntaxError {
                line: Some(line),
                column: Some(column),
                ..
            } => Some(format!("line {}, column {}", line, column)),
            _ => None,
        }
    }

    /// Message recorded in query history for a failed attempt.
    pub fn history_message(&self) -> String {
        match self {
            AppError::QueryTimeout { .. } => "Query timeout".to_string(),
            _ => match self.details() {
                Some(details) => format!("{}: {}", self, details),
                None => self.to_string(),
            },
        }
    }
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Status code for an error, keyed on its kind.
pub fn status_for(error: &AppError) -> StatusCode {
    if let AppError::DuplicateName(_) = error {
        return StatusCode::CONFLICT;
    }
    match error.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::error!(code = self.code(), "Request failed: {}", self);
        }

        let mut error_detail = ErrorDetail::new(self.code(), self.to_string());
        if let Some(details) = self.details() {
            error_detail = error_detail.with_details(details);
        }

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Convert rusqlite::Error to AppError
impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("Serialization failed: {}", err))
    }
}
