// Engine abstraction shared by every dialect
use crate::api::middleware::AppError;
use crate::models::{Dialect, ResultColumn};
use serde_json::Value;
use std::sync::Arc;

/// Raw result of one statement: column descriptors plus positional rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<Value>>,
}

/// A native handle able to run statements against one database.
///
/// Dropping an in-flight `fetch` future cancels the native call on a best
/// effort basis; callers bound a fetch with a deadline and simply drop it.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Run one statement and collect every row.
    async fn fetch(&self, sql: &str) -> Result<RowSet, AppError>;

    /// Open a connection and run `SELECT 1`.
    async fn ping(&self) -> Result<(), AppError> {
        self.fetch("SELECT 1").await.map(|_| ())
    }

    /// Release native resources. Idempotent.
    async fn close(&self);
}

/// Builds engines from driver-qualified URLs.
#[async_trait::async_trait]
pub trait EngineFactory: Send + Sync {
    async fn connect(&self, driver_url: &str) -> Result<Arc<dyn Engine>, AppError>;
}

/// Runs its action on drop unless disarmed first.
pub(crate) struct CancelOnDrop<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> CancelOnDrop<F> {
    pub(crate) fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }

    pub(crate) fn disarm(mut self) {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for CancelOnDrop<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

/// Lowercase hex for binary values that are not valid UTF-8.
pub(crate) fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
