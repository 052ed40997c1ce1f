// Native engines for every supported dialect
pub mod adapter;
pub mod mysql;
pub mod postgresql;
pub mod sqlite;

pub use adapter::{Engine, EngineFactory, RowSet};
pub use mysql::MySqlEngine;
pub use postgresql::PostgresEngine;
pub use sqlite::SqliteEngine;

use crate::api::middleware::AppError;
use crate::models::{Dialect, DriverUrl};
use std::sync::Arc;

/// Factory for the real drivers. Network pools are capped at `max_pool_size`.
pub struct NativeEngineFactory {
    max_pool_size: usize,
}

impl NativeEngineFactory {
    pub fn new(max_pool_size: usize) -> Self {
        Self { max_pool_size }
    }
}

impl Default for NativeEngineFactory {
    fn default() -> Self {
        Self::new(num_cpus::get() * 2)
    }
}

#[async_trait::async_trait]
impl EngineFactory for NativeEngineFactory {
    async fn connect(&self, driver_url: &str) -> Result<Arc<dyn Engine>, AppError> {
        let target = DriverUrl::parse(driver_url)?;
        let engine: Arc<dyn Engine> = match target.dialect {
            Dialect::PostgreSql => Arc::new(PostgresEngine::new(&target.target, self.max_pool_size)?),
            Dialect::MySql => Arc::new(MySqlEngine::new(&target.target, self.max_pool_size)?),
            Dialect::Sqlite => {
                let path = target.target.clone();
                let engine = tokio::task::spawn_blocking(move || SqliteEngine::open(&path))
                    .await
                    .map_err(|e| AppError::Internal(format!("SQLite open task failed: {}", e)))??;
                Arc::new(engine)
            }
        };
        Ok(engine)
    }
}
