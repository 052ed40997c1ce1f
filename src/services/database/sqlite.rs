// SQLite engine: read-only connections on the blocking pool
use crate::api::middleware::AppError;
use crate::models::{Dialect, ResultColumn};
use crate::services::database::adapter::{float_value, hex_string, CancelOnDrop, Engine, RowSet};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

const MEMORY_PATH: &str = ":memory:";

pub struct SqliteEngine {
    path: String,
    idle: Arc<Mutex<Vec<Connection>>>,
}

impl SqliteEngine {
    /// Open the database file read-only. Fails if the file does not exist.
    pub fn open(path: &str) -> Result<Self, AppError> {
        let conn = Self::open_connection(path).map_err(|e| AppError::ConnectionTestFailed {
            details: format!("Failed to open SQLite database '{}': {}", path, e),
        })?;

        Ok(Self {
            path: path.to_string(),
            idle: Arc::new(Mutex::new(vec![conn])),
        })
    }

    fn open_connection(path: &str) -> rusqlite::Result<Connection> {
        if path == MEMORY_PATH {
            return Connection::open_in_memory();
        }
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    fn checkout(&self) -> Result<Connection, AppError> {
        let pooled = self
            .idle
            .lock()
            .map_err(|_| AppError::Internal("SQLite connection pool poisoned".to_string()))?
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => Self::open_connection(&self.path).map_err(|e| AppError::ExecutionFailed {
                details: e.to_string(),
            }),
        }
    }

    fn run(conn: &Connection, sql: &str) -> rusqlite::Result<RowSet> {
        let mut stmt = conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let mut types: Vec<Option<&'static str>> = vec![None; names.len()];

        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(names.len());
            for (idx, slot) in types.iter_mut().enumerate() {
                let value = row.get_ref(idx)?;
                if slot.is_none() {
                    *slot = Self::type_name(&value);
                }
                values.push(Self::sqlite_value_to_json(value));
            }
            rows.push(values);
        }

        let columns = names
            .into_iter()
            .zip(types)
            .map(|(name, data_type)| ResultColumn {
                name,
                data_type: data_type.unwrap_or("NULL").to_string(),
            })
            .collect();

        Ok(RowSet { columns, rows })
    }

    fn type_name(value: &ValueRef<'_>) -> Option<&'static str> {
        match value {
            ValueRef::Null => None,
            ValueRef::Integer(_) => Some("INTEGER"),
            ValueRef::Real(_) => Some("REAL"),
            ValueRef::Text(_) => Some("TEXT"),
            ValueRef::Blob(_) => Some("BLOB"),
        }
    }

    fn sqlite_value_to_json(value: ValueRef<'_>) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => json!(i),
            ValueRef::Real(f) => float_value(f),
            ValueRef::Text(bytes) => json!(String::from_utf8_lossy(bytes)),
            ValueRef::Blob(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => json!(s),
                Err(_) => json!(hex_string(bytes)),
            },
        }
    }
}

#[async_trait::async_trait]
impl Engine for SqliteEngine {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn fetch(&self, sql: &str) -> Result<RowSet, AppError> {
        let conn = self.checkout()?;
        let interrupt = conn.get_interrupt_handle();
        let guard = CancelOnDrop::new(move || interrupt.interrupt());

        let idle = self.idle.clone();
        let sql = sql.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let result = Self::run(&conn, &sql);
            if let Ok(mut idle) = idle.lock() {
                idle.push(conn);
            }
            result
        })
        .await;
        guard.disarm();

        match outcome {
            Ok(Ok(row_set)) => Ok(row_set),
            Ok(Err(e)) => Err(AppError::ExecutionFailed {
                details: e.to_string(),
            }),
            Err(e) => Err(AppError::Internal(format!("SQLite task failed: {}", e))),
        }
    }

    async fn close(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
    }
}
