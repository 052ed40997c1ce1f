use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{ConnectionRecord, Dialect, NewExecution, QueryExecution, QueryKind, QueryStatus};

/// Stored schema blob for one connection.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub body: String,
    /// `None` when the stored timestamp is missing or unparseable
    pub updated_at: Option<DateTime<Utc>>,
}

/// SQLite storage for connections, schema snapshots and query history.
/// Uses tokio::Mutex for async-friendly locking
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

const CONNECTION_COLUMNS: &str =
    "id, name, url, dialect, created_at, last_connected_at, active";

const HISTORY_COLUMNS: &str = "id, connection_id, connection_name, kind, input_text, executed_sql, \
     row_count, elapsed_ms, status, error_message, created_at";

impl SqliteStorage {
    /// Open (or create) the store. Accepts a plain path or a `sqlite:` URL.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path: &str = match path_str.strip_prefix("sqlite:") {
            Some(rest) => rest.strip_prefix("//").unwrap_or(rest),
            None => path_str.as_ref(),
        };

        let conn = Connection::open(clean_path)?;
        Self::from_connection(conn).await
    }

    /// Throwaway in-memory store.
    pub async fn in_memory() -> SqliteResult<Self> {
        Self::from_connection(Connection::open_in_memory()?).await
    }

    async fn from_connection(conn: Connection) -> SqliteResult<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                dialect TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_connected_at TEXT,
                metadata_json TEXT,
                metadata_updated_at TEXT,
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS query_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                connection_id TEXT NOT NULL,
                connection_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                input_text TEXT NOT NULL,
                executed_sql TEXT NOT NULL,
                row_count INTEGER,
                elapsed_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (connection_id) REFERENCES connections(id) ON DELETE CASCADE
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_connections_active_created ON connections(active, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_query_history_connection ON query_history(connection_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_query_history_created ON query_history(created_at DESC)",
            [],
        )?;

        Ok(())
    }

    // ==================== Connections ====================

    pub async fn insert_connection(&self, record: &ConnectionRecord) -> SqliteResult<()> {
        let db_conn = self.conn.lock().await;
        db_conn.execute(
            r#"
            INSERT INTO connections (id, name, url, dialect, created_at, last_connected_at, active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.id,
                record.name,
                record.url,
                record.dialect.as_str(),
                format_timestamp(&record.created_at),
                record.last_connected_at.as_ref().map(format_timestamp),
                record.active,
            ],
        )?;
        Ok(())
    }

    /// Rewrite the mutable columns of a connection row.
    pub async fn update_connection(&self, record: &ConnectionRecord) -> SqliteResult<bool> {
        let db_conn = self.conn.lock().await;
        let rows_affected = db_conn.execute(
            r#"
            UPDATE connections
            SET name = ?1, url = ?2, dialect = ?3, last_connected_at = ?4, active = ?5
            WHERE id = ?6
            "#,
            params![
                record.name,
                record.url,
                record.dialect.as_str(),
                record.last_connected_at.as_ref().map(format_timestamp),
                record.active,
                record.id,
            ],
        )?;
        Ok(rows_affected > 0)
    }

    pub async fn touch_connection(&self, id: &str, at: DateTime<Utc>) -> SqliteResult<()> {
        let db_conn = self.conn.lock().await;
        db_conn.execute(
            "UPDATE connections SET last_connected_at = ?1 WHERE id = ?2",
            params![format_timestamp(&at), id],
        )?;
        Ok(())
    }

    pub async fn get_connection(&self, id: &str) -> SqliteResult<Option<ConnectionRecord>> {
        let db_conn = self.conn.lock().await;
        db_conn
            .query_row(
                &format!("SELECT {} FROM connections WHERE id = ?1", CONNECTION_COLUMNS),
                params![id],
                connection_from_row,
            )
            .optional()
    }

    pub async fn get_connection_by_name(&self, name: &str) -> SqliteResult<Option<ConnectionRecord>> {
        let db_conn = self.conn.lock().await;
        db_conn
            .query_row(
                &format!("SELECT {} FROM connections WHERE name = ?1", CONNECTION_COLUMNS),
                params![name],
                connection_from_row,
            )
            .optional()
    }

    /// Connections ordered by creation time, oldest first.
    pub async fn list_connections(&self, active_only: bool) -> SqliteResult<Vec<ConnectionRecord>> {
        let db_conn = self.conn.lock().await;
        let sql = if active_only {
            format!(
                "SELECT {} FROM connections WHERE active = 1 ORDER BY created_at ASC",
                CONNECTION_COLUMNS
            )
        } else {
            format!("SELECT {} FROM connections ORDER BY created_at ASC", CONNECTION_COLUMNS)
        };
        let mut stmt = db_conn.prepare(&sql)?;
        let rows = stmt.query_map([], connection_from_row)?;

        let mut connections = Vec::new();
        for row in rows {
            connections.push(row?);
        }
        Ok(connections)
    }

    /// Hard delete. History rows go with it through the foreign key.
    pub async fn delete_connection(&self, id: &str) -> SqliteResult<bool> {
        let db_conn = self.conn.lock().await;
        let rows_affected = db_conn.execute("DELETE FROM connections WHERE id = ?1", params![id])?;
        Ok(rows_affected > 0)
    }

    /// Remove the inactive connection holding `name`, if any, returning its id.
    pub async fn delete_inactive_by_name(&self, name: &str) -> SqliteResult<Option<String>> {
        let db_conn = self.conn.lock().await;
        db_conn
            .query_row(
                "DELETE FROM connections WHERE name = ?1 AND active = 0 RETURNING id",
                params![name],
                |row| row.get(0),
            )
            .optional()
    }

    // ==================== Schema snapshots ====================

    pub async fn save_snapshot(
        &self,
        connection_id: &str,
        body: &str,
        fetched_at: DateTime<Utc>,
    ) -> SqliteResult<bool> {
        let db_conn = self.conn.lock().await;
        let rows_affected = db_conn.execute(
            "UPDATE connections SET metadata_json = ?1, metadata_updated_at = ?2 WHERE id = ?3",
            params![body, format_timestamp(&fetched_at), connection_id],
        )?;
        Ok(rows_affected > 0)
    }

    pub async fn load_snapshot(&self, connection_id: &str) -> SqliteResult<Option<StoredSnapshot>> {
        let db_conn = self.conn.lock().await;
        let row = db_conn
            .query_row(
                "SELECT metadata_json, metadata_updated_at FROM connections WHERE id = ?1",
                params![connection_id],
                |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;

        Ok(match row {
            Some((Some(body), updated_at)) => Some(StoredSnapshot {
                body,
                updated_at: updated_at.as_deref().and_then(parse_timestamp),
            }),
            _ => None,
        })
    }

    pub async fn clear_snapshot(&self, connection_id: &str) -> SqliteResult<()> {
        let db_conn = self.conn.lock().await;
        db_conn.execute(
            "UPDATE connections SET metadata_json = NULL, metadata_updated_at = NULL WHERE id = ?1",
            params![connection_id],
        )?;
        Ok(())
    }

    // ==================== Query history ====================

    pub async fn insert_execution(&self, execution: &NewExecution) -> SqliteResult<i64> {
        let db_conn = self.conn.lock().await;
        db_conn.execute(
            r#"
            INSERT INTO query_history
            (connection_id, connection_name, kind, input_text, executed_sql,
             row_count, elapsed_ms, status, error_message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                execution.connection_id,
                execution.connection_name,
                execution.kind.as_str(),
                execution.input_text,
                execution.executed_sql,
                execution.row_count,
                execution.elapsed_ms,
                execution.status.as_str(),
                execution.error_message,
                format_timestamp(&Utc::now()),
            ],
        )?;
        Ok(db_conn.last_insert_rowid())
    }

    /// Newest first.
    pub async fn list_history(
        &self,
        connection_id: &str,
        limit: u32,
        offset: u64,
    ) -> SqliteResult<Vec<QueryExecution>> {
        let db_conn = self.conn.lock().await;
        let mut stmt = db_conn.prepare(&format!(
            "SELECT {} FROM query_history WHERE connection_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            HISTORY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![connection_id, limit, offset as i64], execution_from_row)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    pub async fn count_history(&self, connection_id: &str) -> SqliteResult<i64> {
        let db_conn = self.conn.lock().await;
        db_conn.query_row(
            "SELECT COUNT(*) FROM query_history WHERE connection_id = ?1",
            params![connection_id],
            |row| row.get(0),
        )
    }

    pub async fn delete_history_item(&self, connection_id: &str, id: i64) -> SqliteResult<bool> {
        let db_conn = self.conn.lock().await;
        let rows_affected = db_conn.execute(
            "DELETE FROM query_history WHERE connection_id = ?1 AND id = ?2",
            params![connection_id, id],
        )?;
        Ok(rows_affected > 0)
    }

    pub async fn delete_history_batch(&self, connection_id: &str, ids: &[i64]) -> SqliteResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let db_conn = self.conn.lock().await;
        let placeholders = (0..ids.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "DELETE FROM query_history WHERE connection_id = ?1 AND id IN ({})",
            placeholders
        );

        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(ids.len() + 1);
        values.push(connection_id.to_string().into());
        values.extend(ids.iter().map(|id| rusqlite::types::Value::from(*id)));

        db_conn.execute(&sql, params_from_iter(values))
    }

    pub async fn clear_history(&self, connection_id: &str) -> SqliteResult<usize> {
        let db_conn = self.conn.lock().await;
        db_conn.execute(
            "DELETE FROM query_history WHERE connection_id = ?1",
            params![connection_id],
        )
    }
}

/// Timestamps are stored as RFC 3339 UTC with microseconds.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The one place stored timestamps are read back. Accepts RFC 3339 and the
/// `YYYY-MM-DD HH:MM:SS[.f]` form SQLite's own clock functions emit.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn connection_from_row(row: &Row<'_>) -> SqliteResult<ConnectionRecord> {
    let dialect: String = row.get(3)?;
    let dialect = dialect
        .parse::<Dialect>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(ConnectionRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        dialect,
        created_at: parse_timestamp(&row.get::<_, String>(4)?).unwrap_or_default(),
        last_connected_at: row
            .get::<_, Option<String>>(5)?
            .as_deref()
            .and_then(parse_timestamp),
        active: row.get(6)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> SqliteResult<QueryExecution> {
    Ok(QueryExecution {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        connection_name: row.get(2)?,
        kind: QueryKind::parse(&row.get::<_, String>(3)?),
        input_text: row.get(4)?,
        executed_sql: row.get(5)?,
        row_count: row.get(6)?,
        elapsed_ms: row.get(7)?,
        status: QueryStatus::parse(&row.get::<_, String>(8)?),
        error_message: row.get(9)?,
        created_at: parse_timestamp(&row.get::<_, String>(10)?).unwrap_or_default(),
    })
}
