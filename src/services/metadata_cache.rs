use chrono::{SubsecRound, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::middleware::AppError;
use crate::models::{Connection, SchemaSnapshot, SnapshotBody};
use crate::services::database::Engine;
use crate::services::introspection::SchemaIntrospector;
use crate::storage::SqliteStorage;

pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(3600);

/// Schema snapshot cache persisted next to each connection row.
pub struct MetadataCache {
    storage: Arc<SqliteStorage>,
    ttl: chrono::Duration,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MetadataCache {
    pub fn new(storage: Arc<SqliteStorage>, ttl: Duration) -> Self {
        Self {
            storage,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(5200)),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return the stored snapshot while it is fresh, otherwise introspect and
    /// replace it. Concurrent callers for one connection share a refresh.
    pub async fn fetch(
        &self,
        connection: &Connection,
        engine: &dyn Engine,
        force_refresh: bool,
    ) -> Result<SchemaSnapshot, AppError> {
        let requested_at = Utc::now().trunc_subsecs(6);

        if !force_refresh {
            if let Some(snapshot) = self.fresh(&connection.id).await? {
                tracing::debug!("Metadata cache hit for {}", connection.name);
                return Ok(snapshot);
            }
        }

        let lock = self.refresh_lock(&connection.id);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(snapshot) = self.cached(&connection.id).await? {
            let refreshed_meanwhile = snapshot.fetched_at >= requested_at;
            if refreshed_meanwhile || (!force_refresh && self.is_fresh(&snapshot)) {
                return Ok(snapshot);
            }
        }

        // Stamped before the first catalog read, so a waiter only reuses a
        // snapshot whose reads all began after its own request
        let started_at = Utc::now().trunc_subsecs(6);
        tracing::info!("Refreshing metadata for connection {}", connection.name);
        let mut snapshot = SchemaIntrospector::introspect(engine, None).await?;
        snapshot.fetched_at = started_at;

        let body = serde_json::to_string(&SnapshotBody {
            tables: snapshot.tables.clone(),
            views: snapshot.views.clone(),
        })?;
        if !self
            .storage
            .save_snapshot(&connection.id, &body, snapshot.fetched_at)
            .await?
        {
            tracing::warn!("Connection {} vanished before metadata was stored", connection.name);
        }
        self.storage
            .touch_connection(&connection.id, snapshot.fetched_at)
            .await?;

        Ok(snapshot)
    }

    /// Stored snapshot regardless of age. Unreadable entries count as absent.
    pub async fn cached(&self, connection_id: &str) -> Result<Option<SchemaSnapshot>, AppError> {
        let Some(stored) = self.storage.load_snapshot(connection_id).await? else {
            return Ok(None);
        };
        let Some(fetched_at) = stored.updated_at else {
            tracing::warn!("Ignoring metadata for {} with unreadable timestamp", connection_id);
            return Ok(None);
        };

        match serde_json::from_str::<SnapshotBody>(&stored.body) {
            Ok(body) => Ok(Some(SchemaSnapshot {
                tables: body.tables,
                views: body.views,
                fetched_at,
            })),
            Err(e) => {
                tracing::warn!("Ignoring unreadable metadata for {}: {}", connection_id, e);
                Ok(None)
            }
        }
    }

    /// Drop the stored snapshot so the next fetch introspects.
    pub async fn invalidate(&self, connection_id: &str) -> Result<(), AppError> {
        self.storage.clear_snapshot(connection_id).await?;
        self.forget(connection_id);
        Ok(())
    }

    /// Release the refresh lock of a deleted connection.
    pub fn forget(&self, connection_id: &str) {
        if let Ok(mut locks) = self.refresh_locks.lock() {
            locks.remove(connection_id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.refresh_locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    async fn fresh(&self, connection_id: &str) -> Result<Option<SchemaSnapshot>, AppError> {
        Ok(self
            .cached(connection_id)
            .await?
            .filter(|snapshot| self.is_fresh(snapshot)))
    }

    fn is_fresh(&self, snapshot: &SchemaSnapshot) -> bool {
        snapshot.is_fresh(self.ttl, Utc::now())
    }

    fn refresh_lock(&self, connection_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.refresh_locks.lock() {
            Ok(mut locks) => locks
                .entry(connection_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone(),
            // A poisoned map only costs us sharing
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}
