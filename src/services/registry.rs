use chrono::Utc;
use rusqlite::ErrorCode;
use std::sync::Arc;
use std::time::Duration;

use crate::api::middleware::AppError;
use crate::models::{
    detect_dialect, redact_url, scrub_credentials, validate_name, validate_url_length,
    with_native_driver_suffix, Connection, ConnectionRecord, CreateConnectionRequest, Dialect,
    UpdateConnectionRequest,
};
use crate::services::connection_pool::EnginePool;
use crate::services::database::EngineFactory;
use crate::services::metadata_cache::MetadataCache;
use crate::storage::SqliteStorage;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Named connection store. The only component that sees raw URLs; everything
/// else gets the redacted [`Connection`] and, through [`resolve`], a driver URL.
///
/// [`resolve`]: ConnectionRegistry::resolve
pub struct ConnectionRegistry {
    storage: Arc<SqliteStorage>,
    factory: Arc<dyn EngineFactory>,
    pool: Arc<EnginePool>,
    metadata: Arc<MetadataCache>,
    connect_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(
        storage: Arc<SqliteStorage>,
        factory: Arc<dyn EngineFactory>,
        pool: Arc<EnginePool>,
        metadata: Arc<MetadataCache>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            factory,
            pool,
            metadata,
            connect_timeout,
        }
    }

    /// Validate, test and persist a new connection.
    pub async fn create(&self, request: CreateConnectionRequest) -> Result<Connection, AppError> {
        let name = request.name.trim().to_string();
        validate_name(&name)?;
        validate_url_length(&request.url)?;

        self.ensure_name_free(&name).await?;

        let dialect = detect_dialect(&request.url)?;
        self.test_connection(&request.url, dialect).await?;
        self.release_inactive_name(&name).await?;

        let record = ConnectionRecord::new(name, request.url, dialect);
        self.storage
            .insert_connection(&record)
            .await
            .map_err(|e| duplicate_or_storage(e, &record.name))?;

        tracing::info!(
            "Created {} connection {} ({})",
            dialect,
            record.name,
            redact_url(&record.url)
        );
        Ok(record.to_public())
    }

    pub async fn get(&self, name: &str) -> Result<Connection, AppError> {
        Ok(self.record(name).await?.to_public())
    }

    /// Apply a partial update. A changed URL is re-detected and re-tested
    /// before anything is stored, and the pooled engine is dropped after.
    pub async fn update(&self, name: &str, patch: UpdateConnectionRequest) -> Result<Connection, AppError> {
        let mut record = self.record(name).await?;
        if patch.is_empty() {
            return Ok(record.to_public());
        }

        let mut changed = false;
        let mut renamed = false;
        if let Some(new_name) = patch.name.map(|n| n.trim().to_string()) {
            if new_name != record.name {
                validate_name(&new_name)?;
                self.ensure_name_free(&new_name).await?;
                record.name = new_name;
                renamed = true;
                changed = true;
            }
        }

        let mut url_changed = false;
        if let Some(new_url) = patch.url {
            if new_url != record.url {
                validate_url_length(&new_url)?;
                let dialect = detect_dialect(&new_url)?;
                self.test_connection(&new_url, dialect).await?;
                record.url = new_url;
                record.dialect = dialect;
                record.mark_connected();
                url_changed = true;
                changed = true;
            }
        }

        if !changed {
            return Ok(record.to_public());
        }

        if renamed {
            self.release_inactive_name(&record.name).await?;
        }
        self.storage
            .update_connection(&record)
            .await
            .map_err(|e| duplicate_or_storage(e, &record.name))?;

        if url_changed {
            self.pool.dispose(&record.id).await;
            if let Err(e) = self.metadata.invalidate(&record.id).await {
                tracing::error!("Failed to clear metadata for {}: {}", record.name, e);
            }
        }

        tracing::info!("Updated connection {} ({})", record.name, redact_url(&record.url));
        Ok(record.to_public())
    }

    /// Hard delete. History rows go with the connection.
    pub async fn delete(&self, name: &str) -> Result<(), AppError> {
        let record = self.record(name).await?;
        if !self.storage.delete_connection(&record.id).await? {
            return Err(not_found(name));
        }
        self.pool.dispose(&record.id).await;
        self.metadata.forget(&record.id);

        tracing::info!("Deleted connection {}", record.name);
        Ok(())
    }

    /// Active connections, oldest first, URLs redacted.
    pub async fn list(&self) -> Result<Vec<Connection>, AppError> {
        Ok(self
            .storage
            .list_connections(true)
            .await?
            .iter()
            .map(ConnectionRecord::to_public)
            .collect())
    }

    pub async fn set_active(&self, name: &str, active: bool) -> Result<Connection, AppError> {
        let mut record = self.record(name).await?;
        if record.active != active {
            record.active = active;
            self.storage.update_connection(&record).await?;
            if !active {
                self.pool.dispose(&record.id).await;
            }
            tracing::info!(
                "Connection {} {}",
                record.name,
                if active { "activated" } else { "deactivated" }
            );
        }
        Ok(record.to_public())
    }

    /// Redacted connection plus the URL to hand to the engine factory.
    pub async fn resolve(&self, name: &str) -> Result<(Connection, String), AppError> {
        let record = self.record(name).await?;
        if !record.active {
            return Err(AppError::Validation(format!(
                "Connection '{}' is inactive",
                record.name
            )));
        }
        let driver_url = with_native_driver_suffix(&record.url, record.dialect);
        Ok((record.to_public(), driver_url))
    }

    pub async fn mark_connected(&self, connection_id: &str) -> Result<(), AppError> {
        Ok(self.storage.touch_connection(connection_id, Utc::now()).await?)
    }

    /// Only an active connection owns its name.
    async fn ensure_name_free(&self, name: &str) -> Result<(), AppError> {
        match self.storage.get_connection_by_name(name).await? {
            Some(existing) if existing.active => Err(AppError::DuplicateName(name.to_string())),
            _ => Ok(()),
        }
    }

    /// Drop an inactive connection squatting on `name` so it can be reused.
    async fn release_inactive_name(&self, name: &str) -> Result<(), AppError> {
        if let Some(id) = self.storage.delete_inactive_by_name(name).await? {
            self.pool.dispose(&id).await;
            self.metadata.forget(&id);
            tracing::info!("Replaced inactive connection {}", name);
        }
        Ok(())
    }

    async fn record(&self, name: &str) -> Result<ConnectionRecord, AppError> {
        self.storage
            .get_connection_by_name(name)
            .await?
            .ok_or_else(|| not_found(name))
    }

    /// Open, `SELECT 1`, close. Bounded by the connect timeout and never run
    /// while storage is locked.
    async fn test_connection(&self, url: &str, dialect: Dialect) -> Result<(), AppError> {
        let driver_url = with_native_driver_suffix(url, dialect);
        let attempt = async {
            let engine = self.factory.connect(&driver_url).await?;
            let outcome = engine.ping().await;
            engine.close().await;
            outcome
        };

        let details = match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(AppError::ConnectionTestFailed { details }))
            | Ok(Err(AppError::ExecutionFailed { details })) => details,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "Connection timed out after {}s",
                self.connect_timeout.as_secs_f64()
            ),
        };

        let details = scrub_credentials(&scrub_credentials(&details, &driver_url), url);
        tracing::warn!("Connection test failed for {}: {}", redact_url(url), details);
        Err(AppError::ConnectionTestFailed { details })
    }
}

fn not_found(name: &str) -> AppError {
    AppError::NotFound(format!("Connection '{}' not found", name))
}

/// A unique-name race between check and insert surfaces as a constraint error.
fn duplicate_or_storage(e: rusqlite::Error, name: &str) -> AppError {
    if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        AppError::DuplicateName(name.to_string())
    } else {
        e.into()
    }
}
