// PostgreSQL engine using connection pooling for optimal resource management
use crate::api::middleware::AppError;
use crate::models::{scrub_credentials, Dialect, ResultColumn};
use crate::services::database::adapter::{float_value, hex_string, CancelOnDrop, Engine, RowSet};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::error::Error;
use std::net::IpAddr;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

pub struct PostgresEngine {
    pool: Pool,
    url: String,
}

impl PostgresEngine {
    /// Build a lazily-connecting pool. No network I/O happens here.
    pub fn new(url: &str, max_pool_size: usize) -> Result<Self, AppError> {
        let mut cfg = PoolConfig::new();
        cfg.url = Some(url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
            .map_err(|e| AppError::ConnectionTestFailed {
                details: scrub_credentials(&format!("Failed to create connection pool: {}", e), url),
            })?;
        pool.resize(max_pool_size.max(1));

        Ok(Self {
            pool,
            url: url.to_string(),
        })
    }

    fn driver_error(&self, context: &str, e: impl std::fmt::Display) -> AppError {
        AppError::ExecutionFailed {
            details: scrub_credentials(&format!("{}: {}", context, e), &self.url),
        }
    }

    fn query_error(&self, e: tokio_postgres::Error) -> AppError {
        match e.as_db_error() {
            Some(db_error) => AppError::ExecutionFailed {
                details: format!(
                    "Code: {}, Message: {}",
                    db_error.code().code(),
                    db_error.message()
                ),
            },
            None => self.driver_error("Query execution failed", e),
        }
    }

    fn row_to_json(row: &Row) -> Vec<Value> {
        (0..row.len())
            .map(|idx| match row.try_get::<_, Option<PgCell>>(idx) {
                Ok(cell) => cell.map(|c| c.0).unwrap_or(Value::Null),
                Err(e) => {
                    tracing::warn!("Failed to decode PostgreSQL column {}: {}", idx, e);
                    Value::Null
                }
            })
            .collect()
    }
}

/// One decoded cell. Accepts every type: known types map to JSON primitives
/// or their canonical text, anything else falls back to its UTF-8 payload
/// (enums, domains over text, xml) or lowercase hex.
pub(crate) struct PgCell(pub Value);

impl<'a> FromSql<'a> for PgCell {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        let value = match *ty {
            Type::BOOL => json!(bool::from_sql(ty, raw)?),
            Type::INT2 => json!(i16::from_sql(ty, raw)?),
            Type::INT4 => json!(i32::from_sql(ty, raw)?),
            Type::INT8 => json!(i64::from_sql(ty, raw)?),
            Type::OID => json!(u32::from_sql(ty, raw)?),
            Type::FLOAT4 => float_value(f32::from_sql(ty, raw)? as f64),
            Type::FLOAT8 => float_value(f64::from_sql(ty, raw)?),
            Type::NUMERIC => match numeric_special(raw) {
                Some(special) => json!(special),
                None => json!(Decimal::from_sql(ty, raw)?.to_string()),
            },
            Type::UUID => json!(Uuid::from_sql(ty, raw)?.to_string()),
            Type::JSON | Type::JSONB => Value::from_sql(ty, raw)?,
            Type::BYTEA => json!(format!("\\x{}", hex_string(<&[u8]>::from_sql(ty, raw)?))),
            Type::INET => json!(IpAddr::from_sql(ty, raw)?.to_string()),
            Type::INTERVAL => json!(interval_string(raw)?),
            Type::DATE => json!(NaiveDate::from_sql(ty, raw)?.format("%Y-%m-%d").to_string()),
            Type::TIME => json!(NaiveTime::from_sql(ty, raw)?.format("%H:%M:%S%.f").to_string()),
            Type::TIMESTAMP => json!(NaiveDateTime::from_sql(ty, raw)?
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string()),
            Type::TIMESTAMPTZ => json!(DateTime::<Utc>::from_sql(ty, raw)?.to_rfc3339()),
            _ => match std::str::from_utf8(raw) {
                Ok(text) => json!(text),
                Err(_) => json!(hex_string(raw)),
            },
        };
        Ok(PgCell(value))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// NaN and the infinities have no `Decimal` form; their sign word says so.
fn numeric_special(raw: &[u8]) -> Option<&'static str> {
    match raw.get(4..6)? {
        [0xC0, 0x00] => Some("NaN"),
        [0xD0, 0x00] => Some("Infinity"),
        [0xF0, 0x00] => Some("-Infinity"),
        _ => None,
    }
}

/// Binary interval (microseconds, days, months) in PostgreSQL's output style.
fn interval_string(raw: &[u8]) -> Result<String, Box<dyn Error + Sync + Send>> {
    if raw.len() != 16 {
        return Err(format!("invalid interval length {}", raw.len()).into());
    }
    let micros = i64::from_be_bytes(raw[0..8].try_into()?);
    let days = i32::from_be_bytes(raw[8..12].try_into()?);
    let months = i32::from_be_bytes(raw[12..16].try_into()?);

    let unit = |n: i64, singular: &str, plural: &str| {
        format!("{} {}", n, if n.abs() == 1 { singular } else { plural })
    };

    let mut parts = Vec::new();
    let (years, mons) = (months / 12, months % 12);
    if years != 0 {
        parts.push(unit(years as i64, "year", "years"));
    }
    if mons != 0 {
        parts.push(unit(mons as i64, "mon", "mons"));
    }
    if days != 0 {
        parts.push(unit(days as i64, "day", "days"));
    }
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let total = micros.unsigned_abs();
        let (hours, rest) = (total / 3_600_000_000, total % 3_600_000_000);
        let (minutes, rest) = (rest / 60_000_000, rest % 60_000_000);
        let (seconds, fraction) = (rest / 1_000_000, rest % 1_000_000);
        let mut time = format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds);
        if fraction > 0 {
            time.push_str(format!(".{:06}", fraction).trim_end_matches('0'));
        }
        parts.push(time);
    }
    Ok(parts.join(" "))
}

#[async_trait::async_trait]
impl Engine for PostgresEngine {
    fn dialect(&self) -> Dialect {
        Dialect::PostgreSql
    }

    async fn fetch(&self, sql: &str) -> Result<RowSet, AppError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| self.driver_error("Failed to get connection from pool", e))?;

        let token = client.cancel_token();
        let guard = CancelOnDrop::new(move || {
            tokio::spawn(async move {
                if let Err(e) = token.cancel_query(NoTls).await {
                    tracing::warn!("Failed to cancel PostgreSQL query: {}", e);
                }
            });
        });

        let outcome = async {
            let statement = client.prepare(sql).await?;
            let rows = client.query(&statement, &[]).await?;
            Ok::<_, tokio_postgres::Error>((statement, rows))
        }
        .await;
        guard.disarm();
        let (statement, rows) = outcome.map_err(|e| self.query_error(e))?;

        let columns = statement
            .columns()
            .iter()
            .map(|column| ResultColumn {
                name: column.name().to_string(),
                data_type: column.type_().name().to_string(),
            })
            .collect();

        Ok(RowSet {
            columns,
            rows: rows.iter().map(Self::row_to_json).collect(),
        })
    }

    async fn ping(&self) -> Result<(), AppError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| self.driver_error("Connection test failed", e))?;
        client
            .batch_execute("SELECT 1")
            .await
            .map_err(|e| self.query_error(e))
    }

    async fn close(&self) {
        self.pool.close();
    }
}
