// MySQL engine using connection pooling for optimal resource management
use crate::api::middleware::AppError;
use crate::models::{scrub_credentials, Dialect, ResultColumn};
use crate::services::database::adapter::{float_value, hex_string, CancelOnDrop, Engine, RowSet};
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, Value as MySqlValue};
use serde_json::{json, Value};

pub struct MySqlEngine {
    pool: Pool,
    url: String,
}

impl MySqlEngine {
    /// Build a lazily-connecting pool. No network I/O happens here.
    pub fn new(url: &str, max_pool_size: usize) -> Result<Self, AppError> {
        let opts = Opts::from_url(url).map_err(|e| AppError::ConnectionTestFailed {
            details: scrub_credentials(&format!("Invalid MySQL URL: {}", e), url),
        })?;

        let mut builder = OptsBuilder::from_opts(opts);
        if let Some(constraints) = PoolConstraints::new(0, max_pool_size.max(1)) {
            builder = builder.pool_opts(PoolOpts::default().with_constraints(constraints));
        }

        Ok(Self {
            pool: Pool::new(builder),
            url: url.to_string(),
        })
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<Conn, AppError> {
        self.pool
            .get_conn()
            .await
            .map_err(|e| self.driver_error("Failed to get MySQL connection from pool", e))
    }

    fn driver_error(&self, context: &str, e: impl std::fmt::Display) -> AppError {
        AppError::ExecutionFailed {
            details: scrub_credentials(&format!("{}: {}", context, e), &self.url),
        }
    }

    fn column_type_name(column_type: ColumnType) -> String {
        format!("{:?}", column_type)
            .trim_start_matches("MYSQL_TYPE_")
            .to_lowercase()
    }

    /// Convert a MySQL value to JSON. Temporal values use ISO-8601.
    fn mysql_value_to_json(mysql_val: MySqlValue, column_type: ColumnType) -> Value {
        match mysql_val {
            MySqlValue::NULL => Value::Null,
            MySqlValue::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(s) => json!(s),
                Err(e) => json!(hex_string(e.as_bytes())),
            },
            MySqlValue::Int(i) => json!(i),
            MySqlValue::UInt(u) => json!(u),
            MySqlValue::Float(f) => float_value(f as f64),
            MySqlValue::Double(d) => float_value(d),
            MySqlValue::Date(y, m, d, h, min, s, micros) => {
                if column_type == ColumnType::MYSQL_TYPE_DATE {
                    json!(format!("{:04}-{:02}-{:02}", y, m, d))
                } else if micros > 0 {
                    json!(format!(
                        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}",
                        y, m, d, h, min, s, micros
                    ))
                } else {
                    json!(format!("{:04}-{:02}-{:02}T{:02}:{:02}:{:02}", y, m, d, h, min, s))
                }
            }
            MySqlValue::Time(is_neg, d, h, m, s, micros) => {
                let sign = if is_neg { "-" } else { "" };
                let total_hours = d * 24 + h as u32;
                if micros > 0 {
                    json!(format!("{}{:02}:{:02}:{:02}.{:06}", sign, total_hours, m, s, micros))
                } else {
                    json!(format!("{}{:02}:{:02}:{:02}", sign, total_hours, m, s))
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Engine for MySqlEngine {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn fetch(&self, sql: &str) -> Result<RowSet, AppError> {
        let mut conn = self.get_conn().await?;

        let connection_id = conn.id();
        let pool = self.pool.clone();
        let guard = CancelOnDrop::new(move || {
            tokio::spawn(async move {
                match pool.get_conn().await {
                    Ok(mut killer) => {
                        if let Err(e) = killer.query_drop(format!("KILL QUERY {}", connection_id)).await {
                            tracing::warn!("Failed to cancel MySQL query: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to cancel MySQL query: {}", e),
                }
            });
        });

        // Binary protocol keeps numeric and temporal values typed
        let outcome = async {
            let mut result = conn.exec_iter(sql, ()).await?;
            let column_types: Vec<ColumnType> = result
                .columns_ref()
                .iter()
                .map(|c| c.column_type())
                .collect();
            let columns: Vec<ResultColumn> = result
                .columns_ref()
                .iter()
                .map(|c| ResultColumn {
                    name: c.name_str().to_string(),
                    data_type: Self::column_type_name(c.column_type()),
                })
                .collect();
            let rows: Vec<Row> = result.collect().await?;
            Ok::<_, mysql_async::Error>((columns, column_types, rows))
        }
        .await;
        guard.disarm();
        let (columns, column_types, rows) =
            outcome.map_err(|e| self.driver_error("Query execution failed", e))?;

        let rows = rows
            .into_iter()
            .map(|mut row: Row| {
                column_types
                    .iter()
                    .enumerate()
                    .map(|(idx, column_type)| {
                        let value = row.take::<MySqlValue, usize>(idx).unwrap_or(MySqlValue::NULL);
                        Self::mysql_value_to_json(value, *column_type)
                    })
                    .collect()
            })
            .collect();

        Ok(RowSet { columns, rows })
    }

    async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.get_conn().await?;
        conn.query_drop("SELECT 1")
            .await
            .map_err(|e| self.driver_error("Connection test failed", e))
    }

    async fn close(&self) {
        if let Err(e) = self.pool.clone().disconnect().await {
            tracing::warn!("Failed to disconnect MySQL pool: {}", e);
        }
    }
}
