use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::api::middleware::AppError;
use crate::models::{ColumnMeta, Dialect, SchemaSnapshot, TableMeta, ViewMeta};
use crate::services::database::{Engine, RowSet};
use crate::validation::validate_identifier;

const MYSQL_SYSTEM_SCHEMAS: &[&str] = &["information_schema", "mysql", "performance_schema", "sys"];
const POSTGRES_SYSTEM_SCHEMAS: &[&str] = &["pg_catalog", "information_schema", "pg_toast"];

/// Reads tables, views and columns of a live connection.
///
/// SQLite is read through `sqlite_master` and `PRAGMA table_info`; MySQL and
/// PostgreSQL through `information_schema`, with one columns query and one
/// primary-key query per schema. Any failing query fails the whole call.
pub struct SchemaIntrospector;

impl SchemaIntrospector {
    pub async fn introspect(
        engine: &dyn Engine,
        target_schema: Option<&str>,
    ) -> Result<SchemaSnapshot, AppError> {
        let target_schema = target_schema.map(validate_identifier).transpose()?;

        let (tables, views) = match engine.dialect() {
            Dialect::Sqlite => Self::introspect_sqlite(engine).await?,
            dialect => Self::introspect_catalog(engine, dialect, target_schema).await?,
        };

        tracing::debug!(
            "Introspected {} tables and {} views ({})",
            tables.len(),
            views.len(),
            engine.dialect()
        );
        Ok(SchemaSnapshot::new(tables, views))
    }

    async fn introspect_sqlite(engine: &dyn Engine) -> Result<(Vec<TableMeta>, Vec<ViewMeta>), AppError> {
        let objects = engine
            .fetch(
                "SELECT name, type, sql FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                 ORDER BY name",
            )
            .await?;

        let mut tables = Vec::new();
        let mut views = Vec::new();
        for row in &objects.rows {
            let name = text_at(row, 0).unwrap_or_default();
            let columns = Self::sqlite_columns(engine, &name).await?;

            if text_at(row, 1).as_deref() == Some("view") {
                views.push(ViewMeta {
                    name,
                    schema: None,
                    columns,
                    definition: text_at(row, 2),
                });
            } else {
                tables.push(TableMeta {
                    name,
                    schema: None,
                    columns,
                    row_estimate: None,
                });
            }
        }

        Ok((tables, views))
    }

    async fn sqlite_columns(engine: &dyn Engine, name: &str) -> Result<Vec<ColumnMeta>, AppError> {
        let name = validate_identifier(name)?;
        let info = engine
            .fetch(&format!("PRAGMA table_info('{}')", name))
            .await?;

        // cid, name, type, notnull, dflt_value, pk
        Ok(info
            .rows
            .iter()
            .map(|row| ColumnMeta {
                name: text_at(row, 1).unwrap_or_default(),
                native_type: text_at(row, 2)
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "ANY".to_string()),
                nullable: integer_at(row, 3).unwrap_or(0) == 0,
                default_value: text_at(row, 4),
                is_primary_key: integer_at(row, 5).unwrap_or(0) > 0,
            })
            .collect())
    }

    async fn introspect_catalog(
        engine: &dyn Engine,
        dialect: Dialect,
        target_schema: Option<&str>,
    ) -> Result<(Vec<TableMeta>, Vec<ViewMeta>), AppError> {
        let queries = CatalogQueries::for_dialect(dialect);
        let filter = schema_filter(dialect, target_schema);

        let table_rows = engine.fetch(&queries.tables(&filter)).await?;
        let view_rows = engine.fetch(&queries.views(&filter)).await?;

        let schemas: BTreeSet<String> = table_rows
            .rows
            .iter()
            .chain(view_rows.rows.iter())
            .filter_map(|row| text_at(row, 0))
            .collect();

        let mut columns_by_schema: HashMap<String, SchemaColumns> = HashMap::new();
        for schema in schemas {
            let schema_name = validate_identifier(&schema)?;
            let columns = engine.fetch(&queries.columns(schema_name)).await?;
            let primary_keys = engine.fetch(&queries.primary_keys(schema_name)).await?;
            columns_by_schema.insert(schema.clone(), SchemaColumns::collect(&columns, &primary_keys));
        }

        let columns_for = |schema: &Option<String>, table: &str| -> Vec<ColumnMeta> {
            schema
                .as_ref()
                .and_then(|s| columns_by_schema.get(s))
                .and_then(|by_table| by_table.columns.get(table).cloned())
                .unwrap_or_default()
        };

        let tables = table_rows
            .rows
            .iter()
            .map(|row| {
                let schema = text_at(row, 0);
                let name = text_at(row, 1).unwrap_or_default();
                TableMeta {
                    columns: columns_for(&schema, &name),
                    row_estimate: integer_at(row, 2).filter(|estimate| *estimate >= 0),
                    name,
                    schema,
                }
            })
            .collect();

        let views = view_rows
            .rows
            .iter()
            .map(|row| {
                let schema = text_at(row, 0);
                let name = text_at(row, 1).unwrap_or_default();
                ViewMeta {
                    columns: columns_for(&schema, &name),
                    definition: text_at(row, 2).filter(|d| !d.is_empty()),
                    name,
                    schema,
                }
            })
            .collect();

        Ok((tables, views))
    }
}

/// Columns of every table in one schema, keyed by table name.
struct SchemaColumns {
    columns: HashMap<String, Vec<ColumnMeta>>,
}

impl SchemaColumns {
    /// `columns` rows: table, column, type, is_nullable, default.
    /// `primary_keys` rows: table, column.
    fn collect(columns: &RowSet, primary_keys: &RowSet) -> Self {
        let keys: HashSet<(String, String)> = primary_keys
            .rows
            .iter()
            .filter_map(|row| Some((text_at(row, 0)?, text_at(row, 1)?)))
            .collect();

        let mut by_table: HashMap<String, Vec<ColumnMeta>> = HashMap::new();
        for row in &columns.rows {
            let (Some(table), Some(column)) = (text_at(row, 0), text_at(row, 1)) else {
                continue;
            };
            let is_primary_key = keys.contains(&(table.clone(), column.clone()));
            by_table.entry(table).or_default().push(ColumnMeta {
                name: column,
                native_type: text_at(row, 2).unwrap_or_default(),
                nullable: text_at(row, 3)
                    .map(|n| n.eq_ignore_ascii_case("YES"))
                    .unwrap_or(true),
                default_value: text_at(row, 4),
                is_primary_key,
            });
        }

        Self { columns: by_table }
    }
}

struct CatalogQueries {
    dialect: Dialect,
}

impl CatalogQueries {
    fn for_dialect(dialect: Dialect) -> Self {
        Self { dialect }
    }

    fn tables(&self, filter: &str) -> String {
        match self.dialect {
            Dialect::PostgreSql => format!(
                "SELECT t.table_schema::text, t.table_name::text, c.reltuples::bigint \
                 FROM information_schema.tables t \
                 LEFT JOIN pg_catalog.pg_namespace n ON n.nspname = t.table_schema \
                 LEFT JOIN pg_catalog.pg_class c ON c.relname = t.table_name AND c.relnamespace = n.oid \
                 WHERE t.table_type = 'BASE TABLE' AND t.{} \
                 ORDER BY t.table_schema, t.table_name",
                filter
            ),
            _ => format!(
                "SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_ROWS \
                 FROM information_schema.TABLES \
                 WHERE TABLE_TYPE = 'BASE TABLE' AND {} \
                 ORDER BY TABLE_SCHEMA, TABLE_NAME",
                filter
            ),
        }
    }

    fn views(&self, filter: &str) -> String {
        match self.dialect {
            Dialect::PostgreSql => format!(
                "SELECT table_schema::text, table_name::text, view_definition::text \
                 FROM information_schema.views \
                 WHERE {} \
                 ORDER BY table_schema, table_name",
                filter
            ),
            _ => format!(
                "SELECT TABLE_SCHEMA, TABLE_NAME, VIEW_DEFINITION \
                 FROM information_schema.VIEWS \
                 WHERE {} \
                 ORDER BY TABLE_SCHEMA, TABLE_NAME",
                filter
            ),
        }
    }

    fn columns(&self, schema: &str) -> String {
        match self.dialect {
            Dialect::PostgreSql => format!(
                "SELECT table_name::text, column_name::text, data_type::text, is_nullable::text, column_default::text \
                 FROM information_schema.columns \
                 WHERE table_schema = '{}' \
                 ORDER BY table_name, ordinal_position",
                schema
            ),
            _ => format!(
                "SELECT TABLE_NAME, COLUMN_NAME, DATA_TYPE, IS_NULLABLE, COLUMN_DEFAULT \
                 FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = '{}' \
                 ORDER BY TABLE_NAME, ORDINAL_POSITION",
                schema
            ),
        }
    }

    fn primary_keys(&self, schema: &str) -> String {
        match self.dialect {
            Dialect::PostgreSql => format!(
                "SELECT kcu.table_name::text, kcu.column_name::text \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                 ON tc.constraint_name = kcu.constraint_name \
                 AND tc.table_schema = kcu.table_schema \
                 AND tc.table_name = kcu.table_name \
                 WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = '{}'",
                schema
            ),
            _ => format!(
                "SELECT TABLE_NAME, COLUMN_NAME \
                 FROM information_schema.KEY_COLUMN_USAGE \
                 WHERE CONSTRAINT_NAME = 'PRIMARY' AND TABLE_SCHEMA = '{}'",
                schema
            ),
        }
    }
}

/// Schema predicate: equality on a validated target, otherwise exclusion of
/// the dialect's system schemas.
fn schema_filter(dialect: Dialect, target_schema: Option<&str>) -> String {
    let column = match dialect {
        Dialect::PostgreSql => "table_schema",
        _ => "TABLE_SCHEMA",
    };

    match target_schema {
        Some(schema) => format!("{} = '{}'", column, schema),
        None => {
            let excluded = match dialect {
                Dialect::PostgreSql => POSTGRES_SYSTEM_SCHEMAS,
                _ => MYSQL_SYSTEM_SCHEMAS,
            };
            let list = excluded
                .iter()
                .map(|s| format!("'{}'", s))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{} NOT IN ({})", column, list)
        }
    }
}

fn text_at(row: &[Value], idx: usize) -> Option<String> {
    match row.get(idx)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn integer_at(row: &[Value], idx: usize) -> Option<i64> {
    match row.get(idx)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}
