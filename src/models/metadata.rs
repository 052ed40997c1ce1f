use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Captured schema of one connection. Replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableMeta>,
    pub views: Vec<ViewMeta>,
    pub fetched_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<TableMeta>, views: Vec<ViewMeta>) -> Self {
        Self {
            tables,
            views,
            fetched_at: Utc::now(),
        }
    }

    pub fn is_fresh(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.fetched_at) < ttl
    }
}

/// Serialized body stored next to the connection row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBody {
    pub tables: Vec<TableMeta>,
    pub views: Vec<ViewMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub schema: Option<String>,
    pub columns: Vec<ColumnMeta>,
    pub row_estimate: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewMeta {
    pub name: String,
    pub schema: Option<String>,
    pub columns: Vec<ColumnMeta>,
    pub definition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub native_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub is_primary_key: bool,
}

#[derive(Debug, Deserialize)]
pub struct MetadataParams {
    #[serde(default)]
    pub refresh: bool,
}
