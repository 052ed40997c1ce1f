pub mod sqlite;

pub use sqlite::{format_timestamp, parse_timestamp, SqliteStorage, StoredSnapshot};
