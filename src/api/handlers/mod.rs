pub mod connection;
pub mod history;
pub mod metadata;
pub mod query;
