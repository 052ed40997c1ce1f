pub mod connection_pool;
pub mod database; // Native engines for mysql, postgresql and sqlite
pub mod introspection;
pub mod llm_service;
pub mod metadata_cache;
pub mod query_service;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use connection_pool::*;
pub use introspection::*;
pub use llm_service::*;
pub use metadata_cache::*;
pub use query_service::*;
pub use registry::*;
