pub mod connection;
pub mod connection_string;
pub mod metadata;
pub mod query;

pub use connection::*;
pub use connection_string::{
    detect_dialect, redact_url, scrub_credentials, with_native_driver_suffix,
    ConnectionStringParts, DriverUrl,
};
pub use metadata::*;
pub use query::*;
