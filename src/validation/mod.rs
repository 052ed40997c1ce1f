pub mod identifier;
pub mod sql_validator;

pub use identifier::validate_identifier;
pub use sql_validator::{LimitInfo, SqlValidator, DEFAULT_LIMIT};
