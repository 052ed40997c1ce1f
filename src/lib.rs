pub mod api;
pub mod app;
pub mod config;
pub mod models;
pub mod services;
pub mod storage;
pub mod validation;

pub use app::AppServices;
pub use models::*;
pub use services::*;
pub use validation::*;
