pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod ventures_client;

pub use config::Config;
pub use errors::{ApiError, Result};
pub use handlers::AppState;
