pub mod api;
pub mod config;
mod error;
mod qr;

pub use api::{AppState, build_app};
pub use config::{Config, ConfigError};
pub use error::{ApiError, ApiResult};
