//! Core types, configuration, and utilities for the auth sync extension.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    BackoffConfig, Config, TimingConfig, DEFAULT_AUTH_SITE_URL, DEFAULT_BACKEND_URL,
    DEFAULT_LANDING_ROUTE, DEFAULT_LOG_LEVEL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
