//! Shared service plumbing for the gateway services
//!
//! Provides basic functions shared by all services, including:
//! - logging initialization with runtime level reload
//! - layered configuration loading (file + environment)
//! - graceful shutdown signal handling

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::{load_config_from_file, ConfigLoadError};
pub use logging::{LogConfig, LogFormat, LogInitError};
