//! # tidemark-core
//!
//! Configuration and logging foundation shared by the tidemark crates.
//! Nothing in here talks to a database.

pub mod config;
pub mod logging;

pub use config::{
    Config, ConfigError, ConnectionConfig, DatabaseConfig, LogFormat, LoggingSection,
    MigrateConfig,
};
pub use logging::{init_logging, LoggingConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tool name used in log fields and CLI output
pub const TOOL_NAME: &str = "tidemark";
