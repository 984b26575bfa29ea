//! # Structured Logging
//!
//! Subscriber setup for the tidemark binary. Library code only emits
//! `tracing` events; installing a subscriber is left to the entry point.

use crate::config::{LogFormat, LoggingSection};
use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn")
    pub level: String,
    /// Enable JSON structured logging (vs plain text)
    pub json_format: bool,
    /// Include file and line number information
    pub include_location: bool,
    /// Environment filter (supports directives like "tidemark=debug,sqlx=warn")
    pub env_filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::production()
    }
}

impl LoggingConfig {
    /// JSON lines on stdout with caller location, info level
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
            include_location: true,
            env_filter: Some("info,sqlx=warn".to_string()),
        }
    }

    /// Human readable output for local work
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
            include_location: true,
            env_filter: Some("debug,sqlx=info".to_string()),
        }
    }

    /// Minimal output for tests
    pub fn test() -> Self {
        Self {
            level: "error".to_string(),
            json_format: false,
            include_location: false,
            env_filter: None,
        }
    }

    /// Build from the `[logging]` section of the config file
    pub fn from_section(section: &LoggingSection) -> Self {
        let base = match section.format {
            LogFormat::Json => Self::production(),
            LogFormat::Text => Self::development(),
        };
        Self {
            level: section.level.clone(),
            env_filter: Some(format!("{},sqlx=warn", section.level)),
            ..base
        }
    }

    /// Override the output format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.json_format = format == LogFormat::Json;
        self
    }

    /// Set environment filter
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    fn filter_directive(&self) -> &str {
        self.env_filter.as_deref().unwrap_or(&self.level)
    }
}

/// Initialize structured logging for the process. `RUST_LOG` takes
/// precedence over the configured filter.
pub fn init_logging(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directive()))?;

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                Layer::new()
                    .with_writer(io::stdout)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .json(),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                Layer::new()
                    .with_writer(io::stdout)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()?;
    }

    let format = if config.json_format { "json" } else { "text" };
    tracing::debug!(
        target: "tidemark::logging",
        level = %config.level,
        format,
        "Structured logging initialized"
    );

    Ok(())
}
