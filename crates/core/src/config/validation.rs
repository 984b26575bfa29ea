use std::path::PathBuf;
use thiserror::Error;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    /// Create a missing required field error
    pub fn missing_required(field: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
            hint: hint.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }
}

/// Trait for validating configuration values
pub trait ConfigValidator<T: ?Sized> {
    /// Validate a configuration value
    fn validate(&self, value: &T) -> Result<(), ConfigError>;
}

/// Port number validator. Accepts the textual form used by the config file.
pub struct PortValidator {
    pub field: &'static str,
    pub min: u16,
    pub max: u16,
}

impl PortValidator {
    pub fn new(field: &'static str) -> Self {
        Self {
            field,
            min: 1,
            max: u16::MAX,
        }
    }
}

impl ConfigValidator<str> for PortValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        let expected = || format!("port between {} and {}", self.min, self.max);
        let port: u16 = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid_value(self.field, value, expected()))?;

        if port < self.min || port > self.max {
            return Err(ConfigError::invalid_value(self.field, value, expected()));
        }
        Ok(())
    }
}

/// Required (non-blank) string validator
pub struct RequiredValidator {
    pub field: &'static str,
    pub hint: &'static str,
}

impl RequiredValidator {
    pub fn new(field: &'static str, hint: &'static str) -> Self {
        Self { field, hint }
    }
}

impl ConfigValidator<str> for RequiredValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::missing_required(self.field, self.hint));
        }
        Ok(())
    }
}

/// Inclusive lower bound for counters such as retry attempts
pub struct MinValidator {
    pub field: &'static str,
    pub min: u64,
}

impl ConfigValidator<u64> for MinValidator {
    fn validate(&self, value: &u64) -> Result<(), ConfigError> {
        if *value < self.min {
            return Err(ConfigError::invalid_value(
                self.field,
                value.to_string(),
                format!("a value of at least {}", self.min),
            ));
        }
        Ok(())
    }
}
