use crate::config::validation::{
    ConfigError, ConfigValidator, MinValidator, PortValidator, RequiredValidator,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables that override values from the configuration file
pub const ENV_DB_USERNAME: &str = "TIDEMARK_DB_USERNAME";
pub const ENV_DB_PASSWORD: &str = "TIDEMARK_DB_PASSWORD";
pub const ENV_DB_HOST: &str = "TIDEMARK_DB_HOST";
pub const ENV_DB_PORT: &str = "TIDEMARK_DB_PORT";
pub const ENV_DB_NAME: &str = "TIDEMARK_DB_NAME";
pub const ENV_MIGRATE_DIR: &str = "TIDEMARK_MIGRATE_DIR";
pub const ENV_MIGRATE_TABLE: &str = "TIDEMARK_MIGRATE_TABLE";

/// Complete tool configuration, loaded once at startup and passed down explicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub migrate: MigrateConfig,
    pub connection: ConnectionConfig,
    pub logging: LoggingSection,
}

/// Database connection parameters
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub username: String,
    pub password: String,
    pub host: String,
    /// Kept textual to match the file layout; both `port = 5432` and
    /// `port = "5432"` are accepted.
    #[serde(deserialize_with = "deserialize_port")]
    pub port: String,
    pub database: String,
}

/// Where migration files live and which table records them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    pub dir: PathBuf,
    #[serde(rename = "tablename")]
    pub table_name: String,
}

/// Connection establishment policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub connect_timeout_secs: u64,
}

/// Log output settings read from the `[logging]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml_str(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `TIDEMARK_*` environment variables on top of the loaded values
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Environment values win
    /// over file values; blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get(ENV_DB_USERNAME) {
            self.database.username = value;
        }
        if let Some(value) = get(ENV_DB_PASSWORD) {
            self.database.password = value;
        }
        if let Some(value) = get(ENV_DB_HOST) {
            self.database.host = value;
        }
        if let Some(value) = get(ENV_DB_PORT) {
            self.database.port = value;
        }
        if let Some(value) = get(ENV_DB_NAME) {
            self.database.database = value;
        }
        if let Some(value) = get(ENV_MIGRATE_DIR) {
            self.migrate.dir = PathBuf::from(value);
        }
        if let Some(value) = get(ENV_MIGRATE_TABLE) {
            self.migrate.table_name = value;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        RequiredValidator::new("database.host", "Set [database].host or TIDEMARK_DB_HOST")
            .validate(self.database.host.as_str())?;
        RequiredValidator::new(
            "database.username",
            "Set [database].username or TIDEMARK_DB_USERNAME",
        )
        .validate(self.database.username.as_str())?;
        RequiredValidator::new(
            "database.database",
            "Set [database].database or TIDEMARK_DB_NAME",
        )
        .validate(self.database.database.as_str())?;
        PortValidator::new("database.port").validate(self.database.port.as_str())?;

        RequiredValidator::new("migrate.dir", "Set [migrate].dir or TIDEMARK_MIGRATE_DIR")
            .validate(self.migrate.dir.to_string_lossy().as_ref())?;
        RequiredValidator::new(
            "migrate.tablename",
            "Set [migrate].tablename or TIDEMARK_MIGRATE_TABLE",
        )
        .validate(self.migrate.table_name.as_str())?;

        MinValidator {
            field: "connection.max_attempts",
            min: 1,
        }
        .validate(&u64::from(self.connection.max_attempts))?;
        MinValidator {
            field: "connection.connect_timeout_secs",
            min: 1,
        }
        .validate(&self.connection.connect_timeout_secs)?;

        Ok(())
    }
}

impl DatabaseConfig {
    /// Parsed port number
    pub fn port_number(&self) -> Result<u16, ConfigError> {
        PortValidator::new("database.port").validate(self.port.as_str())?;
        self.port
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid_value("database.port", &self.port, "a port number"))
    }

    /// `host:port/database`, safe to log
    pub fn display_target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port.trim(), self.database)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            host: "localhost".to_string(),
            port: "5432".to_string(),
            database: String::new(),
        }
    }
}

// Hand-written so the password never reaches a log line.
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("migrations"),
            table_name: "schema_migrations".to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_secs: 5,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "plain" => Ok(LogFormat::Text),
            _ => Err(ConfigError::invalid_value("logging.format", s, "json or text")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Text => write!(f, "text"),
        }
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u64),
        Text(String),
    }

    Ok(match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => n.to_string(),
        PortValue::Text(s) => s,
    })
}
