//! Error types for the migration engine
//!
//! Load-time problems are reported through [`LoadError`] before any
//! connection is attempted; everything that happens against the database is a
//! [`MigrateError`].

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::migrations::definitions::MigrationDirection;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// SQLSTATE reported by PostgreSQL for a unique constraint violation
pub const UNIQUE_VIOLATION: &str = "23505";

/// Which half of a migration file a section error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Apply,
    Revert,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Section::Apply => write!(f, "apply"),
            Section::Revert => write!(f, "revert"),
        }
    }
}

/// Errors raised while reading migration definitions from disk
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read migrations directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read migration file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration file name is not valid UTF-8: {path}")]
    InvalidFileName { path: PathBuf },

    #[error("Duplicate migration id '{id}' ({first} and {second})")]
    DuplicateId {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Migration {path} must contain the {marker} separator exactly once (found {found})")]
    MissingSeparator {
        path: PathBuf,
        marker: &'static str,
        found: usize,
    },

    #[error("Migration {path} has an empty {section} section")]
    EmptySection { path: PathBuf, section: Section },
}

/// Errors raised while talking to the database
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration {id} failed during {direction}: {cause}")]
    Migration {
        id: String,
        direction: MigrationDirection,
        #[source]
        cause: Box<MigrateError>,
    },

    #[error("Ledger already records migration '{id}'")]
    Conflict { id: String },

    #[error("Ledger has no row for migration '{id}'")]
    LedgerMissing { id: String },

    #[error("No migration file defines applied migration '{0}'")]
    DefinitionNotFound(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Database error: {message}")]
    Database {
        message: String,
        code: Option<String>,
    },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a database error without a SQLSTATE
    pub fn database(message: impl Into<String>) -> Self {
        MigrateError::Database {
            message: message.into(),
            code: None,
        }
    }

    /// Attribute this error to a migration step. Cancellation stays
    /// `Cancelled` so callers can tell an interrupted run from a failed one.
    pub fn in_migration(self, id: impl Into<String>, direction: MigrationDirection) -> Self {
        match self {
            MigrateError::Cancelled => MigrateError::Cancelled,
            cause => MigrateError::Migration {
                id: id.into(),
                direction,
                cause: Box::new(cause),
            },
        }
    }

    /// Id of the migration that failed, if the error is tied to one
    pub fn failed_id(&self) -> Option<&str> {
        match self {
            MigrateError::Migration { id, .. } => Some(id),
            MigrateError::Conflict { id } | MigrateError::LedgerMissing { id } => Some(id),
            MigrateError::DefinitionNotFound(id) => Some(id),
            _ => None,
        }
    }

    /// SQLSTATE of the underlying database error, looking through
    /// migration wrappers
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            MigrateError::Database { code, .. } => code.as_deref(),
            MigrateError::Migration { cause, .. } => cause.sql_state(),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            MigrateError::Conflict { .. } => true,
            MigrateError::Migration { cause, .. } => cause.is_conflict(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MigrateError::Cancelled)
    }
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => {
                MigrateError::Connection(err.to_string())
            }
            sqlx::Error::Database(ref db_err) => MigrateError::Database {
                message: db_err.message().to_string(),
                code: db_err.code().map(|code| code.into_owned()),
            },
            other => MigrateError::database(other.to_string()),
        }
    }
}
