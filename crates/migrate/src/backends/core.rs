//! Core Database Backend Traits
//!
//! The migration engine talks to the database only through these traits.
//! A run acquires one [`DatabaseConnection`], opens one
//! [`DatabaseTransaction`] per migration step on it, and never holds a
//! transaction across steps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::{MigrateError, MigrateResult};

/// Statement execution shared by connections and transactions
#[async_trait]
pub trait DatabaseExecutor: Send {
    /// Execute a parameterized statement and return the affected row count
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64>;

    /// Execute a parameterized query and return the first row, if any
    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrateResult<Option<DatabaseRow>>;

    /// Execute a parameterized query and return all rows
    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrateResult<Vec<DatabaseRow>>;

    /// Execute script text verbatim, without preparing it. Scripts may hold
    /// several statements.
    async fn execute_script(&mut self, sql: &str) -> MigrateResult<()>;
}

/// Abstract database transaction. Dropping it without calling
/// [`commit`](DatabaseTransaction::commit) aborts it.
#[async_trait]
pub trait DatabaseTransaction: DatabaseExecutor {
    /// Commit the transaction
    async fn commit(self: Box<Self>) -> MigrateResult<()>;

    /// Roll back the transaction
    async fn rollback(self: Box<Self>) -> MigrateResult<()>;
}

/// Abstract database connection (a single server session)
#[async_trait]
pub trait DatabaseConnection: DatabaseExecutor {
    /// Begin a transaction on this connection
    async fn begin<'c>(&'c mut self) -> MigrateResult<Box<dyn DatabaseTransaction + 'c>>;

    /// Close the session instead of returning it to the pool
    async fn close(self: Box<Self>) -> MigrateResult<()>;
}

/// Abstract database connection pool
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Acquire a connection from the pool
    async fn acquire(&self) -> MigrateResult<Box<dyn DatabaseConnection>>;

    /// Round-trip a trivial query and report how long it took
    async fn health_check(&self) -> MigrateResult<Duration>;

    /// Close the pool
    async fn close(&self);
}

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct DatabasePoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DatabasePoolConfig {
    fn default() -> Self {
        Self {
            // One connection carries the run and its advisory lock; the
            // second keeps health checks from queueing behind it.
            max_connections: 2,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Bound parameter and column value
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int64(i64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            DatabaseValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(value: DateTime<Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// A result row with named columns, decoded eagerly by the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseRow {
    columns: Vec<(String, DatabaseValue)>,
}

impl DatabaseRow {
    pub fn new(columns: Vec<(String, DatabaseValue)>) -> Self {
        Self { columns }
    }

    /// Get a column value by index
    pub fn get_by_index(&self, index: usize) -> MigrateResult<&DatabaseValue> {
        self.columns
            .get(index)
            .map(|(_, value)| value)
            .ok_or_else(|| MigrateError::database(format!("Column index {} out of range", index)))
    }

    /// Get a column value by name
    pub fn get_by_name(&self, name: &str) -> MigrateResult<&DatabaseValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
            .ok_or_else(|| MigrateError::database(format!("Column '{}' not found", name)))
    }

    /// Get a non-null text column
    pub fn get_string(&self, name: &str) -> MigrateResult<String> {
        self.get_by_name(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MigrateError::database(format!("Column '{}' is not text", name)))
    }

    /// Get a non-null timestamp column
    pub fn get_datetime(&self, name: &str) -> MigrateResult<DateTime<Utc>> {
        self.get_by_name(name)?
            .as_datetime()
            .ok_or_else(|| MigrateError::database(format!("Column '{}' is not a timestamp", name)))
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }
}
