//! PostgreSQL Backend Implementation
//!
//! Implements the backend traits on top of sqlx. Parameterized statements go
//! through prepared queries; migration scripts are sent unprepared so that a
//! file may contain several statements.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{Column, Connection, Executor, Pool, Postgres, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::core::*;
use crate::error::{MigrateError, MigrateResult};
use tidemark_core::DatabaseConfig;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

/// Build connection options from explicit parameters, so credentials never
/// pass through a URL string.
pub fn connect_options(config: &DatabaseConfig) -> MigrateResult<PgConnectOptions> {
    let port = config
        .port_number()
        .map_err(|e| MigrateError::Connection(e.to_string()))?;

    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(port)
        .username(&config.username)
        .database(&config.database)
        .application_name("tidemark");

    if !config.password.is_empty() {
        options = options.password(&config.password);
    }
    Ok(options)
}

/// PostgreSQL connection pool implementation
#[derive(Debug, Clone)]
pub struct PostgresPool {
    pool: Pool<Postgres>,
}

impl PostgresPool {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Open a pool with the given options. The first connection is
    /// established eagerly so that connection errors surface here.
    pub async fn connect(
        options: PgConnectOptions,
        config: &DatabasePoolConfig,
    ) -> MigrateResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| {
                MigrateError::Connection(format!("Failed to create PostgreSQL pool: {}", e))
            })?;

        Ok(Self::new(pool))
    }

    /// Open a pool from a `postgres://` URL
    pub async fn connect_url(url: &str, config: &DatabasePoolConfig) -> MigrateResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| MigrateError::Connection(format!("Invalid database URL: {}", e)))?;
        Self::connect(options, config).await
    }

    /// Access the underlying sqlx pool
    pub fn inner(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    async fn acquire(&self) -> MigrateResult<Box<dyn DatabaseConnection>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| MigrateError::Connection(format!("Failed to acquire connection: {}", e)))?;

        Ok(Box::new(PostgresConnection::new(conn)))
    }

    async fn health_check(&self) -> MigrateResult<Duration> {
        let start = Instant::now();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| MigrateError::Connection(format!("Health check failed: {}", e)))?;

        Ok(start.elapsed())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// PostgreSQL connection implementation
pub struct PostgresConnection {
    conn: PoolConnection<Postgres>,
}

impl PostgresConnection {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DatabaseExecutor for PostgresConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64> {
        let result = bind_all(sqlx::query(sql), params).execute(&mut *self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrateResult<Option<DatabaseRow>> {
        let row = bind_all(sqlx::query(sql), params)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrateResult<Vec<DatabaseRow>> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&mut *self.conn)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute_script(&mut self, sql: &str) -> MigrateResult<()> {
        (&mut *self.conn).execute(sql).await?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseConnection for PostgresConnection {
    async fn begin<'c>(&'c mut self) -> MigrateResult<Box<dyn DatabaseTransaction + 'c>> {
        let tx = (*self.conn)
            .begin()
            .await
            .map_err(|e| MigrateError::Transaction(format!("Failed to begin transaction: {}", e)))?;

        Ok(Box::new(PostgresTransaction::new(tx)))
    }

    async fn close(self: Box<Self>) -> MigrateResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| MigrateError::Connection(format!("Failed to close connection: {}", e)))
    }
}

/// PostgreSQL transaction implementation
pub struct PostgresTransaction<'c> {
    tx: sqlx::Transaction<'c, Postgres>,
}

impl<'c> PostgresTransaction<'c> {
    pub fn new(tx: sqlx::Transaction<'c, Postgres>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl<'c> DatabaseExecutor for PostgresTransaction<'c> {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64> {
        let result = bind_all(sqlx::query(sql), params).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrateResult<Option<DatabaseRow>> {
        let row = bind_all(sqlx::query(sql), params)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrateResult<Vec<DatabaseRow>> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute_script(&mut self, sql: &str) -> MigrateResult<()> {
        (&mut *self.tx).execute(sql).await?;
        Ok(())
    }
}

#[async_trait]
impl<'c> DatabaseTransaction for PostgresTransaction<'c> {
    async fn commit(self: Box<Self>) -> MigrateResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| MigrateError::Transaction(format!("Transaction commit failed: {}", e)))
    }

    async fn rollback(self: Box<Self>) -> MigrateResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| MigrateError::Transaction(format!("Transaction rollback failed: {}", e)))
    }
}

fn bind_all<'q>(mut query: PgQuery<'q>, params: &[DatabaseValue]) -> PgQuery<'q> {
    for param in params {
        query = bind_database_value(query, param);
    }
    query
}

/// Bind a DatabaseValue to a sqlx query. Timestamps are bound as UTC
/// `TIMESTAMP` (without time zone), matching the ledger column.
fn bind_database_value<'q>(query: PgQuery<'q>, value: &DatabaseValue) -> PgQuery<'q> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::DateTime(dt) => query.bind(dt.naive_utc()),
    }
}

fn decode_row(row: &PgRow) -> MigrateResult<DatabaseRow> {
    let columns = row
        .columns()
        .iter()
        .map(|column| {
            let value = postgres_value_to_database_value(row, column.ordinal())?;
            Ok((column.name().to_string(), value))
        })
        .collect::<MigrateResult<Vec<_>>>()?;

    Ok(DatabaseRow::new(columns))
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> MigrateResult<DatabaseValue> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" => DatabaseValue::Bool(row.try_get(index)?),
        "INT2" => DatabaseValue::Int64(i64::from(row.try_get::<i16, _>(index)?)),
        "INT4" => DatabaseValue::Int64(i64::from(row.try_get::<i32, _>(index)?)),
        "INT8" => DatabaseValue::Int64(row.try_get(index)?),
        "TIMESTAMP" => {
            let naive: chrono::NaiveDateTime = row.try_get(index)?;
            DatabaseValue::DateTime(naive.and_utc())
        }
        "TIMESTAMPTZ" => DatabaseValue::DateTime(row.try_get(index)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => DatabaseValue::String(row.try_get(index)?),
        other => {
            return Err(MigrateError::database(format!(
                "Unsupported column type '{}' at index {}",
                other, index
            )))
        }
    };
    Ok(value)
}
