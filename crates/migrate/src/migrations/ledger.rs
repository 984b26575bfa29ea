//! Migration Ledger - the in-database record of applied migrations
//!
//! The ledger is a two-column table `(id TEXT PRIMARY KEY, created_at
//! TIMESTAMP)`. Its name comes from configuration and cannot be bound as a
//! parameter, so [`LedgerTable`] validates and quotes it once; every
//! statement is built from the quoted form and all data values are bound.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::definitions::LedgerEntry;
use crate::backends::{DatabaseExecutor, DatabaseValue};
use crate::error::{MigrateError, MigrateResult, UNIQUE_VIOLATION};
use crate::security::quote_table_name;

/// A validated ledger table name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTable {
    name: String,
    schema: Option<String>,
    table: String,
    quoted: String,
}

impl LedgerTable {
    /// Validate `name` (optionally `schema.table`). Nothing is sent to the
    /// database for an invalid name.
    pub fn new(name: &str) -> MigrateResult<Self> {
        let quoted = quote_table_name(name)?;
        let (schema, table) = match name.split_once('.') {
            Some((schema, table)) => (Some(schema.to_string()), table.to_string()),
            None => (None, name.to_string()),
        };

        Ok(Self {
            name: name.to_string(),
            schema,
            table,
            quoted,
        })
    }

    /// Name as configured
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema qualifier, if the name carried one
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Unqualified table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name ready to embed in statement text
    pub fn quoted(&self) -> &str {
        &self.quoted
    }
}

/// Ledger operations. Each takes the executor to run on, so the same ledger
/// serves the ambient connection and a migration's transaction.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: LedgerTable,
}

impl Ledger {
    pub fn new(table: LedgerTable) -> Self {
        Self { table }
    }

    /// Validate `name` and build a ledger for it
    pub fn for_table(name: &str) -> MigrateResult<Self> {
        Ok(Self::new(LedgerTable::new(name)?))
    }

    pub fn table(&self) -> &LedgerTable {
        &self.table
    }

    /// Create the ledger table if it does not exist
    pub async fn ensure_schema<E>(&self, db: &mut E) -> MigrateResult<()>
    where
        E: DatabaseExecutor + ?Sized,
    {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, created_at TIMESTAMP NOT NULL)",
            self.table.quoted()
        );
        db.execute(&sql, &[]).await?;
        Ok(())
    }

    /// Whether the ledger table exists, without creating it
    pub async fn exists<E>(&self, db: &mut E) -> MigrateResult<bool>
    where
        E: DatabaseExecutor + ?Sized,
    {
        let sql = "SELECT 1 FROM information_schema.tables \
                   WHERE table_schema = COALESCE($1, current_schema()) AND table_name = $2";
        let params = [
            DatabaseValue::from(self.table.schema()),
            DatabaseValue::from(self.table.table()),
        ];
        Ok(db.fetch_optional(sql, &params).await?.is_some())
    }

    pub async fn is_applied<E>(&self, db: &mut E, id: &str) -> MigrateResult<bool>
    where
        E: DatabaseExecutor + ?Sized,
    {
        let sql = format!("SELECT id FROM {} WHERE id = $1", self.table.quoted());
        let row = db.fetch_optional(&sql, &[DatabaseValue::from(id)]).await?;
        Ok(row.is_some())
    }

    /// Insert a row for `id`. An existing row is never overwritten: the
    /// unique violation surfaces as [`MigrateError::Conflict`].
    pub async fn record_applied<E>(
        &self,
        db: &mut E,
        id: &str,
        applied_at: DateTime<Utc>,
    ) -> MigrateResult<()>
    where
        E: DatabaseExecutor + ?Sized,
    {
        let sql = format!(
            "INSERT INTO {} (id, created_at) VALUES ($1, $2)",
            self.table.quoted()
        );
        let params = [DatabaseValue::from(id), DatabaseValue::from(applied_at)];

        match db.execute(&sql, &params).await {
            Ok(_) => {
                debug!(target: "tidemark::migrate", id, "Recorded migration in ledger");
                Ok(())
            }
            Err(err) if err.sql_state() == Some(UNIQUE_VIOLATION) => {
                Err(MigrateError::Conflict { id: id.to_string() })
            }
            Err(err) => Err(err),
        }
    }

    /// Delete the row for `id`; reports whether a row was removed
    pub async fn record_reverted<E>(&self, db: &mut E, id: &str) -> MigrateResult<bool>
    where
        E: DatabaseExecutor + ?Sized,
    {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table.quoted());
        let removed = db.execute(&sql, &[DatabaseValue::from(id)]).await?;
        Ok(removed > 0)
    }

    /// Id with the latest `created_at`; equal timestamps resolve to the
    /// greater id, the one applied later in id order.
    pub async fn most_recent_applied<E>(&self, db: &mut E) -> MigrateResult<Option<String>>
    where
        E: DatabaseExecutor + ?Sized,
    {
        let sql = format!(
            "SELECT id FROM {} ORDER BY created_at DESC, id DESC LIMIT 1",
            self.table.quoted()
        );
        match db.fetch_optional(&sql, &[]).await? {
            Some(row) => Ok(Some(row.get_string("id")?)),
            None => Ok(None),
        }
    }

    /// All rows, oldest first
    pub async fn entries<E>(&self, db: &mut E) -> MigrateResult<Vec<LedgerEntry>>
    where
        E: DatabaseExecutor + ?Sized,
    {
        let sql = format!(
            "SELECT id, created_at FROM {} ORDER BY created_at, id",
            self.table.quoted()
        );
        db.fetch_all(&sql, &[])
            .await?
            .into_iter()
            .map(|row| {
                Ok(LedgerEntry {
                    id: row.get_string("id")?,
                    applied_at: row.get_datetime("created_at")?,
                })
            })
            .collect()
    }
}
