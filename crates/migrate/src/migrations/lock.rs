//! Run Lock - serializes migration runs against one ledger
//!
//! A PostgreSQL session-level advisory lock keyed by the ledger relation.
//! The key is the schema-qualified name with the schema resolved on the
//! server, so `schema_migrations` and `public.schema_migrations` contend for
//! the same lock. It belongs to the connection that took it, so the run must
//! keep using that connection until [`RunLock::release`].

use tracing::{debug, warn};

use super::ledger::LedgerTable;
use crate::backends::{DatabaseExecutor, DatabaseValue};
use crate::error::{MigrateError, MigrateResult};

const ACQUIRE_SQL: &str =
    "SELECT pg_advisory_lock(hashtext(COALESCE($1, current_schema()) || '.' || $2))";
const RELEASE_SQL: &str =
    "SELECT pg_advisory_unlock(hashtext(COALESCE($1, current_schema()) || '.' || $2)) AS released";

/// Advisory lock guarding one ledger table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLock {
    name: String,
    schema: Option<String>,
    table: String,
}

impl RunLock {
    pub fn new(table: &LedgerTable) -> Self {
        Self {
            name: table.name().to_string(),
            schema: table.schema().map(str::to_string),
            table: table.table().to_string(),
        }
    }

    fn params(&self) -> [DatabaseValue; 2] {
        [
            DatabaseValue::from(self.schema.as_deref()),
            DatabaseValue::from(self.table.as_str()),
        ]
    }

    /// Block until the lock is held by this session
    pub async fn acquire<E>(&self, conn: &mut E) -> MigrateResult<()>
    where
        E: DatabaseExecutor + ?Sized,
    {
        debug!(target: "tidemark::migrate", ledger = %self.name, "Waiting for run lock");
        conn.execute(ACQUIRE_SQL, &self.params()).await.map_err(|e| {
            MigrateError::Lock(format!("Failed to acquire run lock for '{}': {}", self.name, e))
        })?;

        debug!(target: "tidemark::migrate", ledger = %self.name, "Run lock acquired");
        Ok(())
    }

    /// Release the lock. Releasing a lock this session does not hold is
    /// reported but is not an error.
    pub async fn release<E>(&self, conn: &mut E) -> MigrateResult<()>
    where
        E: DatabaseExecutor + ?Sized,
    {
        let row = conn.fetch_optional(RELEASE_SQL, &self.params()).await.map_err(|e| {
            MigrateError::Lock(format!("Failed to release run lock for '{}': {}", self.name, e))
        })?;

        let released = matches!(
            row.as_ref().map(|row| row.get_by_name("released")).transpose()?,
            Some(DatabaseValue::Bool(true))
        );
        if released {
            debug!(target: "tidemark::migrate", ledger = %self.name, "Run lock released");
        } else {
            warn!(
                target: "tidemark::migrate",
                ledger = %self.name,
                "Run lock was not held by this session"
            );
        }
        Ok(())
    }
}
