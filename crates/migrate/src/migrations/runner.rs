//! Migration Runner - Executes migrations against the database
//!
//! A run takes one connection from the pool, holds the [`RunLock`] on it, and
//! applies each pending migration in its own transaction: apply script first,
//! then the ledger row, committed together or not at all.

use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::definitions::{
    MigrationDefinition, MigrationDirection, MigrationRunResult, MigrationSet, MigrationStatus,
};
use super::ledger::Ledger;
use super::lock::RunLock;
use crate::backends::{DatabaseConnection, DatabasePool, DatabaseTransaction};
use crate::cancel::cancellable;
use crate::error::{MigrateError, MigrateResult};

/// Longest wait for a session to close once its run has ended
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Applies and reverts a fixed set of definitions against one ledger.
///
/// The migrator owns the definitions and borrows the pool; every database
/// await races the caller's cancellation token.
pub struct Migrator<'a> {
    pub(super) definitions: MigrationSet,
    pub(super) pool: &'a dyn DatabasePool,
    pub(super) ledger: Ledger,
    pub(super) lock: RunLock,
}

impl<'a> Migrator<'a> {
    /// Create a migrator. The ledger table name is validated here, before
    /// any statement is issued.
    pub fn new(
        definitions: MigrationSet,
        pool: &'a dyn DatabasePool,
        table_name: &str,
    ) -> MigrateResult<Self> {
        let ledger = Ledger::for_table(table_name)?;
        let lock = RunLock::new(ledger.table());
        Ok(Self {
            definitions,
            pool,
            ledger,
            lock,
        })
    }

    pub fn definitions(&self) -> &MigrationSet {
        &self.definitions
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Apply every pending migration in id order, stopping at the first
    /// failure. Migrations committed before the failure stay applied.
    pub async fn migrate(&self, cancel: &CancellationToken) -> MigrateResult<MigrationRunResult> {
        let start = Instant::now();
        let mut conn = cancellable(cancel, self.pool.acquire()).await?;

        let outcome = self.apply_pending(&mut *conn, cancel).await;
        self.end_run(conn, outcome.as_ref().err(), cancel).await;

        let mut result = outcome?;
        result.elapsed = start.elapsed();
        info!(
            target: "tidemark::migrate",
            applied = result.applied_count(),
            skipped = result.skipped_count(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Migrations complete"
        );
        Ok(result)
    }

    async fn apply_pending(
        &self,
        conn: &mut dyn DatabaseConnection,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationRunResult> {
        cancellable(cancel, self.lock.acquire(&mut *conn)).await?;

        let table = self.ledger.table().name();
        info!(target: "tidemark::migrate", table, "Creating/checking ledger table");
        cancellable(cancel, self.ledger.ensure_schema(&mut *conn)).await?;

        let mut result = MigrationRunResult::default();
        for definition in &self.definitions {
            let id = definition.id();
            if cancellable(cancel, self.ledger.is_applied(&mut *conn, id)).await? {
                debug!(target: "tidemark::migrate", id, "Skipping migration");
                result.skipped.push(id.to_string());
                continue;
            }

            info!(target: "tidemark::migrate", id, "Running migration");
            self.apply_one(&mut *conn, definition, cancel)
                .await
                .map_err(|e| e.in_migration(id, MigrationDirection::Up))?;
            result.applied.push(id.to_string());
        }

        Ok(result)
    }

    async fn apply_one(
        &self,
        conn: &mut dyn DatabaseConnection,
        definition: &MigrationDefinition,
        cancel: &CancellationToken,
    ) -> MigrateResult<()> {
        let mut tx = cancellable(cancel, conn.begin()).await?;

        let outcome = async {
            cancellable(cancel, tx.execute_script(definition.apply_script())).await?;
            cancellable(
                cancel,
                self.ledger.record_applied(&mut *tx, definition.id(), Utc::now()),
            )
            .await
        }
        .await;

        finish(tx, outcome, cancel).await
    }

    /// Report every definition as pending or applied, then every ledger row
    /// without a definition as orphaned. Takes no lock and creates nothing.
    pub async fn status(&self, cancel: &CancellationToken) -> MigrateResult<Vec<MigrationStatus>> {
        let mut conn = cancellable(cancel, self.pool.acquire()).await?;

        let entries = if cancellable(cancel, self.ledger.exists(&mut *conn)).await? {
            cancellable(cancel, self.ledger.entries(&mut *conn)).await?
        } else {
            Vec::new()
        };

        let mut applied: HashMap<&str, _> = entries
            .iter()
            .map(|entry| (entry.id.as_str(), entry.applied_at))
            .collect();

        let mut statuses: Vec<MigrationStatus> = self
            .definitions
            .iter()
            .map(|definition| match applied.remove(definition.id()) {
                Some(applied_at) => MigrationStatus::Applied {
                    id: definition.id().to_string(),
                    applied_at,
                },
                None => MigrationStatus::Pending {
                    id: definition.id().to_string(),
                },
            })
            .collect();

        statuses.extend(
            entries
                .iter()
                .filter(|entry| applied.contains_key(entry.id.as_str()))
                .map(|entry| MigrationStatus::Orphaned {
                    id: entry.id.clone(),
                    applied_at: entry.applied_at,
                }),
        );

        Ok(statuses)
    }

    /// Release the run lock and hand the connection back. A connection whose
    /// run was interrupted, or whose lock could not be released in time, is
    /// closed instead so the server drops the session and its lock.
    pub(super) async fn end_run(
        &self,
        mut conn: Box<dyn DatabaseConnection>,
        error: Option<&MigrateError>,
        cancel: &CancellationToken,
    ) {
        let interrupted = error.map_or(false, MigrateError::is_cancelled);

        if !interrupted {
            match cancellable(cancel, self.lock.release(&mut *conn)).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(
                        target: "tidemark::migrate",
                        error = %err,
                        "Closing connection to drop run lock"
                    );
                }
            }
        }

        match tokio::time::timeout(CLOSE_TIMEOUT, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(target: "tidemark::migrate", error = %err, "Failed to close connection");
            }
            Err(_) => {
                warn!(
                    target: "tidemark::migrate",
                    timeout_ms = CLOSE_TIMEOUT.as_millis() as u64,
                    "Gave up waiting for connection to close"
                );
            }
        }
    }
}

/// Commit the unit of work if `outcome` succeeded, otherwise roll it back
/// and return the original error. A cancelled unit is dropped without a
/// round trip, and cancellation also interrupts a pending commit or
/// rollback; the session is closed afterwards.
pub(super) async fn finish<T>(
    tx: Box<dyn DatabaseTransaction + '_>,
    outcome: MigrateResult<T>,
    cancel: &CancellationToken,
) -> MigrateResult<T> {
    match outcome {
        Ok(value) => {
            cancellable(cancel, tx.commit()).await?;
            Ok(value)
        }
        Err(MigrateError::Cancelled) => {
            drop(tx);
            Err(MigrateError::Cancelled)
        }
        Err(err) => {
            if let Err(rollback_err) = cancellable(cancel, tx.rollback()).await {
                warn!(target: "tidemark::migrate", error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}
