//! Migration Rollback - reverts the most recently applied migration
//!
//! Exactly one migration is reverted per call. The revert script and the
//! removal of its ledger row share one transaction.

use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::definitions::{MigrationDefinition, MigrationDirection, RollbackResult};
use super::runner::{finish, Migrator};
use crate::backends::DatabaseConnection;
use crate::cancel::cancellable;
use crate::error::{MigrateError, MigrateResult};

impl<'a> Migrator<'a> {
    /// Revert the most recently applied migration. An empty ledger is not an
    /// error; the result then carries no id.
    pub async fn rollback(&self, cancel: &CancellationToken) -> MigrateResult<RollbackResult> {
        let start = Instant::now();
        let mut conn = cancellable(cancel, self.pool.acquire()).await?;

        let outcome = self.revert_latest(&mut *conn, cancel).await;
        self.end_run(conn, outcome.as_ref().err(), cancel).await;

        let reverted = outcome?;
        let elapsed = start.elapsed();
        info!(
            target: "tidemark::migrate",
            reverted = reverted.as_deref().unwrap_or("none"),
            elapsed_ms = elapsed.as_millis() as u64,
            "Rollback complete"
        );
        Ok(RollbackResult { reverted, elapsed })
    }

    async fn revert_latest(
        &self,
        conn: &mut dyn DatabaseConnection,
        cancel: &CancellationToken,
    ) -> MigrateResult<Option<String>> {
        cancellable(cancel, self.lock.acquire(&mut *conn)).await?;

        let table = self.ledger.table().name();
        info!(target: "tidemark::migrate", table, "Creating/checking ledger table");
        cancellable(cancel, self.ledger.ensure_schema(&mut *conn)).await?;

        let latest = cancellable(cancel, self.ledger.most_recent_applied(&mut *conn)).await?;
        let Some(id) = latest else {
            info!(target: "tidemark::migrate", "Ledger is empty, nothing to roll back");
            return Ok(None);
        };

        let definition = self.definitions.get(&id).ok_or_else(|| {
            MigrateError::DefinitionNotFound(id.clone())
                .in_migration(id.as_str(), MigrationDirection::Down)
        })?;

        info!(target: "tidemark::migrate", id = %id, "Rolling back migration");
        self.revert_one(&mut *conn, definition, cancel)
            .await
            .map_err(|e| e.in_migration(id.as_str(), MigrationDirection::Down))?;

        Ok(Some(id))
    }

    async fn revert_one(
        &self,
        conn: &mut dyn DatabaseConnection,
        definition: &MigrationDefinition,
        cancel: &CancellationToken,
    ) -> MigrateResult<()> {
        let mut tx = cancellable(cancel, conn.begin()).await?;

        let outcome = async {
            cancellable(cancel, tx.execute_script(definition.revert_script())).await?;
            let removed =
                cancellable(cancel, self.ledger.record_reverted(&mut *tx, definition.id())).await?;
            if removed {
                Ok(())
            } else {
                Err(MigrateError::LedgerMissing {
                    id: definition.id().to_string(),
                })
            }
        }
        .await;

        finish(tx, outcome, cancel).await
    }
}
