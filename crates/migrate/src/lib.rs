//! # tidemark-migrate
//!
//! File-defined SQL migrations with an in-database ledger.
//!
//! Definitions are loaded from a directory of `.sql` files, each holding an
//! apply script and a revert script separated by an `@DOWN` line. The
//! [`Migrator`] applies pending definitions in id order, one transaction per
//! migration, and reverts the most recent one on rollback. Runs against the
//! same ledger are serialized with an advisory lock.
//!
//! ```no_run
//! use tidemark_migrate::{
//!     load_migrations, CancellationToken, DatabasePoolConfig, Migrator, PostgresPool,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let definitions = load_migrations("./migrations")?;
//! let url = "postgres://localhost/app";
//! let pool = PostgresPool::connect_url(url, &DatabasePoolConfig::default()).await?;
//! let migrator = Migrator::new(definitions, &pool, "schema_migrations")?;
//! let result = migrator.migrate(&CancellationToken::new()).await?;
//! println!("applied {} migration(s)", result.applied_count());
//! # Ok(())
//! # }
//! ```

pub mod backends;
mod cancel;
pub mod connection;
pub mod error;
pub mod migrations;
pub mod security;

#[cfg(test)]
mod testing;

pub use backends::{
    DatabaseConnection, DatabaseExecutor, DatabasePool, DatabasePoolConfig, DatabaseRow,
    DatabaseTransaction, DatabaseValue, PostgresPool,
};
pub use connection::{close_pool, connect_with_retry, retry_connect, RetryPolicy};
pub use error::{LoadError, MigrateError, MigrateResult, Section};
pub use migrations::{
    load_migrations, Ledger, LedgerEntry, LedgerTable, MigrationDefinition, MigrationDirection,
    MigrationLoader, MigrationRunResult, MigrationSet, MigrationStatus, Migrator, RollbackResult,
    RunLock,
};
pub use tokio_util::sync::CancellationToken;
