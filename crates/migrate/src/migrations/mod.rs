//! Migration System
//!
//! Definitions are loaded from disk by [`loader`], recorded in the database by
//! [`ledger`], and applied or reverted by the [`Migrator`] in [`runner`] and
//! [`rollback`].

pub mod definitions;
pub mod ledger;
pub mod loader;
pub mod lock;
pub mod rollback;
pub mod runner;

pub use definitions::{
    LedgerEntry, MigrationDefinition, MigrationDirection, MigrationRunResult, MigrationSet,
    MigrationStatus, RollbackResult, DOWN_MARKER, MIGRATION_EXTENSION,
};
pub use ledger::{Ledger, LedgerTable};
pub use loader::{load_migrations, MigrationLoader};
pub use lock::RunLock;
pub use runner::Migrator;
