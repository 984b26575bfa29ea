//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the fundamental types used throughout the migration system:
//! the immutable [`MigrationDefinition`] parsed from a file, the ordered
//! [`MigrationSet`], ledger rows and run reports.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LoadError, Section};

/// Literal marker separating the apply script from the revert script
pub const DOWN_MARKER: &str = "@DOWN";

/// Extension a file must carry to be considered a migration
pub const MIGRATION_EXTENSION: &str = "sql";

/// A single migration: an id plus the scripts to apply and revert it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDefinition {
    id: String,
    apply_script: String,
    revert_script: String,
    source: PathBuf,
}

impl MigrationDefinition {
    /// Parse file content into a definition. The content must contain
    /// [`DOWN_MARKER`] exactly once and both halves must be non-empty after
    /// trimming. Scripts are kept as opaque text.
    pub fn parse(
        id: impl Into<String>,
        source: impl Into<PathBuf>,
        content: &str,
    ) -> Result<Self, LoadError> {
        let source = source.into();

        let found = content.matches(DOWN_MARKER).count();
        let Some((apply, revert)) = content.split_once(DOWN_MARKER).filter(|_| found == 1) else {
            return Err(LoadError::MissingSeparator {
                path: source,
                marker: DOWN_MARKER,
                found,
            });
        };

        let apply_script = apply.trim();
        if apply_script.is_empty() {
            return Err(LoadError::EmptySection {
                path: source,
                section: Section::Apply,
            });
        }

        let revert_script = revert.trim();
        if revert_script.is_empty() {
            return Err(LoadError::EmptySection {
                path: source,
                section: Section::Revert,
            });
        }

        Ok(Self {
            id: id.into(),
            apply_script: apply_script.to_string(),
            revert_script: revert_script.to_string(),
            source,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn apply_script(&self) -> &str {
        &self.apply_script
    }

    pub fn revert_script(&self) -> &str {
        &self.revert_script
    }

    /// File the definition was read from
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Script for the given direction
    pub fn script(&self, direction: MigrationDirection) -> &str {
        match direction {
            MigrationDirection::Up => &self.apply_script,
            MigrationDirection::Down => &self.revert_script,
        }
    }
}

/// Definitions sorted ascending by id, ids unique.
///
/// This order is used both to apply pending migrations and to break ties
/// when deciding which applied migration is the most recent.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    definitions: Vec<MigrationDefinition>,
}

impl MigrationSet {
    /// Sort definitions by id and reject duplicates
    pub fn new(mut definitions: Vec<MigrationDefinition>) -> Result<Self, LoadError> {
        definitions.sort_by(|a, b| a.id.cmp(&b.id));

        if let Some(pair) = definitions.windows(2).find(|pair| pair[0].id == pair[1].id) {
            return Err(LoadError::DuplicateId {
                id: pair[0].id.clone(),
                first: pair[0].source.clone(),
                second: pair[1].source.clone(),
            });
        }

        Ok(Self { definitions })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MigrationDefinition> {
        self.definitions.iter()
    }

    /// Look up a definition by id
    pub fn get(&self, id: &str) -> Option<&MigrationDefinition> {
        self.definitions
            .binary_search_by(|definition| definition.id.as_str().cmp(id))
            .ok()
            .map(|index| &self.definitions[index])
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(|definition| definition.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl<'a> IntoIterator for &'a MigrationSet {
    type Item = &'a MigrationDefinition;
    type IntoIter = std::slice::Iter<'a, MigrationDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.definitions.iter()
    }
}

/// A row of the ledger table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: String,
    pub applied_at: DateTime<Utc>,
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    /// Apply the migration (run the apply script)
    Up,
    /// Revert the migration (run the revert script)
    Down,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationDirection::Up => write!(f, "apply"),
            MigrationDirection::Down => write!(f, "revert"),
        }
    }
}

/// Status of one migration as seen by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum MigrationStatus {
    /// Defined on disk, not recorded in the ledger
    Pending { id: String },
    /// Defined on disk and recorded in the ledger
    Applied {
        id: String,
        applied_at: DateTime<Utc>,
    },
    /// Recorded in the ledger but no file defines it any more
    Orphaned {
        id: String,
        applied_at: DateTime<Utc>,
    },
}

impl MigrationStatus {
    pub fn id(&self) -> &str {
        match self {
            MigrationStatus::Pending { id }
            | MigrationStatus::Applied { id, .. }
            | MigrationStatus::Orphaned { id, .. } => id,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MigrationStatus::Pending { .. })
    }
}

/// Result of running migrations
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationRunResult {
    /// IDs of migrations applied by this run, in order
    pub applied: Vec<String>,
    /// IDs of migrations that were already recorded
    pub skipped: Vec<String>,
    /// Wall time spent holding the run lock
    pub elapsed: Duration,
}

impl MigrationRunResult {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// Result of rolling back a migration
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackResult {
    /// The reverted migration, or `None` when the ledger was empty
    pub reverted: Option<String>,
    pub elapsed: Duration,
}
