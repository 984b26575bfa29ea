//! Migration Loader - reads migration definitions from a directory
//!
//! Every regular file with a `.sql` extension (any case) is parsed into a
//! [`MigrationDefinition`] whose id is the file stem. Other files are
//! ignored. Any malformed file fails the whole load.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::definitions::{MigrationDefinition, MigrationSet, MIGRATION_EXTENSION};
use crate::error::LoadError;

/// Loads migration definitions from a directory
#[derive(Debug, Clone)]
pub struct MigrationLoader {
    dir: PathBuf,
}

impl MigrationLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load all migration files, sorted by id
    pub fn load(&self) -> Result<MigrationSet, LoadError> {
        let read_dir_error = |source: std::io::Error| LoadError::ReadDir {
            path: self.dir.clone(),
            source,
        };

        let mut definitions = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(read_dir_error)? {
            let path = entry.map_err(read_dir_error)?.path();
            if !is_migration_file(&path) {
                continue;
            }
            definitions.push(self.parse_migration_file(&path)?);
        }

        let set = MigrationSet::new(definitions)?;
        debug!(
            target: "tidemark::migrate",
            dir = %self.dir.display(),
            count = set.len(),
            "Loaded migration definitions"
        );
        Ok(set)
    }

    fn parse_migration_file(&self, path: &Path) -> Result<MigrationDefinition, LoadError> {
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| LoadError::InvalidFileName {
                path: path.to_path_buf(),
            })?;

        let content = fs::read_to_string(path).map_err(|source| LoadError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        MigrationDefinition::parse(id, path, &content)
    }
}

/// Load all migration definitions from `dir`
pub fn load_migrations(dir: impl AsRef<Path>) -> Result<MigrationSet, LoadError> {
    MigrationLoader::new(dir.as_ref()).load()
}

fn is_migration_file(path: &Path) -> bool {
    let has_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case(MIGRATION_EXTENSION));

    has_extension && path.is_file()
}
