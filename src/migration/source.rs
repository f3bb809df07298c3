//! Migration discovery.
//!
//! Units come either from code ([`MigrationSet`]) or from a directory of
//! numbered SQL files ([`DirectorySource`]):
//!
//! ```text
//! migrations/
//!   0.sql              foreground, required
//!   1.sql
//!   1.background.sql   optional, runs outside a transaction
//!   1.valid.sql        optional, first column of the first row is the verdict
//! ```

use crate::db::Connection;
use crate::error::{DbError, DbResult};
use crate::migration::{DataLoader, Migration};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// An ordered list of units; the unit at index `n` has sequence `n`.
#[derive(Clone, Default)]
pub struct MigrationSet {
    units: Vec<Arc<dyn Migration>>,
}

impl fmt::Debug for MigrationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationSet")
            .field("units", &self.units.len())
            .finish()
    }
}

impl MigrationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unit with the next sequence number.
    pub fn with(mut self, unit: impl Migration + 'static) -> Self {
        self.push(unit);
        self
    }

    pub fn push(&mut self, unit: impl Migration + 'static) {
        self.units.push(Arc::new(unit));
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub(crate) fn units(&self) -> &[Arc<dyn Migration>] {
        &self.units
    }
}

/// A unit read from SQL files.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    foreground: String,
    background: Option<String>,
    validation: Option<String>,
}

impl SqlMigration {
    pub fn new(foreground: impl Into<String>) -> Self {
        Self {
            foreground: foreground.into(),
            background: None,
            validation: None,
        }
    }

    pub fn with_background(mut self, sql: impl Into<String>) -> Self {
        self.background = Some(sql.into());
        self
    }

    pub fn with_validation(mut self, query: impl Into<String>) -> Self {
        self.validation = Some(query.into());
        self
    }
}

#[async_trait]
impl Migration for SqlMigration {
    async fn migrate(&self, conn: &Connection) -> DbResult<()> {
        conn.execute_script(&self.foreground).await
    }

    fn has_background(&self) -> bool {
        self.background.is_some()
    }

    async fn background_migrate(&self, conn: &Connection) -> DbResult<()> {
        match &self.background {
            Some(sql) => conn.execute_script(sql).await,
            None => Ok(()),
        }
    }

    async fn valid_migration(&self, conn: &Connection) -> DbResult<bool> {
        let Some(query) = &self.validation else {
            return Ok(true);
        };
        let verdict = conn.fetch_val(query, ()).await?;
        Ok(verdict.and_then(|v| v.truthy()).unwrap_or(false))
    }
}

#[derive(Default)]
struct UnitFiles {
    foreground: Option<PathBuf>,
    background: Option<PathBuf>,
    validation: Option<PathBuf>,
}

/// Which of the three files a name denotes, and for which sequence.
fn classify(file_name: &str) -> Option<(u64, FileRole)> {
    let stem = file_name.strip_suffix(".sql")?;
    let (number, role) = if let Some(n) = stem.strip_suffix(".background") {
        (n, FileRole::Background)
    } else if let Some(n) = stem.strip_suffix(".valid") {
        (n, FileRole::Validation)
    } else {
        (stem, FileRole::Foreground)
    };
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    number.parse().ok().map(|n| (n, role))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileRole {
    Foreground,
    Background,
    Validation,
}

fn read_file(path: &Path) -> DbResult<String> {
    std::fs::read_to_string(path).map_err(|e| DbError::io(path, e))
}

/// A directory of numbered SQL migration files.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    path: PathBuf,
}

impl DirectorySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the contiguous run of units starting at 0.
    ///
    /// A missing directory yields an empty set. Files past the first gap in
    /// numbering are ignored with a warning.
    pub fn discover(&self) -> DbResult<MigrationSet> {
        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Migrations folder not found");
                return Ok(MigrationSet::new());
            }
            Err(e) => return Err(DbError::io(&self.path, e)),
        };

        let mut files: BTreeMap<u64, UnitFiles> = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| DbError::io(&self.path, e))?;
            let file_name = entry.file_name();
            let Some((sequence, role)) = file_name.to_str().and_then(classify) else {
                continue;
            };
            let slot = files.entry(sequence).or_default();
            let path = Some(entry.path());
            match role {
                FileRole::Foreground => slot.foreground = path,
                FileRole::Background => slot.background = path,
                FileRole::Validation => slot.validation = path,
            }
        }

        let mut set = MigrationSet::new();
        let mut expected = 0u64;
        for (sequence, unit) in files {
            let Some(foreground) = unit.foreground.filter(|_| sequence == expected) else {
                warn!(
                    path = %self.path.display(),
                    sequence,
                    expected,
                    "Gap in migration numbering, ignoring this and later files"
                );
                break;
            };
            let mut migration = SqlMigration::new(read_file(&foreground)?);
            if let Some(path) = unit.background {
                migration = migration.with_background(read_file(&path)?);
            }
            if let Some(path) = unit.validation {
                migration = migration.with_validation(read_file(&path)?);
            }
            set.push(migration);
            expected += 1;
        }

        debug!(path = %self.path.display(), units = set.len(), "Discovered migrations");
        Ok(set)
    }
}

/// A one-time data load read from a SQL file.
#[derive(Debug, Clone)]
pub struct SqlDataLoader {
    path: PathBuf,
}

impl SqlDataLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DataLoader for SqlDataLoader {
    async fn load(&self, conn: &Connection) -> DbResult<()> {
        let sql = read_file(&self.path)?;
        conn.execute_script(&sql).await
    }
}
