use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use quarry_common::{Error, Result};
use rusqlite::Connection;
use tracing::{info, warn};

pub const DEFAULT_BACKUP_EXTENSION: &str = "migbak";

const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 100;
const BACKUP_STEP_PAUSE: Duration = Duration::from_millis(20);

/// A point-in-time copy of the database file taken before a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    path: PathBuf,
}

impl Backup {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Snapshots the database beside its file before a run and removes the copy once the
/// run has fully succeeded.
#[derive(Debug, Clone)]
pub struct BackupManager {
    extension: String,
    enabled: bool,
}

impl Default for BackupManager {
    fn default() -> Self {
        Self {
            extension: DEFAULT_BACKUP_EXTENSION.to_string(),
            enabled: true,
        }
    }
}

impl BackupManager {
    pub fn with_extension(extension: impl Into<String>) -> Result<Self> {
        let extension = extension.into().trim_start_matches('.').to_string();
        if extension.is_empty() || extension.contains(['/', '\\']) {
            return Err(Error::Parameter(format!(
                "invalid backup extension {extension:?}"
            )));
        }
        Ok(Self {
            extension,
            enabled: true,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Snapshot the database next to its file. Returns `None` for in-memory
    /// databases, missing files, or when backups are disabled.
    pub fn create(&self, conn: &Connection) -> Result<Option<Backup>> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(source) = database_file(conn) else {
            return Ok(None);
        };
        if !source.is_file() {
            return Ok(None);
        }

        let destination = self.backup_path(&source)?;
        if let Err(e) = copy_database(conn, &destination) {
            if let Err(cleanup) = std::fs::remove_file(&destination)
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(
                    "could not remove partial backup {}: {cleanup}",
                    destination.display()
                );
            }
            return Err(e);
        }

        info!("database backed up to {}", destination.display());
        Ok(Some(Backup { path: destination }))
    }

    pub fn discard(&self, backup: Backup) -> Result<()> {
        match std::fs::remove_file(&backup.path) {
            Ok(()) => {
                info!("removed backup {}", backup.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("backup {} already gone", backup.path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn backup_path(&self, source: &Path) -> Result<PathBuf> {
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Parameter(format!("unusable database path {}", source.display()))
            })?;
        let stamp = Utc::now().format("%Y%m%d%H%M%S%9f");
        Ok(source.with_file_name(format!("{file_name}.{stamp}.{}", self.extension)))
    }
}

/// Snapshot `conn` into a fresh database at `destination` with SQLite's online
/// backup API, then quick-check the copy.
fn copy_database(conn: &Connection, destination: &Path) -> Result<()> {
    let mut target = Connection::open(destination).map_err(|e| {
        Error::Database(format!(
            "failed to create backup {}: {e}",
            destination.display()
        ))
    })?;

    {
        let backup = rusqlite::backup::Backup::new(conn, &mut target)
            .map_err(|e| Error::Database(format!("failed to start backup: {e}")))?;
        backup
            .run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_STEP_PAUSE, None)
            .map_err(|e| Error::Database(format!("backup did not complete: {e}")))?;
    }

    let check: String = target
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| Error::Database(format!("failed to check backup: {e}")))?;
    if check != "ok" {
        return Err(Error::Database(format!(
            "backup {} failed its quick check: {check}",
            destination.display()
        )));
    }
    Ok(())
}

/// Path of the main database file, `None` when the database is in memory.
pub fn database_file(conn: &Connection) -> Option<PathBuf> {
    conn.path()
        .filter(|p| !p.is_empty() && *p != ":memory:")
        .map(PathBuf::from)
}
