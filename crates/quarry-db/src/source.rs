use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use quarry_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::version::{Version, parse_version};

/// A versioned SQL script plus the outcome of its latest attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub version: Version,
    pub name: String,
    pub sql: String,
    pub ran_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Migration {
    /// Build a migration whose version is encoded at the start of `name`.
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let version = parse_version(&name)?;
        Ok(Self::with_version(version, name, sql))
    }

    pub fn with_version(version: Version, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            sql: sql.into(),
            ran_at: None,
            error: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Supplies the full, unordered migration set.
pub trait MigrationSource {
    fn load_all(&self) -> Result<Vec<Migration>>;
}

impl MigrationSource for Vec<Migration> {
    fn load_all(&self) -> Result<Vec<Migration>> {
        Ok(self.clone())
    }
}

/// Scripts compiled into the binary, usually via `include_str!`.
pub struct StaticSource {
    scripts: &'static [(&'static str, &'static str)],
}

impl StaticSource {
    pub const fn new(scripts: &'static [(&'static str, &'static str)]) -> Self {
        Self { scripts }
    }
}

impl MigrationSource for StaticSource {
    fn load_all(&self) -> Result<Vec<Migration>> {
        self.scripts
            .iter()
            .map(|(name, sql)| Migration::new(*name, *sql))
            .collect()
    }
}

/// Loads every `*.<extension>` file in a directory; the file name is the
/// migration name, e.g. `0002.add_email.sql`.
pub struct DirectorySource {
    dir: PathBuf,
    extension: String,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extension: "sql".to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension))
    }
}

impl MigrationSource for DirectorySource {
    fn load_all(&self) -> Result<Vec<Migration>> {
        if !self.dir.is_dir() {
            return Err(Error::NotFound(format!(
                "migrations directory {}",
                self.dir.display()
            )));
        }

        let mut migrations = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() || !self.matches_extension(&path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let sql = std::fs::read_to_string(&path).map_err(|e| {
                Error::Other(format!("failed to read {}: {e}", path.display()))
            })?;
            migrations.push(Migration::new(name, sql)?);
        }

        migrations.sort_by(|a, b| a.version.cmp(&b.version));
        debug!(
            "loaded {} migrations from {}",
            migrations.len(),
            self.dir.display()
        );
        Ok(migrations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_new_derives_version_from_name() {
        let m = Migration::new("0003.5_rename.sql", "SELECT 1;").unwrap();
        assert_eq!(m.version, "3.5".parse().unwrap());
        assert_eq!(m.name, "0003.5_rename.sql");
        assert!(m.ran_at.is_none());
        assert!(!m.failed());
    }

    #[test]
    fn migration_new_rejects_unversioned_name() {
        assert!(matches!(
            Migration::new("rename.sql", ""),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn empty_error_is_not_a_failure() {
        let mut m = Migration::new("1.sql", "").unwrap();
        m.error = Some(String::new());
        assert!(!m.failed());
        m.error = Some("boom".into());
        assert!(m.failed());
    }

    #[test]
    fn static_source_parses_all_names() {
        static SCRIPTS: &[(&str, &str)] = &[
            ("2_second.sql", "SELECT 2;"),
            ("1_first.sql", "SELECT 1;"),
        ];
        let loaded = StaticSource::new(SCRIPTS).load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].version, Version::from(2));
        assert_eq!(loaded[1].sql, "SELECT 1;");
    }

    #[test]
    fn directory_source_reads_matching_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0010_late.sql"), "SELECT 10;").unwrap();
        std::fs::write(dir.path().join("0002.SQL"), "SELECT 2;").unwrap();
        std::fs::write(dir.path().join("README.md"), "notes").unwrap();
        std::fs::create_dir(dir.path().join("0003_dir.sql")).unwrap();

        let loaded = DirectorySource::new(dir.path()).load_all().unwrap();
        let versions: Vec<String> = loaded.iter().map(|m| m.version.to_string()).collect();
        assert_eq!(versions, vec!["2", "10"]);
        assert_eq!(loaded[1].name, "0010_late.sql");
        assert_eq!(loaded[1].sql, "SELECT 10;");
    }

    #[test]
    fn directory_source_fails_on_unversioned_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("init.sql"), "SELECT 1;").unwrap();
        assert!(matches!(
            DirectorySource::new(dir.path()).load_all(),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn directory_source_honours_custom_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1.up.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("2.migration"), "SELECT 2;").unwrap();
        let loaded = DirectorySource::new(dir.path())
            .with_extension(".migration")
            .load_all()
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].version, Version::from(2));
    }

    #[test]
    fn missing_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            DirectorySource::new(missing).load_all(),
            Err(Error::NotFound(_))
        ));
    }
}
