//! Run orchestration: resolve the current version, pick a direction and the
//! pending scripts, back the database up, then execute, verify and record
//! each script in turn, stopping at the first failure.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use quarry_common::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::backup::BackupManager;
use crate::directives::{Direction, process_sql};
use crate::history::HistoryStore;
use crate::source::{Migration, MigrationSource};
use crate::verify::{check_foreign_keys, check_integrity};
use crate::version::Version;

/// Where a run should leave the database.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Target {
    /// Before every migration: roll everything back.
    Base,
    Version(Version),
    /// The highest available version.
    #[default]
    Latest,
}

impl Target {
    /// Order of `current` relative to this target; `None` sorts below everything.
    fn compare(&self, current: Option<&Version>) -> Ordering {
        match (self, current) {
            (Target::Latest, _) => Ordering::Less,
            (Target::Base, None) => Ordering::Equal,
            (Target::Base, Some(_)) => Ordering::Greater,
            (Target::Version(_), None) => Ordering::Less,
            (Target::Version(target), Some(current)) => current.cmp(target),
        }
    }

    /// Whether `version` should be applied when moving up to this target.
    fn reaches(&self, version: &Version) -> bool {
        match self {
            Target::Latest => true,
            Target::Base => false,
            Target::Version(target) => version <= target,
        }
    }
}

impl From<Version> for Target {
    fn from(version: Version) -> Self {
        Target::Version(version)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Base => f.write_str("base"),
            Target::Version(v) => write!(f, "{v}"),
            Target::Latest => f.write_str("latest"),
        }
    }
}

/// The steps a run would take, resolved without executing any script.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub current: Option<Version>,
    pub target: Target,
    pub direction: Direction,
    pub steps: Vec<Migration>,
}

impl MigrationPlan {
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Outcome of a run that executed every selected migration.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub from: Option<Version>,
    pub direction: Direction,
    pub applied: Vec<Migration>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// A run that stopped early. Everything in `applied` stays applied; the
/// backup, when one was taken, is left on disk for manual recovery.
#[derive(Debug, thiserror::Error)]
#[error("{}", describe_failure(.failed, .error))]
pub struct MigrationFailure {
    pub from: Option<Version>,
    pub direction: Option<Direction>,
    pub applied: Vec<Migration>,
    /// The migration the run stopped on. Its `error` is set when the script
    /// or a consistency check failed. It stays `None` when the script ran
    /// cleanly and only writing its history row failed; that script's
    /// changes are in the database.
    pub failed: Option<Migration>,
    pub backup: Option<PathBuf>,
    #[source]
    pub error: Error,
}

impl MigrationFailure {
    fn before_run(error: Error) -> Self {
        Self {
            from: None,
            direction: None,
            applied: Vec::new(),
            failed: None,
            backup: None,
            error,
        }
    }
}

fn describe_failure(failed: &Option<Migration>, error: &Error) -> String {
    match failed {
        Some(m) => format!("migration {} ({}) failed: {error}", m.version, m.name),
        None => format!("migration run could not start: {error}"),
    }
}

/// Applies a fixed set of migrations to one connection.
pub struct Migrator<'c> {
    conn: &'c Connection,
    migrations: Vec<Migration>,
    history: HistoryStore,
    backups: BackupManager,
}

impl<'c> Migrator<'c> {
    pub fn new(conn: &'c Connection, migrations: Vec<Migration>) -> Result<Self> {
        let mut seen = HashSet::new();
        for m in &migrations {
            if m.name.trim().is_empty() {
                return Err(Error::Parameter(format!(
                    "migration {} has an empty name",
                    m.version
                )));
            }
            if !seen.insert(m.version.clone()) {
                return Err(Error::Parameter(format!(
                    "duplicate migration version {} ({})",
                    m.version, m.name
                )));
            }
        }

        Ok(Self {
            conn,
            migrations,
            history: HistoryStore::default(),
            backups: BackupManager::default(),
        })
    }

    pub fn from_source(conn: &'c Connection, source: &dyn MigrationSource) -> Result<Self> {
        Self::new(conn, source.load_all()?)
    }

    pub fn with_history(mut self, history: HistoryStore) -> Self {
        self.history = history;
        self
    }

    pub fn with_backups(mut self, backups: BackupManager) -> Self {
        self.backups = backups;
        self
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Highest available version, if any migrations are loaded.
    pub fn latest_version(&self) -> Option<&Version> {
        self.migrations.iter().map(|m| &m.version).max()
    }

    pub fn current_version(&self) -> Result<Option<Version>> {
        self.history.ensure_table(self.conn)?;
        self.history.current_version(self.conn)
    }

    pub fn history(&self) -> Result<Vec<Migration>> {
        self.history.ensure_table(self.conn)?;
        self.history.entries(self.conn)
    }

    /// Versions whose applied script differs from the one loaded now.
    pub fn drifted(&self) -> Result<Vec<Version>> {
        let recorded = self.history()?;
        let mut drifted = Vec::new();
        for entry in recorded.iter().filter(|e| !e.failed()) {
            let Some(loaded) = self.migrations.iter().find(|m| m.version == entry.version) else {
                continue;
            };
            if loaded.sql != entry.sql {
                warn!(
                    "script for version {} changed since it was applied",
                    entry.version
                );
                drifted.push(entry.version.clone());
            }
        }
        Ok(drifted)
    }

    /// Resolve direction and ordered steps for `target` without running anything.
    pub fn plan(&self, target: Target) -> Result<MigrationPlan> {
        let current = self.current_version()?;
        let ordering = target.compare(current.as_ref());
        let direction = if ordering == Ordering::Less {
            Direction::Up
        } else {
            Direction::Down
        };

        let mut steps: Vec<Migration> = match ordering {
            Ordering::Equal => Vec::new(),
            Ordering::Less => self
                .migrations
                .iter()
                .filter(|m| current.as_ref().is_none_or(|c| m.version > *c))
                .filter(|m| target.reaches(&m.version))
                .cloned()
                .collect(),
            Ordering::Greater => self
                .migrations
                .iter()
                .filter(|m| current.as_ref().is_some_and(|c| m.version <= *c))
                .filter(|m| !target.reaches(&m.version))
                .cloned()
                .collect(),
        };

        steps.sort_by(|a, b| a.version.cmp(&b.version));
        if direction == Direction::Down {
            steps.reverse();
        }

        Ok(MigrationPlan {
            current,
            target,
            direction,
            steps,
        })
    }

    pub fn migrate_to_latest(&self) -> std::result::Result<MigrationReport, MigrationFailure> {
        self.migrate_to(Target::Latest)
    }

    /// Bring the database to `target`.
    ///
    /// Stops at the first script that fails to execute or leaves the database
    /// inconsistent; that attempt is recorded with its error before returning.
    pub fn migrate_to(
        &self,
        target: Target,
    ) -> std::result::Result<MigrationReport, MigrationFailure> {
        let plan = self.plan(target).map_err(MigrationFailure::before_run)?;
        let MigrationPlan {
            current,
            target,
            direction,
            steps,
        } = plan;

        if steps.is_empty() {
            info!(
                "database at version {} already satisfies target {target}",
                display_version(current.as_ref())
            );
            return Ok(MigrationReport {
                from: current,
                direction,
                applied: Vec::new(),
            });
        }

        info!(
            "migrating {direction} from version {} to {target} ({} steps)",
            display_version(current.as_ref()),
            steps.len()
        );

        let backup = self.backups.create(self.conn).map_err(|error| MigrationFailure {
            from: current.clone(),
            direction: Some(direction),
            ..MigrationFailure::before_run(error)
        })?;

        let mut applied = Vec::with_capacity(steps.len());
        for mut migration in steps {
            migration.ran_at = Some(Utc::now());
            if let Err(err) = self.run_step(&migration, direction) {
                if err.is_consistency_violation() {
                    error!(
                        "migration {} ({}) left the database inconsistent: {err}",
                        migration.version, migration.name
                    );
                } else {
                    error!("migration {} ({}) failed: {err}", migration.version, migration.name);
                }
                migration.error = Some(err.to_string());
                if let Err(record_err) = self.history.record(self.conn, &migration, direction) {
                    warn!(
                        "could not record failure of migration {}: {record_err}",
                        migration.version
                    );
                }
                if let Some(b) = &backup {
                    warn!("backup retained at {}", b.path().display());
                }
                return Err(MigrationFailure {
                    from: current,
                    direction: Some(direction),
                    applied,
                    failed: Some(migration),
                    backup: backup.map(|b| b.path().to_path_buf()),
                    error: err,
                });
            }

            if let Err(err) = self.history.record(self.conn, &migration, direction) {
                return Err(MigrationFailure {
                    from: current,
                    direction: Some(direction),
                    applied,
                    failed: Some(migration),
                    backup: backup.map(|b| b.path().to_path_buf()),
                    error: err,
                });
            }
            info!("migrated {direction} {} ({})", migration.version, migration.name);
            applied.push(migration);
        }

        if let Some(backup) = backup
            && let Err(e) = self.backups.discard(backup)
        {
            warn!("run succeeded but the backup could not be removed: {e}");
        }

        Ok(MigrationReport {
            from: current,
            direction,
            applied,
        })
    }

    fn run_step(&self, migration: &Migration, direction: Direction) -> Result<()> {
        let schema_version: i64 = self
            .conn
            .query_row("PRAGMA schema_version", [], |row| row.get(0))
            .map_err(|e| Error::Database(format!("failed to read schema version: {e}")))?;

        let sql = process_sql(&migration.sql, direction, schema_version);
        debug!(
            "executing {} bytes for version {} (schema version {schema_version})",
            sql.len(),
            migration.version
        );

        self.conn
            .execute_batch(&sql)
            .map_err(|e| Error::Execution(e.to_string()))?;

        check_integrity(self.conn)?;
        check_foreign_keys(self.conn)
    }
}

fn display_version(version: Option<&Version>) -> String {
    version.map_or_else(|| "none".to_string(), Version::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrations() -> Vec<Migration> {
        vec![
            Migration::new(
                "1_users.sql",
                "<UP>CREATE TABLE users (id INTEGER PRIMARY KEY);</UP>
                 <DOWN>DROP TABLE users;</DOWN>",
            )
            .unwrap(),
            Migration::new(
                "2_posts.sql",
                "<UP>CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id));</UP>
                 <DOWN>DROP TABLE posts;</DOWN>",
            )
            .unwrap(),
            Migration::new(
                "3_tags.sql",
                "<UP>CREATE TABLE tags (name TEXT);</UP><DOWN>DROP TABLE tags;</DOWN>",
            )
            .unwrap(),
        ]
    }

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn versions(ms: &[Migration]) -> Vec<String> {
        ms.iter().map(|m| m.version.to_string()).collect()
    }

    #[test]
    fn duplicate_versions_are_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let mut set = migrations();
        set.push(Migration::new("0002_again.sql", "SELECT 1;").unwrap());
        assert!(matches!(
            Migrator::new(&conn, set),
            Err(Error::Parameter(_))
        ));
    }

    #[test]
    fn empty_names_are_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let set = vec![Migration::with_version(Version::from(1), " ", "SELECT 1;")];
        assert!(matches!(
            Migrator::new(&conn, set),
            Err(Error::Parameter(_))
        ));
    }

    #[test]
    fn plan_up_is_ascending_and_bounded() {
        let conn = Connection::open_in_memory().unwrap();
        let mut set = migrations();
        set.reverse();
        let migrator = Migrator::new(&conn, set).unwrap();

        let plan = migrator.plan(Target::Version(v("2"))).unwrap();
        assert_eq!(plan.direction, Direction::Up);
        assert_eq!(plan.current, None);
        assert_eq!(versions(&plan.steps), vec!["1", "2"]);

        let plan = migrator.plan(Target::Latest).unwrap();
        assert_eq!(versions(&plan.steps), vec!["1", "2", "3"]);
    }

    #[test]
    fn plan_down_is_descending_and_excludes_target() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn, migrations()).unwrap();
        migrator.migrate_to_latest().unwrap();

        let plan = migrator.plan(Target::Version(v("1"))).unwrap();
        assert_eq!(plan.direction, Direction::Down);
        assert_eq!(versions(&plan.steps), vec!["3", "2"]);

        let plan = migrator.plan(Target::Base).unwrap();
        assert_eq!(versions(&plan.steps), vec!["3", "2", "1"]);
    }

    #[test]
    fn plan_does_not_write_history() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn, migrations()).unwrap();
        migrator.plan(Target::Latest).unwrap();
        assert!(migrator.history().unwrap().is_empty());
    }

    #[test]
    fn migrate_up_then_partially_down() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn, migrations()).unwrap();

        let report = migrator.migrate_to_latest().unwrap();
        assert_eq!(report.direction, Direction::Up);
        assert_eq!(versions(&report.applied), vec!["1", "2", "3"]);
        assert!(report.applied.iter().all(|m| m.ran_at.is_some()));
        assert_eq!(migrator.current_version().unwrap(), Some(v("3")));

        let report = migrator.migrate_to(Target::Version(v("1"))).unwrap();
        assert_eq!(report.direction, Direction::Down);
        assert_eq!(versions(&report.applied), vec!["3", "2"]);
        assert_eq!(migrator.current_version().unwrap(), Some(v("1")));
        assert_eq!(versions(&migrator.history().unwrap()), vec!["1"]);
    }

    #[test]
    fn latest_with_nothing_pending_is_a_noop() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn, migrations()).unwrap();
        migrator.migrate_to_latest().unwrap();

        let report = migrator.migrate_to_latest().unwrap();
        assert!(report.is_noop());
        assert_eq!(report.from, Some(v("3")));
    }

    #[test]
    fn placeholder_sees_schema_version_before_each_step() {
        let conn = Connection::open_in_memory().unwrap();
        let set = vec![
            Migration::new(
                "1_marker.sql",
                "CREATE TABLE marker (next INTEGER);
                 INSERT INTO marker VALUES ({{incremented_schema_version}});",
            )
            .unwrap(),
        ];
        let before: i64 = conn
            .query_row("PRAGMA schema_version", [], |row| row.get(0))
            .unwrap();
        let migrator = Migrator::new(&conn, set).unwrap();
        // Creating the history table bumps the schema version too.
        let expected = {
            migrator.current_version().unwrap();
            let after_history: i64 = conn
                .query_row("PRAGMA schema_version", [], |row| row.get(0))
                .unwrap();
            assert!(after_history > before);
            after_history + 1
        };

        migrator.migrate_to_latest().unwrap();
        let next: i64 = conn
            .query_row("SELECT next FROM marker", [], |row| row.get(0))
            .unwrap();
        assert_eq!(next, expected);
    }

    #[test]
    fn drift_is_reported_for_changed_scripts() {
        let conn = Connection::open_in_memory().unwrap();
        Migrator::new(&conn, migrations())
            .unwrap()
            .migrate_to_latest()
            .unwrap();

        let mut edited = migrations();
        edited[1].sql.push_str("\n-- tweaked");
        let migrator = Migrator::new(&conn, edited).unwrap();
        assert_eq!(migrator.drifted().unwrap(), vec![v("2")]);
    }

    #[test]
    fn execution_error_aborts_and_records_failure() {
        let conn = Connection::open_in_memory().unwrap();
        let mut set = migrations();
        set[1].sql = "CREATE TABLE broken (;".into();
        let migrator = Migrator::new(&conn, set).unwrap();

        let failure = migrator.migrate_to_latest().unwrap_err();
        assert!(matches!(failure.error, Error::Execution(_)));
        assert_eq!(versions(&failure.applied), vec!["1"]);
        let failed = failure.failed.as_ref().unwrap();
        assert_eq!(failed.version, v("2"));
        assert!(failed.failed());
        assert!(failure.backup.is_none());
        assert!(failure.to_string().starts_with("migration 2 (2_posts.sql) failed"));

        let history = migrator.history().unwrap();
        assert_eq!(versions(&history), vec!["1", "2"]);
        assert!(history[1].failed());
        assert_eq!(migrator.current_version().unwrap(), Some(v("1")));
    }

    #[test]
    fn history_write_failure_after_clean_step_keeps_error_unset() {
        let conn = Connection::open_in_memory().unwrap();
        let mut set = migrations();
        set[1].sql = "<UP>CREATE TABLE posts (id INTEGER PRIMARY KEY); DROP TABLE _migrations;</UP>
                      <DOWN>DROP TABLE posts;</DOWN>"
            .into();
        let migrator = Migrator::new(&conn, set).unwrap();

        let failure = migrator.migrate_to_latest().unwrap_err();
        assert!(matches!(failure.error, Error::Database(_)));
        assert_eq!(versions(&failure.applied), vec!["1"]);
        let failed = failure.failed.as_ref().unwrap();
        assert_eq!(failed.version, v("2"));
        assert!(!failed.failed());

        let posts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'posts'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(posts, 1);
    }

    #[test]
    fn long_and_close_versions_survive_history_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        let set = vec![
            Migration::new("1.00000000000000001_a.sql", "CREATE TABLE a (x INTEGER);").unwrap(),
            Migration::new("1.00000000000000002_b.sql", "CREATE TABLE b (x INTEGER);").unwrap(),
            Migration::new("20240101120000123456789_c.sql", "CREATE TABLE c (x INTEGER);")
                .unwrap(),
        ];
        let migrator = Migrator::new(&conn, set).unwrap();

        assert_eq!(migrator.migrate_to_latest().unwrap().applied.len(), 3);
        assert_eq!(
            versions(&migrator.history().unwrap()),
            vec![
                "1.00000000000000001",
                "1.00000000000000002",
                "20240101120000123456789"
            ]
        );
        assert_eq!(
            migrator.current_version().unwrap(),
            Some(v("20240101120000123456789"))
        );
        assert!(migrator.migrate_to_latest().unwrap().is_noop());
    }

    #[test]
    fn target_display() {
        assert_eq!(Target::Base.to_string(), "base");
        assert_eq!(Target::Latest.to_string(), "latest");
        assert_eq!(Target::from(v("1.5")).to_string(), "1.5");
        assert_eq!(Target::default(), Target::Latest);
    }
}
