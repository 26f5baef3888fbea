use chrono::{DateTime, Utc};
use quarry_common::{Error, Result};
use rusqlite::{Connection, params};
use tracing::debug;

use crate::directives::Direction;
use crate::source::Migration;
use crate::version::Version;

pub const DEFAULT_HISTORY_TABLE: &str = "_migrations";

/// Ledger of migration attempts, one row per version.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    table: String,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self {
            table: DEFAULT_HISTORY_TABLE.to_string(),
        }
    }
}

impl HistoryStore {
    /// Use a custom table name. Only ASCII letters, digits and `_` are allowed.
    pub fn with_table(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        let valid = !table.is_empty()
            && !table.starts_with(|c: char| c.is_ascii_digit())
            && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(Error::Parameter(format!(
                "invalid history table name {table:?}"
            )));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Versions are kept as canonical decimal text. A numeric column would
    /// round long or very precise versions through REAL.
    pub fn ensure_table(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS [{}] (
                version TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                ran_at TEXT NOT NULL,
                sql TEXT,
                error TEXT
            );",
            self.table
        ))
        .map_err(|e| Error::Database(format!("failed to create history table: {e}")))
    }

    /// Highest version recorded without an error, `None` if nothing applied.
    pub fn current_version(&self, conn: &Connection) -> Result<Option<Version>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT CAST(version AS TEXT) FROM [{}] WHERE error IS NULL OR error = ''",
                self.table
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Database(format!("failed to query history: {e}")))?;

        let mut current: Option<Version> = None;
        for row in rows {
            let raw = row.map_err(|e| Error::Database(format!("failed to read history row: {e}")))?;
            let version = parse_stored_version(&raw)?;
            if current.as_ref().is_none_or(|c| version > *c) {
                current = Some(version);
            }
        }
        Ok(current)
    }

    /// Replace the row for `migration.version`. The new row is written when
    /// the attempt failed or ran up; a clean rollback leaves no row.
    pub fn record(&self, conn: &Connection, migration: &Migration, direction: Direction) -> Result<()> {
        conn.execute(
            &format!("DELETE FROM [{}] WHERE version = ?1", self.table),
            params![migration.version],
        )
        .map_err(|e| Error::Database(format!("failed to clear history row: {e}")))?;

        if !migration.failed() && direction == Direction::Down {
            debug!("history row for {} removed after rollback", migration.version);
            return Ok(());
        }

        let ran_at = migration.ran_at.unwrap_or_else(Utc::now);
        conn.execute(
            &format!(
                "INSERT INTO [{}] (version, name, ran_at, sql, error) VALUES (?1, ?2, ?3, ?4, ?5)",
                self.table
            ),
            params![
                migration.version,
                migration.name,
                ran_at.to_rfc3339(),
                migration.sql,
                migration.error,
            ],
        )
        .map_err(|e| Error::Database(format!("failed to write history row: {e}")))?;
        Ok(())
    }

    /// All recorded attempts ordered by version.
    pub fn entries(&self, conn: &Connection) -> Result<Vec<Migration>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT CAST(version AS TEXT), name, ran_at, sql, error FROM [{}]",
                self.table
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(|e| Error::Database(format!("failed to query history: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            let (version, name, ran_at, sql, error) =
                row.map_err(|e| Error::Database(format!("failed to read history row: {e}")))?;
            entries.push(Migration {
                version: parse_stored_version(&version)?,
                name,
                sql: sql.unwrap_or_default(),
                ran_at: Some(parse_datetime(&ran_at)),
                error,
            });
        }
        entries.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(entries)
    }
}

fn parse_stored_version(raw: &str) -> Result<Version> {
    raw.parse()
        .map_err(|e| Error::Database(format!("unreadable version {raw:?} in history: {e}")))
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // Rows written by hand through sqlite's datetime('now')
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}
