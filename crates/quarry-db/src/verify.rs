use quarry_common::{Error, Result};
use rusqlite::Connection;
use serde::Serialize;

/// One row reported by `PRAGMA foreign_key_check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyFailure {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
    pub fkid: i64,
}

/// Run `PRAGMA integrity_check`; anything but a single `ok` row is a violation.
pub fn check_integrity(conn: &Connection) -> Result<()> {
    let mut stmt = conn
        .prepare("PRAGMA integrity_check")
        .map_err(|e| Error::Database(format!("failed to prepare integrity check: {e}")))?;

    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| Error::Database(format!("integrity check failed to run: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Database(format!("failed to read integrity check rows: {e}")))?;

    match rows.as_slice() {
        [only] if only.eq_ignore_ascii_case("ok") => Ok(()),
        _ => Err(Error::IntegrityViolation {
            details: rows.join("\n"),
        }),
    }
}

/// Run `PRAGMA foreign_key_check`; any returned row is a violation.
pub fn check_foreign_keys(conn: &Connection) -> Result<()> {
    let failures = foreign_key_failures(conn)?;
    if failures.is_empty() {
        return Ok(());
    }

    let mut lines = Vec::with_capacity(failures.len());
    for failure in &failures {
        lines.push(serde_json::to_string(failure)?);
    }
    Err(Error::ForeignKeyViolation {
        details: lines.join("\n"),
    })
}

pub fn foreign_key_failures(conn: &Connection) -> Result<Vec<ForeignKeyFailure>> {
    let mut stmt = conn
        .prepare("PRAGMA foreign_key_check")
        .map_err(|e| Error::Database(format!("failed to prepare foreign key check: {e}")))?;

    let rows = stmt
        .query_map([], |row| {
            Ok(ForeignKeyFailure {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fkid: row.get(3)?,
            })
        })
        .map_err(|e| Error::Database(format!("foreign key check failed to run: {e}")))?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Database(format!("failed to read foreign key check rows: {e}")))
}
