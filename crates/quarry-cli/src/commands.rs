use std::path::Path;

use anyhow::{Context, Result};
use quarry_config::AppConfig;
use quarry_db::{
    BackupManager, Direction, DirectorySource, HistoryStore, Migration, Migrator, Target, Version,
    process_sql,
};
use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::status::{StatusSummary, print_status};

pub fn target_from(to: Option<Version>, base: bool) -> Target {
    match (to, base) {
        (_, true) => Target::Base,
        (Some(version), false) => Target::Version(version),
        (None, false) => Target::Latest,
    }
}

/// Open the configured database and apply connection pragmas.
pub fn open_database(config: &AppConfig) -> Result<Connection> {
    let conn = match &config.database.path {
        Some(path) => {
            info!("opening database at {}", path.display());
            Connection::open(path)
                .with_context(|| format!("failed to open database {}", path.display()))?
        }
        None => {
            info!("no database path configured, using an in-memory database");
            Connection::open_in_memory().context("failed to open in-memory database")?
        }
    };

    let foreign_keys = if config.database.foreign_keys {
        "ON"
    } else {
        "OFF"
    };
    conn.pragma_update(None, "foreign_keys", foreign_keys)
        .context("failed to set foreign_keys pragma")?;
    if let Some(mode) = &config.database.journal_mode {
        // journal_mode answers with the resulting mode, so it has to be read back.
        let applied: String = conn
            .pragma_update_and_check(None, "journal_mode", mode, |row| row.get(0))
            .context("failed to set journal_mode pragma")?;
        info!("journal mode: {applied}");
    }
    Ok(conn)
}

fn build_migrator<'c>(conn: &'c Connection, config: &AppConfig) -> Result<Migrator<'c>> {
    let source = DirectorySource::new(&config.migrations.dir)
        .with_extension(config.migrations.extension.as_str());
    let history = HistoryStore::with_table(config.migrations.history_table.as_str())?;
    let backups = if config.backup.enabled {
        BackupManager::with_extension(config.backup.extension.as_str())?
    } else {
        BackupManager::disabled()
    };

    let migrator = Migrator::from_source(conn, &source)
        .with_context(|| format!("failed to load migrations from {}", source.dir().display()))?
        .with_history(history)
        .with_backups(backups);
    Ok(migrator)
}

pub fn migrate(config: &AppConfig, target: Target, dry_run: bool) -> Result<()> {
    let conn = open_database(config)?;
    let migrator = build_migrator(&conn, config)?;

    if dry_run {
        let plan = migrator.plan(target)?;
        println!(
            "current version: {}",
            display_version(plan.current.as_ref())
        );
        if plan.is_noop() {
            println!("nothing to do for target {}", plan.target);
            return Ok(());
        }
        println!("would migrate {} to {}:", plan.direction, plan.target);
        for step in &plan.steps {
            println!("  {:>10}  {}", step.version.to_string(), step.name);
        }
        return Ok(());
    }

    match migrator.migrate_to(target) {
        Ok(report) if report.is_noop() => {
            println!(
                "already at version {}",
                display_version(report.from.as_ref())
            );
            Ok(())
        }
        Ok(report) => {
            for m in &report.applied {
                println!("{} {:>10}  {}", arrow(report.direction), m.version.to_string(), m.name);
            }
            println!(
                "now at version {}",
                display_version(migrator.current_version()?.as_ref())
            );
            Ok(())
        }
        Err(failure) => {
            for m in &failure.applied {
                println!("  ok {:>10}  {}", m.version.to_string(), m.name);
            }
            if let Some(m) = &failure.failed {
                eprintln!("FAILED {:>7}  {}", m.version.to_string(), m.name);
            }
            if let Some(backup) = &failure.backup {
                eprintln!("backup kept at {}", backup.display());
            }
            Err(failure.into())
        }
    }
}

pub fn status(config: &AppConfig) -> Result<()> {
    let conn = open_database(config)?;
    let migrator = build_migrator(&conn, config)?;

    let current = migrator.current_version()?;
    let pending = migrator.plan(Target::Latest)?.steps.len();
    let failed = migrator.history()?.into_iter().filter(Migration::failed).count();

    let summary = StatusSummary {
        database: config
            .database
            .path
            .as_ref()
            .map_or_else(|| ":memory:".to_string(), |p| p.display().to_string()),
        migrations_dir: config.migrations.dir.display().to_string(),
        current: display_version(current.as_ref()),
        latest: display_version(migrator.latest_version()),
        available: migrator.migrations().len(),
        pending,
        failed,
        drifted: migrator
            .drifted()?
            .iter()
            .map(Version::to_string)
            .collect(),
    };
    print_status(&summary);
    Ok(())
}

#[derive(Serialize)]
struct HistoryLine<'a> {
    version: &'a Version,
    name: &'a str,
    ran_at: Option<String>,
    ok: bool,
    error: Option<&'a str>,
}

pub fn history(config: &AppConfig, json: bool) -> Result<()> {
    let conn = open_database(config)?;
    let store = HistoryStore::with_table(config.migrations.history_table.as_str())?;
    store.ensure_table(&conn)?;
    let entries = store.entries(&conn)?;

    let lines: Vec<HistoryLine<'_>> = entries
        .iter()
        .map(|m| HistoryLine {
            version: &m.version,
            name: &m.name,
            ran_at: m.ran_at.map(|t| t.to_rfc3339()),
            ok: !m.failed(),
            error: m.error.as_deref().filter(|e| !e.is_empty()),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&lines)?);
        return Ok(());
    }

    if lines.is_empty() {
        println!("no migrations recorded");
        return Ok(());
    }
    for line in &lines {
        let when = line.ran_at.as_deref().unwrap_or("-");
        let state = if line.ok { "ok" } else { "FAILED" };
        println!(
            "{:>10}  {:<25}  {:<6}  {}",
            line.version.to_string(),
            when,
            state,
            line.name
        );
        if let Some(error) = line.error {
            for detail in error.lines() {
                println!("{:>12}{detail}", "");
            }
        }
    }
    Ok(())
}

pub fn render(file: &Path, down: bool, schema_version: i64) -> Result<()> {
    let sql = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let direction = if down { Direction::Down } else { Direction::Up };
    print!("{}", process_sql(&sql, direction, schema_version));
    Ok(())
}

fn arrow(direction: Direction) -> &'static str {
    match direction {
        Direction::Up => "up  ",
        Direction::Down => "down",
    }
}

fn display_version(version: Option<&Version>) -> String {
    version.map_or_else(|| "none".to_string(), Version::to_string)
}
