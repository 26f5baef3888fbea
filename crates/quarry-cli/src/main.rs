mod commands;
mod status;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use quarry_config::{AppConfig, ConfigLoader};
use quarry_db::Version;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quarry", version, about = "Versioned SQLite migrations")]
struct Cli {
    /// Config file (defaults to ./quarry.toml, ./quarry.yml or the user config dir)
    #[arg(long, global = true, env = "QUARRY_CONFIG")]
    config: Option<PathBuf>,

    /// Database file; overrides `database.path`
    #[arg(long, global = true, env = "QUARRY_DATABASE")]
    database: Option<PathBuf>,

    /// Directory holding the migration scripts; overrides `migrations.dir`
    #[arg(long, global = true, env = "QUARRY_MIGRATIONS")]
    migrations: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Migrate the database up or down to a version (latest by default)
    Migrate {
        /// Target version
        #[arg(long, conflicts_with = "base")]
        to: Option<Version>,

        /// Roll back every migration
        #[arg(long)]
        base: bool,

        /// Print the plan without executing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Show current and available versions
    Status,
    /// List recorded migration attempts
    History {
        #[arg(long)]
        json: bool,
    },
    /// Print the SQL a script would execute
    Render {
        file: PathBuf,

        /// Render the rollback direction
        #[arg(long)]
        down: bool,

        /// Schema version the placeholder is derived from
        #[arg(long, default_value_t = 0)]
        schema_version: i64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::default().load(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli);
    init_tracing(&config, cli.verbose);

    match cli.command {
        Command::Migrate { to, base, dry_run } => {
            commands::migrate(&config, commands::target_from(to, base), dry_run)
        }
        Command::Status => commands::status(&config),
        Command::History { json } => commands::history(&config, json),
        Command::Render {
            file,
            down,
            schema_version,
        } => commands::render(&file, down, schema_version),
    }
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(db) = &cli.database {
        config.database.path = Some(db.clone());
    }
    if let Some(dir) = &cli.migrations {
        config.migrations.dir = dir.clone();
    }
    if cli.json_logs {
        config.logging.json = true;
    }
}

fn init_tracing(config: &AppConfig, verbose: bool) {
    let default_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}
