pub mod backup;
pub mod directives;
pub mod history;
pub mod migrator;
pub mod source;
pub mod verify;
pub mod version;

pub use backup::{Backup, BackupManager};
pub use directives::{Direction, SCHEMA_VERSION_PLACEHOLDER, process_sql};
pub use history::HistoryStore;
pub use migrator::{MigrationFailure, MigrationPlan, MigrationReport, Migrator, Target};
pub use source::{DirectorySource, Migration, MigrationSource, StaticSource};
pub use verify::{ForeignKeyFailure, check_foreign_keys, check_integrity};
pub use version::{Version, parse_version};
