use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Token replaced with the database's schema version plus one.
pub const SCHEMA_VERSION_PLACEHOLDER: &str = "{{incremented_schema_version}}";

static UP_BLOCK: LazyLock<Regex> = LazyLock::new(|| block_regex("UP"));
static DOWN_BLOCK: LazyLock<Regex> = LazyLock::new(|| block_regex("DOWN"));

fn block_regex(tag: &str) -> Regex {
    // Case-insensitive, `.` spans newlines, lazy body so repeated blocks stay separate.
    // Only called with the fixed tags above; `directive_patterns_compile` covers both.
    Regex::new(&format!(r"(?is)<{tag}>(.*?)</{tag}>")).expect("static directive pattern")
}

/// Direction a migration run traverses the version order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    fn blocks(self) -> (&'static Regex, &'static Regex) {
        match self {
            Direction::Up => (&*UP_BLOCK, &*DOWN_BLOCK),
            Direction::Down => (&*DOWN_BLOCK, &*UP_BLOCK),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// Produce the SQL to execute for `direction`.
///
/// Blocks tagged for the other direction are dropped with their content,
/// blocks tagged for this direction are unwrapped, untagged text is kept, and
/// every placeholder becomes `schema_version + 1`. Both regex passes build a
/// fresh buffer left to right, so match positions are never invalidated.
pub fn process_sql(sql: &str, direction: Direction, schema_version: i64) -> String {
    let (keep, drop) = direction.blocks();

    let without_other = drop.replace_all(sql, "");
    let unwrapped = keep.replace_all(&without_other, "${1}");

    let incremented = schema_version.saturating_add(1).to_string();
    unwrapped.replace(SCHEMA_VERSION_PLACEHOLDER, &incremented)
}
