use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use quarry_common::{Error, Result};
use rusqlite::ToSql;
use rusqlite::types::ToSqlOutput;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An exact, non-negative decimal migration version.
///
/// Stored as normalized digit strings so that versions derived from
/// timestamp-style names never overflow and `1.10` compares equal to `1.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    whole: String,
    frac: String,
}

impl Version {
    fn from_parts(whole: &str, frac: &str) -> Self {
        let whole = whole.trim_start_matches('0');
        Self {
            whole: if whole.is_empty() { "0" } else { whole }.to_string(),
            frac: frac.trim_end_matches('0').to_string(),
        }
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self::from_parts(&value.to_string(), "")
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.whole
            .len()
            .cmp(&other.whole.len())
            .then_with(|| self.whole.cmp(&other.whole))
            // Trailing zeros are stripped, so digit-wise comparison is numeric.
            .then_with(|| self.frac.cmp(&other.frac))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frac.is_empty() {
            f.write_str(&self.whole)
        } else {
            write!(f, "{}.{}", self.whole, self.frac)
        }
    }
}

/// Parse the version encoded at the start of a migration name.
///
/// Consumes leading digits, allowing a single `.` once a digit has been seen,
/// and ignores everything from the first character that does not fit.
/// `0001.1.create_tables.sql` yields `1.1`.
pub fn parse_version(name: &str) -> Result<Version> {
    let mut end = 0;
    let mut dot = None;
    for (idx, c) in name.char_indices() {
        if c.is_ascii_digit() {
            end = idx + 1;
        } else if c == '.' && dot.is_none() && end > 0 {
            dot = Some(idx);
            end = idx + 1;
        } else {
            break;
        }
    }

    if end == 0 {
        return Err(Error::Format {
            name: name.to_string(),
            reason: "name does not start with a version number".into(),
        });
    }

    let captured = &name[..end];
    let (whole, frac) = match dot {
        Some(idx) => (&captured[..idx], &captured[idx + 1..]),
        None => (captured, ""),
    };
    Ok(Version::from_parts(whole, frac))
}

impl FromStr for Version {
    type Err = Error;

    /// Strict parse: the whole input must be a decimal number.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let version = parse_version(trimmed)?;
        let consumed = trimmed
            .char_indices()
            .take_while(|(_, c)| c.is_ascii_digit() || *c == '.')
            .count();
        if consumed != trimmed.len() || trimmed.matches('.').count() > 1 {
            return Err(Error::Format {
                name: s.to_string(),
                reason: "not a decimal number".into(),
            });
        }
        Ok(version)
    }
}

/// Bound as canonical decimal text, never as a number.
impl ToSql for Version {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
