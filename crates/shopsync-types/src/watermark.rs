//! Watermark types for incremental extraction.
//!
//! A watermark marks the highest cursor value committed for a dataset so
//! that the next run can resume from where the previous one left off.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Data type of a dataset's cursor field.
///
/// Determines how cursor values are parsed out of records and rendered into
/// the source's "modified since" filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    /// 64-bit signed integer cursor (e.g. monotonically increasing ids).
    Int64,
    /// UTC timestamp cursor (e.g. `updated_at`).
    Timestamp,
    /// Opaque string cursor, compared lexicographically.
    Utf8,
}

/// Typed cursor position.
///
/// `Beginning` is the "never run" sentinel and sorts before every other
/// value. Values of different kinds are never compared in practice because a
/// dataset's cursor kind is fixed by its descriptor.
///
/// JSON form: `{"type": "timestamp", "value": "2024-01-15T10:00:00Z"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Watermark {
    /// Beginning of time: no record has been committed yet.
    #[default]
    Beginning,
    /// Integer position.
    Int64 { value: i64 },
    /// Timestamp position.
    Timestamp { value: DateTime<Utc> },
    /// Opaque string position.
    Utf8 { value: String },
}

impl Watermark {
    #[must_use]
    pub fn is_beginning(&self) -> bool {
        matches!(self, Self::Beginning)
    }

    /// Parse a cursor value of the given kind out of a JSON value.
    ///
    /// Returns `None` for nulls and values that cannot be interpreted as the
    /// requested kind.
    #[must_use]
    pub fn from_json(kind: CursorKind, value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;

        match (kind, value) {
            (_, Value::Null) => None,
            (CursorKind::Int64, Value::Number(n)) => n.as_i64().map(|value| Self::Int64 { value }),
            (CursorKind::Int64, Value::String(s)) => {
                s.trim().parse().ok().map(|value| Self::Int64 { value })
            }
            (CursorKind::Timestamp, Value::String(s)) => {
                parse_timestamp(s).map(|value| Self::Timestamp { value })
            }
            (CursorKind::Utf8, Value::String(s)) => Some(Self::Utf8 { value: s.clone() }),
            (CursorKind::Utf8, Value::Number(n)) => Some(Self::Utf8 {
                value: n.to_string(),
            }),
            _ => None,
        }
    }

    /// Render the watermark as a source filter value.
    ///
    /// Returns `None` for the sentinel, which means "no filter".
    #[must_use]
    pub fn filter_value(&self) -> Option<String> {
        match self {
            Self::Beginning => None,
            Self::Int64 { value } => Some(value.to_string()),
            Self::Timestamp { value } => Some(canonical_timestamp(value)),
            Self::Utf8 { value } => Some(value.clone()),
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.filter_value() {
            Some(value) => f.write_str(&value),
            None => f.write_str("<beginning>"),
        }
    }
}

/// Canonical timestamp rendering: RFC 3339, UTC, second precision, `Z` suffix.
#[must_use]
pub fn canonical_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse the timestamp shapes the source and staging files produce.
///
/// Accepts RFC 3339 with any offset, naive `YYYY-MM-DD HH:MM:SS` /
/// `YYYY-MM-DDTHH:MM:SS` (taken as UTC) and bare dates (midnight UTC).
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ndt.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}
