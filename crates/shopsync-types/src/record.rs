//! Raw and normalized record types.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::dataset::DatasetKind;
use crate::schema::ColumnType;
use crate::watermark::{canonical_timestamp, parse_timestamp, CursorKind, Watermark};

/// A record exactly as the source returned it.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// A destination-typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Absent or unparsable value.
    Null,
    String(String),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    /// Repeated or structured value kept whole (arrays without a child table).
    Json(serde_json::Value),
}

impl FieldValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Destination column type of this value; `None` for nulls.
    #[must_use]
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Self::Null => None,
            Self::String(_) => Some(ColumnType::String),
            Self::Int64(_) => Some(ColumnType::Int64),
            Self::Float64(_) => Some(ColumnType::Float64),
            Self::Bool(_) => Some(ColumnType::Bool),
            Self::Timestamp(_) => Some(ColumnType::Timestamp),
            Self::Json(_) => Some(ColumnType::Json),
        }
    }

    /// Render as a tabular cell. Nulls render as the empty string.
    #[must_use]
    pub fn to_cell(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::String(s) => s.clone(),
            Self::Int64(v) => v.to_string(),
            Self::Float64(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Timestamp(ts) => canonical_timestamp(ts),
            Self::Json(v) => v.to_string(),
        }
    }

    /// Parse a tabular cell back into a value of `column_type`.
    ///
    /// Empty cells and cells that do not parse as the column type become
    /// [`FieldValue::Null`].
    #[must_use]
    pub fn from_cell(column_type: ColumnType, cell: &str) -> Self {
        if cell.is_empty() {
            return Self::Null;
        }
        let parsed = match column_type {
            ColumnType::String => Some(Self::String(cell.to_string())),
            ColumnType::Int64 => cell.parse().ok().map(Self::Int64),
            ColumnType::Float64 => cell.parse().ok().map(Self::Float64),
            ColumnType::Bool => cell.parse().ok().map(Self::Bool),
            ColumnType::Timestamp => parse_timestamp(cell).map(Self::Timestamp),
            ColumnType::Json => serde_json::from_str(cell).ok().map(Self::Json),
        };
        parsed.unwrap_or(Self::Null)
    }

    /// Convert into a value a `column_type` column stores.
    ///
    /// Integers widen to floats, anything goes into a string column as its
    /// cell text. Values that cannot be represented become null.
    #[must_use]
    pub fn conform(self, column_type: ColumnType) -> Self {
        if self.column_type().map_or(true, |ty| ty == column_type) {
            return self;
        }
        match self {
            Self::Int64(v) if column_type == ColumnType::Float64 => {
                #[allow(clippy::cast_precision_loss)]
                let v = v as f64;
                Self::Float64(v)
            }
            other => Self::from_cell(column_type, &other.to_cell()),
        }
    }

    /// Interpret the value as a primary key.
    ///
    /// Only integers and non-empty strings identify a row.
    #[must_use]
    pub fn as_key(&self) -> Option<KeyValue> {
        match self {
            Self::Int64(v) => Some(KeyValue::Int(*v)),
            Self::String(s) if !s.is_empty() => Some(KeyValue::Str(s.clone())),
            _ => None,
        }
    }
}

/// Primary key value of a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Int(i64),
    Str(String),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// A flat, destination-safe row: normalized column name to typed value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl NormalizedRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: FieldValue) {
        self.fields.insert(column.into(), value);
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields.get(column)
    }

    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Primary key of this row, if the key column holds a usable value.
    #[must_use]
    pub fn key(&self, column: &str) -> Option<KeyValue> {
        self.get(column).and_then(FieldValue::as_key)
    }

    /// Cursor value of this row for a dataset's cursor column.
    #[must_use]
    pub fn cursor(&self, column: &str, kind: CursorKind) -> Option<Watermark> {
        match (self.get(column)?, kind) {
            (FieldValue::Timestamp(value), CursorKind::Timestamp) => {
                Some(Watermark::Timestamp { value: *value })
            }
            (FieldValue::Int64(value), CursorKind::Int64) => Some(Watermark::Int64 { value: *value }),
            (FieldValue::String(s), kind) => {
                Watermark::from_json(kind, &serde_json::Value::String(s.clone()))
            }
            (FieldValue::Int64(value), CursorKind::Utf8) => Some(Watermark::Utf8 {
                value: value.to_string(),
            }),
            _ => None,
        }
    }
}

impl FromIterator<(String, FieldValue)> for NormalizedRecord {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for NormalizedRecord {
    type Item = (String, FieldValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// A normalized record tagged with its dataset shape.
///
/// Constructed by the normalizer once a raw record has been flattened,
/// renamed and type-coerced; every variant exposes the same
/// [`NormalizedRecord`] interface.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Order(NormalizedRecord),
    Customer(NormalizedRecord),
    Product(NormalizedRecord),
}

impl Record {
    #[must_use]
    pub fn new(kind: DatasetKind, row: NormalizedRecord) -> Self {
        match kind {
            DatasetKind::Orders => Self::Order(row),
            DatasetKind::Customers => Self::Customer(row),
            DatasetKind::Products => Self::Product(row),
        }
    }

    #[must_use]
    pub fn kind(&self) -> DatasetKind {
        match self {
            Self::Order(_) => DatasetKind::Orders,
            Self::Customer(_) => DatasetKind::Customers,
            Self::Product(_) => DatasetKind::Products,
        }
    }

    #[must_use]
    pub fn row(&self) -> &NormalizedRecord {
        match self {
            Self::Order(row) | Self::Customer(row) | Self::Product(row) => row,
        }
    }

    /// Primary key of the wrapped row.
    #[must_use]
    pub fn primary_key(&self, column: &str) -> Option<KeyValue> {
        self.row().key(column)
    }

    #[must_use]
    pub fn cursor(&self, column: &str, kind: CursorKind) -> Option<Watermark> {
        self.row().cursor(column, kind)
    }

    #[must_use]
    pub fn into_row(self) -> NormalizedRecord {
        match self {
            Self::Order(row) | Self::Customer(row) | Self::Product(row) => row,
        }
    }
}
