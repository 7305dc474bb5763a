//! Destination table schemas.
//!
//! A [`TableSchema`] is inferred from a normalized batch on first load and
//! stored by the warehouse. Later batches are checked against the stored
//! schema; the warehouse never alters an existing table.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dataset::FieldHint;
use crate::record::NormalizedRecord;

/// Destination column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Int64,
    Float64,
    Bool,
    Timestamp,
    /// Repeated or structured value stored as compact JSON.
    Json,
}

impl ColumnType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
            Self::Json => "json",
        }
    }

    /// Whether a column of this type can store values of `incoming` type.
    ///
    /// String columns take any value as its text.
    #[must_use]
    pub fn accepts(self, incoming: ColumnType) -> bool {
        self == incoming
            || self == Self::String
            || (self == Self::Float64 && incoming == Self::Int64)
    }

    /// Common type of two observed value types.
    #[must_use]
    pub fn widen(self, other: ColumnType) -> ColumnType {
        match (self, other) {
            (a, b) if a == b => a,
            (Self::Int64, Self::Float64) | (Self::Float64, Self::Int64) => Self::Float64,
            _ => Self::String,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FieldHint> for ColumnType {
    fn from(hint: FieldHint) -> Self {
        match hint {
            FieldHint::String => Self::String,
            FieldHint::Int64 => Self::Int64,
            FieldHint::Float64 => Self::Float64,
            FieldHint::Bool => Self::Bool,
            FieldHint::Timestamp => Self::Timestamp,
        }
    }
}

/// One column of a destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

/// Column layout and primary key of a destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
    pub primary_key: String,
}

impl TableSchema {
    /// Infer a schema from a normalized batch.
    ///
    /// Hinted columns take the hint's type. Otherwise the first non-null
    /// value decides, `Int64` widens to `Float64` and any other disagreement
    /// widens to `String`. All-null columns are `String`. The primary key
    /// comes first, remaining columns are sorted by name.
    #[must_use]
    pub fn infer(
        rows: &[NormalizedRecord],
        primary_key: &str,
        hints: &BTreeMap<String, FieldHint>,
    ) -> Self {
        let mut observed: BTreeMap<&str, Option<ColumnType>> = BTreeMap::new();
        for row in rows {
            for (name, value) in row.iter() {
                let slot = observed.entry(name.as_str()).or_insert(None);
                if let Some(ty) = value.column_type() {
                    *slot = Some(match *slot {
                        Some(seen) => seen.widen(ty),
                        None => ty,
                    });
                }
            }
        }
        observed.entry(primary_key).or_insert(None);

        let mut columns: Vec<ColumnSpec> = observed
            .into_iter()
            .map(|(name, ty)| {
                let column_type = hints
                    .get(name)
                    .map(|hint| ColumnType::from(*hint))
                    .or(ty)
                    .unwrap_or(ColumnType::String);
                ColumnSpec {
                    name: name.to_string(),
                    column_type,
                    nullable: name != primary_key,
                }
            })
            .collect();
        columns.sort_by(|a, b| {
            (a.name != primary_key, &a.name).cmp(&(b.name != primary_key, &b.name))
        });

        Self {
            columns,
            primary_key: primary_key.to_string(),
        }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Rewrite each value of `row` into its column's type.
    ///
    /// Columns unknown to this schema pass through unchanged.
    #[must_use]
    pub fn conform_row(&self, row: NormalizedRecord) -> NormalizedRecord {
        row.into_iter()
            .map(|(name, value)| match self.column(&name) {
                Some(spec) => {
                    let value = value.conform(spec.column_type);
                    (name, value)
                }
                None => (name, value),
            })
            .collect()
    }

    /// Check a batch against this (existing) table schema.
    ///
    /// Reports every batch column absent from the table and every column
    /// holding a value the table column cannot store. Table columns absent
    /// from the batch are fine. Each column is reported at most once.
    #[must_use]
    pub fn mismatches(&self, rows: &[NormalizedRecord]) -> Vec<FieldMismatch> {
        let mut found: BTreeMap<String, FieldMismatch> = BTreeMap::new();
        for row in rows {
            for (name, value) in row.iter() {
                if found.contains_key(name) {
                    continue;
                }
                let incoming = value.column_type();
                let kind = match (self.column(name), incoming) {
                    (None, _) => Some(MismatchKind::MissingColumn {
                        incoming: incoming.unwrap_or(ColumnType::String),
                    }),
                    (Some(spec), Some(ty)) if !spec.column_type.accepts(ty) => {
                        Some(MismatchKind::TypeChanged {
                            existing: spec.column_type,
                            incoming: ty,
                        })
                    }
                    _ => None,
                };
                if let Some(kind) = kind {
                    found.insert(
                        name.clone(),
                        FieldMismatch {
                            column: name.clone(),
                            kind,
                        },
                    );
                }
            }
        }
        found.into_values().collect()
    }
}

/// Why a batch column does not fit an existing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MismatchKind {
    MissingColumn {
        incoming: ColumnType,
    },
    TypeChanged {
        existing: ColumnType,
        incoming: ColumnType,
    },
}

/// One offending column of a schema mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMismatch {
    pub column: String,
    pub kind: MismatchKind,
}

impl fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MismatchKind::MissingColumn { incoming } => {
                write!(f, "new column '{}' ({incoming})", self.column)
            }
            MismatchKind::TypeChanged { existing, incoming } => write!(
                f,
                "column '{}' is {existing} in the table but {incoming} in the batch",
                self.column
            ),
        }
    }
}
