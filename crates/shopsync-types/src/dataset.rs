//! Dataset descriptors for the supported source datasets.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::watermark::CursorKind;

/// One of the datasets the pipeline knows how to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Orders,
    Customers,
    Products,
}

impl DatasetKind {
    /// Every supported dataset, in default run order.
    pub const ALL: [DatasetKind; 3] = [Self::Orders, Self::Customers, Self::Products];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Customers => "customers",
            Self::Products => "products",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "orders" => Ok(Self::Orders),
            "customers" => Ok(Self::Customers),
            "products" => Ok(Self::Products),
            other => Err(format!(
                "unknown dataset '{other}' (expected one of: orders, customers, products)"
            )),
        }
    }
}

/// Destination type hint for a normalized field.
///
/// Hints win over the JSON type of the raw value, so string-encoded prices
/// (`"12.50"`) land in a float column and ISO strings land in a timestamp
/// column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldHint {
    String,
    Int64,
    Float64,
    Bool,
    Timestamp,
}

/// Moves the elements of one array field into a joinable child table.
///
/// Arrays without a child-table spec are kept on the parent row as a
/// repeated (JSON) column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildTableSpec {
    /// Source field holding the array (e.g. `line_items`).
    pub field: String,
    /// Appended to the parent table name: `<table>_<suffix>`.
    pub table_suffix: String,
    /// Primary key of each child element.
    pub primary_key: String,
    /// Column on the child row that receives the parent's primary key.
    pub parent_column: String,
}

/// Immutable description of one supported dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub kind: DatasetKind,
    /// Endpoint path segment, e.g. `orders` for `/orders.json`.
    pub endpoint: String,
    /// JSON key holding the record array in a page response.
    pub response_key: String,
    pub primary_key: String,
    pub cursor_field: String,
    pub cursor_kind: CursorKind,
    /// Query parameter carrying the watermark on the first page request.
    pub since_param: String,
    /// Destination table name.
    pub table: String,
    /// Type hints keyed by normalized field name.
    #[serde(default)]
    pub field_hints: BTreeMap<String, FieldHint>,
    #[serde(default)]
    pub child_tables: Vec<ChildTableSpec>,
}

impl DatasetDescriptor {
    /// Built-in descriptor for a dataset.
    #[must_use]
    pub fn builtin(kind: DatasetKind) -> Self {
        let (table, hints): (&str, &[(&str, FieldHint)]) = match kind {
            DatasetKind::Orders => (
                "shopify_orders",
                &[
                    ("created_at", FieldHint::Timestamp),
                    ("updated_at", FieldHint::Timestamp),
                    ("processed_at", FieldHint::Timestamp),
                    ("cancelled_at", FieldHint::Timestamp),
                    ("closed_at", FieldHint::Timestamp),
                    ("total_price", FieldHint::Float64),
                    ("subtotal_price", FieldHint::Float64),
                    ("total_tax", FieldHint::Float64),
                    ("total_discounts", FieldHint::Float64),
                ],
            ),
            DatasetKind::Customers => (
                "shopify_customers",
                &[
                    ("created_at", FieldHint::Timestamp),
                    ("updated_at", FieldHint::Timestamp),
                    ("total_spent", FieldHint::Float64),
                    ("orders_count", FieldHint::Int64),
                    ("verified_email", FieldHint::Bool),
                ],
            ),
            DatasetKind::Products => (
                "shopify_products",
                &[
                    ("created_at", FieldHint::Timestamp),
                    ("updated_at", FieldHint::Timestamp),
                    ("published_at", FieldHint::Timestamp),
                ],
            ),
        };

        Self {
            kind,
            endpoint: kind.as_str().to_string(),
            response_key: kind.as_str().to_string(),
            primary_key: "id".to_string(),
            cursor_field: "updated_at".to_string(),
            cursor_kind: CursorKind::Timestamp,
            since_param: "updated_at_min".to_string(),
            table: table.to_string(),
            field_hints: hints
                .iter()
                .map(|(name, hint)| ((*name).to_string(), *hint))
                .collect(),
            child_tables: Vec::new(),
        }
    }

    /// Replace the destination table name.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Register a child table for one array field.
    #[must_use]
    pub fn with_child_table(mut self, spec: ChildTableSpec) -> Self {
        self.child_tables.retain(|c| c.field != spec.field);
        self.child_tables.push(spec);
        self
    }

    /// Fully qualified child table name for a spec.
    #[must_use]
    pub fn child_table_name(&self, spec: &ChildTableSpec) -> String {
        format!("{}_{}", self.table, spec.table_suffix)
    }
}
