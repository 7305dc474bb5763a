//! Schema normalization: raw nested records to flat, destination-safe rows.
//!
//! Nested objects flatten into `_`-joined column names. Arrays stay on the
//! row as JSON unless the descriptor moves them into a child table.
//! Column names are sanitized to the warehouse identifier charset; two
//! source fields landing on the same column are a [`NormalizeError::SchemaConflict`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::Value;
use shopsync_types::dataset::{ChildTableSpec, DatasetDescriptor, DatasetKind, FieldHint};
use shopsync_types::record::{FieldValue, NormalizedRecord, RawRecord, Record};
use shopsync_types::schema::TableSchema;
use shopsync_types::watermark::{parse_timestamp, Watermark};

use crate::staging::{ChildBatch, StagedBatch};

/// Longest identifier the warehouse accepts.
pub const MAX_IDENTIFIER_LEN: usize = 300;

/// Column holding scalar array elements in a child table.
const SCALAR_ELEMENT_COLUMN: &str = "value";

/// Rewrite a name into the warehouse identifier charset.
///
/// Lowercase ASCII, `[a-z0-9_]` only, no leading or trailing `_`, a `_`
/// prefix before a leading digit, `_unnamed` for names with nothing left,
/// at most [`MAX_IDENTIFIER_LEN`] characters.
#[must_use]
pub fn sanitize_identifier(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = replaced.trim_matches('_');
    let mut name = if trimmed.is_empty() {
        "_unnamed".to_string()
    } else if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{trimmed}")
    } else {
        trimmed.to_string()
    };
    name.truncate(MAX_IDENTIFIER_LEN);
    name
}

/// Two source fields that normalize to the same column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NameConflict {
    pub table: String,
    pub column: String,
    pub first: String,
    pub second: String,
}

impl NameConflict {
    fn new(table: &str, column: &str, a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self {
            table: table.to_string(),
            column: column.to_string(),
            first: first.to_string(),
            second: second.to_string(),
        }
    }
}

impl fmt::Display for NameConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' and '{}' both map to {}.{}",
            self.first, self.second, self.table, self.column
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("schema conflict in {dataset}: {}", join_conflicts(.conflicts))]
    SchemaConflict {
        dataset: DatasetKind,
        conflicts: Vec<NameConflict>,
    },
}

fn join_conflicts(conflicts: &[NameConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// One normalized source record: the parent row plus its child-table rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub record: Record,
    /// `(child table name, row)` pairs, in source order.
    pub children: Vec<(String, NormalizedRecord)>,
}

/// Column name to source path, per table, for one record.
type ColumnOrigins = Vec<(String, String, String)>;

/// Normalize a single raw record.
///
/// # Errors
///
/// Returns [`NormalizeError::SchemaConflict`] if two fields of this record
/// normalize to the same column.
pub fn normalize(descriptor: &DatasetDescriptor, raw: &RawRecord) -> Result<Normalized, NormalizeError> {
    let (normalized, _, conflicts) = normalize_traced(descriptor, raw);
    if conflicts.is_empty() {
        Ok(normalized)
    } else {
        Err(NormalizeError::SchemaConflict {
            dataset: descriptor.kind,
            conflicts: conflicts.into_iter().collect(),
        })
    }
}

/// Normalize a whole extracted batch into a staged batch.
///
/// Column mappings are checked across the batch: a column must come from
/// the same source path in every record. Each conflicting pair is reported
/// once.
///
/// # Errors
///
/// Returns [`NormalizeError::SchemaConflict`] listing every conflicting pair.
pub fn normalize_batch(
    descriptor: &DatasetDescriptor,
    raws: &[RawRecord],
    candidate_watermark: Watermark,
) -> Result<StagedBatch, NormalizeError> {
    let mut conflicts: BTreeSet<NameConflict> = BTreeSet::new();
    let mut origins: BTreeMap<(String, String), String> = BTreeMap::new();
    let mut records = Vec::with_capacity(raws.len());
    let mut child_rows: BTreeMap<String, Vec<NormalizedRecord>> = BTreeMap::new();

    for raw in raws {
        let (normalized, record_origins, record_conflicts) = normalize_traced(descriptor, raw);
        conflicts.extend(record_conflicts);
        for (table, column, path) in record_origins {
            match origins.get(&(table.clone(), column.clone())) {
                Some(existing) if *existing != path => {
                    conflicts.insert(NameConflict::new(&table, &column, existing, &path));
                }
                Some(_) => {}
                None => {
                    origins.insert((table, column), path);
                }
            }
        }
        for (table, row) in normalized.children {
            child_rows.entry(table).or_default().push(row);
        }
        records.push(normalized.record);
    }

    if !conflicts.is_empty() {
        return Err(NormalizeError::SchemaConflict {
            dataset: descriptor.kind,
            conflicts: conflicts.into_iter().collect(),
        });
    }

    let rows: Vec<NormalizedRecord> = records.into_iter().map(Record::into_row).collect();
    let schema = TableSchema::infer(&rows, &descriptor.primary_key, &descriptor.field_hints);
    let records = rows
        .into_iter()
        .map(|row| Record::new(descriptor.kind, schema.conform_row(row)))
        .collect();

    let no_hints = BTreeMap::new();
    let children = descriptor
        .child_tables
        .iter()
        .filter_map(|spec| {
            let table = descriptor.child_table_name(spec);
            let rows = child_rows.remove(&table)?;
            let schema = TableSchema::infer(&rows, &spec.primary_key, &no_hints);
            let rows = rows.into_iter().map(|row| schema.conform_row(row)).collect();
            Some(ChildBatch {
                schema,
                spec: spec.clone(),
                table,
                rows,
            })
        })
        .collect();

    Ok(StagedBatch {
        dataset: descriptor.kind,
        table: descriptor.table.clone(),
        schema,
        records,
        children,
        candidate_watermark,
    })
}

/// Leaf value of a flattened record with its dotted source path.
struct Leaf<'a> {
    path: String,
    value: &'a Value,
}

struct Flattened<'a> {
    leaves: Vec<Leaf<'a>>,
    arrays: Vec<(&'a ChildTableSpec, &'a [Value])>,
}

fn flatten<'a>(
    path: &mut Vec<&'a str>,
    value: &'a Value,
    child_specs: &'a [ChildTableSpec],
    out: &mut Flattened<'a>,
) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, nested) in map {
                path.push(key);
                flatten(path, nested, child_specs, out);
                path.pop();
            }
        }
        Value::Array(items) => {
            let dotted = path.join(".");
            match child_specs.iter().find(|spec| spec.field == dotted) {
                Some(spec) => out.arrays.push((spec, items)),
                None => out.leaves.push(Leaf {
                    path: dotted,
                    value,
                }),
            }
        }
        _ => out.leaves.push(Leaf {
            path: path.join("."),
            value,
        }),
    }
}

fn flatten_object<'a>(map: &'a RawRecord, child_specs: &'a [ChildTableSpec]) -> Flattened<'a> {
    let mut out = Flattened {
        leaves: Vec::new(),
        arrays: Vec::new(),
    };
    let mut path = Vec::new();
    for (key, value) in map {
        path.push(key.as_str());
        flatten(&mut path, value, child_specs, &mut out);
        path.pop();
    }
    out
}

/// Build one row from leaves, recording column origins and conflicts.
fn build_row(
    table: &str,
    leaves: Vec<Leaf<'_>>,
    hints: &BTreeMap<String, FieldHint>,
    origins: &mut ColumnOrigins,
    conflicts: &mut BTreeSet<NameConflict>,
) -> NormalizedRecord {
    let mut row = NormalizedRecord::new();
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for leaf in leaves {
        let column = sanitize_identifier(&leaf.path);
        if let Some(existing) = seen.get(&column) {
            conflicts.insert(NameConflict::new(table, &column, existing, &leaf.path));
            continue;
        }
        let value = coerce(leaf.value, hints.get(&column).copied());
        origins.push((table.to_string(), column.clone(), leaf.path.clone()));
        seen.insert(column.clone(), leaf.path);
        row.insert(column, value);
    }
    row
}

fn normalize_traced(
    descriptor: &DatasetDescriptor,
    raw: &RawRecord,
) -> (Normalized, ColumnOrigins, BTreeSet<NameConflict>) {
    let mut origins = ColumnOrigins::new();
    let mut conflicts = BTreeSet::new();

    let flat = flatten_object(raw, &descriptor.child_tables);
    let row = build_row(
        &descriptor.table,
        flat.leaves,
        &descriptor.field_hints,
        &mut origins,
        &mut conflicts,
    );
    let parent_key = row
        .get(&descriptor.primary_key)
        .cloned()
        .unwrap_or(FieldValue::Null);

    let no_hints = BTreeMap::new();
    let mut children = Vec::new();
    for (spec, items) in flat.arrays {
        let table = descriptor.child_table_name(spec);
        for item in items {
            let leaves = match item {
                Value::Object(map) => flatten_object(map, &[]).leaves,
                other => vec![Leaf {
                    path: SCALAR_ELEMENT_COLUMN.to_string(),
                    value: other,
                }],
            };
            let mut child = build_row(&table, leaves, &no_hints, &mut origins, &mut conflicts);
            if child.get(&spec.parent_column).is_some() {
                conflicts.insert(NameConflict::new(
                    &table,
                    &spec.parent_column,
                    &format!("{}.{}", spec.field, spec.parent_column),
                    &format!("<parent {}>", descriptor.primary_key),
                ));
            }
            child.insert(spec.parent_column.clone(), parent_key.clone());
            children.push((table.clone(), child));
        }
    }

    (
        Normalized {
            record: Record::new(descriptor.kind, row),
            children,
        },
        origins,
        conflicts,
    )
}

/// Coerce a JSON value to a destination value.
///
/// A hint decides the target type; values that do not parse as the hinted
/// type become null. Without a hint the JSON type decides.
#[must_use]
pub fn coerce(value: &Value, hint: Option<FieldHint>) -> FieldValue {
    match (hint, value) {
        (_, Value::Null) => FieldValue::Null,
        (Some(hint), value) => coerce_hinted(value, hint).unwrap_or(FieldValue::Null),
        (None, Value::Bool(b)) => FieldValue::Bool(*b),
        (None, Value::Number(n)) => n
            .as_i64()
            .map(FieldValue::Int64)
            .or_else(|| n.as_f64().map(FieldValue::Float64))
            .unwrap_or(FieldValue::Null),
        (None, Value::String(s)) => FieldValue::String(s.clone()),
        (None, Value::Array(_)) => FieldValue::Json(value.clone()),
        (None, Value::Object(_)) => FieldValue::Null,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn coerce_hinted(value: &Value, hint: FieldHint) -> Option<FieldValue> {
    match (hint, value) {
        (FieldHint::Timestamp, Value::String(s)) => parse_timestamp(s).map(FieldValue::Timestamp),
        (FieldHint::Float64, Value::Number(n)) => n.as_f64().map(FieldValue::Float64),
        (FieldHint::Float64, Value::String(s)) => {
            s.trim().parse::<f64>().ok().filter(|f| f.is_finite()).map(FieldValue::Float64)
        }
        (FieldHint::Int64, Value::Number(n)) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                    .map(|f| f as i64)
            })
            .map(FieldValue::Int64),
        (FieldHint::Int64, Value::String(s)) => s.trim().parse().ok().map(FieldValue::Int64),
        (FieldHint::Bool, Value::Bool(b)) => Some(FieldValue::Bool(*b)),
        (FieldHint::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(FieldValue::Bool(true)),
            "false" => Some(FieldValue::Bool(false)),
            _ => None,
        },
        (FieldHint::String, Value::String(s)) => Some(FieldValue::String(s.clone())),
        (FieldHint::String, Value::Number(_) | Value::Bool(_)) => {
            Some(FieldValue::String(value.to_string()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use serde_json::json;
    use shopsync_types::record::KeyValue;
    use shopsync_types::schema::ColumnType;

    fn raw(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn orders() -> DatasetDescriptor {
        DatasetDescriptor::builtin(DatasetKind::Orders)
    }

    #[rstest]
    #[case("Total-Price", "total_price")]
    #[case("customer.default_address.city", "customer_default_address_city")]
    #[case("__id__", "id")]
    #[case("2fa_enabled", "_2fa_enabled")]
    #[case("***", "_unnamed")]
    #[case("Prix (€)", "prix")]
    fn sanitizes_identifiers(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_identifier(input), expected);
    }

    #[test]
    fn identifiers_are_length_capped() {
        let long = "a".repeat(MAX_IDENTIFIER_LEN + 50);
        assert_eq!(sanitize_identifier(&long).len(), MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn flattens_nested_objects() {
        let record = raw(json!({
            "id": 1,
            "customer": {"id": 9, "default_address": {"city": "Oslo"}},
            "note_attributes": {}
        }));
        let out = normalize(&orders(), &record).unwrap();
        let row = out.record.row();
        assert_eq!(row.get("customer_id"), Some(&FieldValue::Int64(9)));
        assert_eq!(
            row.get("customer_default_address_city"),
            Some(&FieldValue::String("Oslo".into()))
        );
        assert_eq!(row.get("note_attributes"), Some(&FieldValue::Null));
        assert!(matches!(out.record, Record::Order(_)));
        assert!(out.children.is_empty());
    }

    #[test]
    fn arrays_without_child_table_stay_repeated() {
        let record = raw(json!({"id": 1, "tags": ["a", "b"], "line_items": [{"id": 5}]}));
        let out = normalize(&orders(), &record).unwrap();
        assert_eq!(
            out.record.row().get("tags"),
            Some(&FieldValue::Json(json!(["a", "b"])))
        );
        assert_eq!(
            out.record.row().get("line_items"),
            Some(&FieldValue::Json(json!([{"id": 5}])))
        );
    }

    #[test]
    fn child_table_rows_carry_parent_key() {
        let descriptor = orders().with_child_table(ChildTableSpec {
            field: "line_items".into(),
            table_suffix: "line_items".into(),
            primary_key: "id".into(),
            parent_column: "order_id".into(),
        });
        let record = raw(json!({
            "id": 1001,
            "line_items": [
                {"id": 1, "sku": "A-1", "price_set": {"amount": "9.99"}},
                {"id": 2, "sku": "B-2"}
            ]
        }));
        let out = normalize(&descriptor, &record).unwrap();
        assert!(out.record.row().get("line_items").is_none());
        assert_eq!(out.children.len(), 2);
        let (table, first) = &out.children[0];
        assert_eq!(table, "shopify_orders_line_items");
        assert_eq!(first.get("order_id"), Some(&FieldValue::Int64(1001)));
        assert_eq!(
            first.get("price_set_amount"),
            Some(&FieldValue::String("9.99".into()))
        );
        assert_eq!(first.key("id"), Some(KeyValue::Int(1)));
    }

    #[test]
    fn hints_coerce_and_unparsable_becomes_null() {
        let record = raw(json!({
            "id": 1,
            "total_price": "12.50",
            "updated_at": "2024-01-15T12:00:00+02:00",
            "cancelled_at": "not a date",
            "processed_at": null
        }));
        let out = normalize(&orders(), &record).unwrap();
        let row = out.record.row();
        assert_eq!(row.get("total_price"), Some(&FieldValue::Float64(12.5)));
        assert_eq!(
            row.get("updated_at"),
            Some(&FieldValue::Timestamp(
                Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
            ))
        );
        assert_eq!(row.get("cancelled_at"), Some(&FieldValue::Null));
        assert_eq!(row.get("processed_at"), Some(&FieldValue::Null));
    }

    #[rstest]
    #[case(json!(true), None, FieldValue::Bool(true))]
    #[case(json!(42), None, FieldValue::Int64(42))]
    #[case(json!(1.5), None, FieldValue::Float64(1.5))]
    #[case(json!("x"), None, FieldValue::String("x".into()))]
    #[case(json!("7"), Some(FieldHint::Int64), FieldValue::Int64(7))]
    #[case(json!(7.0), Some(FieldHint::Int64), FieldValue::Int64(7))]
    #[case(json!("seven"), Some(FieldHint::Int64), FieldValue::Null)]
    #[case(json!("TRUE"), Some(FieldHint::Bool), FieldValue::Bool(true))]
    #[case(json!(12), Some(FieldHint::String), FieldValue::String("12".into()))]
    #[case(json!({"a": 1}), Some(FieldHint::Float64), FieldValue::Null)]
    fn coercion_table(#[case] value: Value, #[case] hint: Option<FieldHint>, #[case] expected: FieldValue) {
        assert_eq!(coerce(&value, hint), expected);
    }

    #[test]
    fn record_level_collision_is_a_conflict() {
        let record = raw(json!({"id": 1, "Total-Price": "1", "total_price": "2"}));
        let err = normalize(&orders(), &record).unwrap_err();
        let NormalizeError::SchemaConflict { dataset, conflicts } = err;
        assert_eq!(dataset, DatasetKind::Orders);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].column, "total_price");
        assert_eq!(conflicts[0].first, "Total-Price");
        assert_eq!(conflicts[0].second, "total_price");
    }

    #[test]
    fn batch_level_collision_reported_once_per_pair() {
        let raws = vec![
            raw(json!({"id": 1, "Note": "a"})),
            raw(json!({"id": 2, "note": "b"})),
            raw(json!({"id": 3, "Note": "c"})),
            raw(json!({"id": 4, "note": "d"})),
        ];
        let err = normalize_batch(&orders(), &raws, Watermark::Beginning).unwrap_err();
        let NormalizeError::SchemaConflict { conflicts, .. } = err;
        assert_eq!(conflicts.len(), 1);
        assert!(err_text(&conflicts).contains("'Note' and 'note' both map to shopify_orders.note"));
    }

    fn err_text(conflicts: &[NameConflict]) -> String {
        join_conflicts(conflicts)
    }

    #[test]
    fn batch_infers_schema_and_groups_children() {
        let descriptor = orders().with_child_table(ChildTableSpec {
            field: "line_items".into(),
            table_suffix: "items".into(),
            primary_key: "id".into(),
            parent_column: "order_id".into(),
        });
        let raws = vec![
            raw(json!({"id": 1, "total_price": "3.00", "line_items": [{"id": 10}]})),
            raw(json!({"id": 2, "total_price": "4.00", "line_items": [{"id": 11}, {"id": 12}]})),
        ];
        let batch = normalize_batch(&descriptor, &raws, Watermark::Int64 { value: 2 }).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.schema.primary_key, "id");
        assert_eq!(batch.children.len(), 1);
        assert_eq!(batch.children[0].table, "shopify_orders_items");
        assert_eq!(batch.children[0].rows.len(), 3);
        assert_eq!(batch.candidate_watermark, Watermark::Int64 { value: 2 });
    }

    #[test]
    fn batch_values_follow_widened_columns() {
        let raws = vec![
            raw(json!({"id": 1, "x": 1, "last_order_id": null})),
            raw(json!({"id": 2, "x": "a", "last_order_id": null})),
        ];
        let batch = normalize_batch(&orders(), &raws, Watermark::Beginning).unwrap();
        assert_eq!(batch.schema.column("x").unwrap().column_type, ColumnType::String);
        assert_eq!(
            batch.records[0].row().get("x"),
            Some(&FieldValue::String("1".into()))
        );
        assert_eq!(batch.records[0].kind(), DatasetKind::Orders);
        let rows: Vec<_> = batch.records.iter().map(|r| r.row().clone()).collect();
        assert!(batch.schema.mismatches(&rows).is_empty());
    }

    #[test]
    fn normalize_is_deterministic() {
        let record = raw(json!({"id": 1, "B": 1, "a": {"C": 2}}));
        let first = normalize(&orders(), &record).unwrap();
        let second = normalize(&orders(), &record).unwrap();
        assert_eq!(first, second);
    }
}
