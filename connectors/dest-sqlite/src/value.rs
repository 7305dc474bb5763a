//! `FieldValue` to and from `SQLite` values.

use rusqlite::types::{Value, ValueRef};
use shopsync_types::record::{FieldValue, KeyValue};
use shopsync_types::schema::ColumnType;

pub(crate) fn to_sql(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Int64(v) => Value::Integer(*v),
        FieldValue::Float64(v) => Value::Real(*v),
        FieldValue::Bool(v) => Value::Integer(i64::from(*v)),
        FieldValue::String(s) => Value::Text(s.clone()),
        FieldValue::Timestamp(_) | FieldValue::Json(_) => Value::Text(value.to_cell()),
    }
}

pub(crate) fn key_to_sql(key: &KeyValue) -> Value {
    match key {
        KeyValue::Int(v) => Value::Integer(*v),
        KeyValue::Str(s) => Value::Text(s.clone()),
    }
}

pub(crate) fn from_sql(column_type: ColumnType, value: ValueRef<'_>) -> FieldValue {
    match (column_type, value) {
        (_, ValueRef::Null) => FieldValue::Null,
        (ColumnType::Bool, ValueRef::Integer(v)) => FieldValue::Bool(v != 0),
        (ColumnType::Float64, ValueRef::Integer(v)) => {
            #[allow(clippy::cast_precision_loss)]
            let v = v as f64;
            FieldValue::Float64(v)
        }
        (_, ValueRef::Integer(v)) => FieldValue::Int64(v),
        (_, ValueRef::Real(v)) => FieldValue::Float64(v),
        (ty, ValueRef::Text(bytes)) => {
            FieldValue::from_cell(ty, &String::from_utf8_lossy(bytes))
        }
        (_, ValueRef::Blob(_)) => FieldValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn bool_and_timestamp_survive_storage() {
        let stored = to_sql(&FieldValue::Bool(true));
        assert_eq!(stored, Value::Integer(1));
        assert_eq!(
            from_sql(ColumnType::Bool, ValueRef::Integer(1)),
            FieldValue::Bool(true)
        );

        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let Value::Text(text) = to_sql(&FieldValue::Timestamp(ts)) else {
            panic!("timestamp should be stored as text");
        };
        assert_eq!(
            from_sql(ColumnType::Timestamp, ValueRef::Text(text.as_bytes())),
            FieldValue::Timestamp(ts)
        );
    }

    #[test]
    fn integer_in_float_column_reads_as_float() {
        assert_eq!(
            from_sql(ColumnType::Float64, ValueRef::Integer(3)),
            FieldValue::Float64(3.0)
        );
    }
}
