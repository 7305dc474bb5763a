//! DDL generation for warehouse tables.

use shopsync_types::schema::{ColumnType, TableSchema};

/// Registry tables. Idempotent.
pub(crate) const CREATE_REGISTRY: &str = r"
CREATE TABLE IF NOT EXISTS __datasets (
    name TEXT PRIMARY KEY,
    location TEXT NOT NULL,
    description TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS __tables (
    dataset TEXT NOT NULL,
    name TEXT NOT NULL,
    schema TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (dataset, name)
);
";

/// Quote an identifier for `SQLite`, doubling embedded quotes.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Physical name of a table inside a dataset.
pub(crate) fn qualified_table(dataset: &str, table: &str) -> String {
    quote_identifier(&format!("{dataset}.{table}"))
}

pub(crate) fn sqlite_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Int64 | ColumnType::Bool => "INTEGER",
        ColumnType::Float64 => "REAL",
        ColumnType::String | ColumnType::Timestamp | ColumnType::Json => "TEXT",
    }
}

pub(crate) fn create_table_sql(dataset: &str, table: &str, schema: &TableSchema) -> String {
    let mut columns: Vec<String> = schema
        .columns
        .iter()
        .map(|c| {
            let not_null = if c.nullable { "" } else { " NOT NULL" };
            format!(
                "{} {}{not_null}",
                quote_identifier(&c.name),
                sqlite_type(c.column_type)
            )
        })
        .collect();
    columns.push(format!(
        "PRIMARY KEY ({})",
        quote_identifier(&schema.primary_key)
    ));
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified_table(dataset, table),
        columns.join(", ")
    )
}

/// `INSERT ... ON CONFLICT (pk) DO UPDATE` over every schema column.
pub(crate) fn upsert_sql(dataset: &str, table: &str, schema: &TableSchema) -> String {
    let names: Vec<String> = schema
        .columns
        .iter()
        .map(|c| quote_identifier(&c.name))
        .collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = schema
        .columns
        .iter()
        .filter(|c| c.name != schema.primary_key)
        .map(|c| {
            let q = quote_identifier(&c.name);
            format!("{q} = excluded.{q}")
        })
        .collect();
    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {conflict}",
        qualified_table(dataset, table),
        names.join(", "),
        placeholders.join(", "),
        quote_identifier(&schema.primary_key),
    )
}

/// Delete every row owned by one parent key.
pub(crate) fn delete_owned_sql(dataset: &str, table: &str, parent_column: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {} = ?1",
        qualified_table(dataset, table),
        quote_identifier(parent_column)
    )
}
