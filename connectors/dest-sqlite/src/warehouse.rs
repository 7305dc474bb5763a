use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use shopsync_types::record::NormalizedRecord;
use shopsync_types::schema::TableSchema;
use shopsync_types::warehouse::{TableWrite, Warehouse, WarehouseError};

use crate::ddl::{
    create_table_sql, delete_owned_sql, qualified_table, quote_identifier, upsert_sql,
    CREATE_REGISTRY,
};
use crate::value::{from_sql, key_to_sql, to_sql};

/// Warehouse backed by a single `SQLite` database.
///
/// Calls run on the blocking pool behind one shared connection.
#[derive(Clone)]
pub struct SqliteWarehouse {
    conn: Arc<Mutex<Connection>>,
}

fn backend(err: impl std::fmt::Display) -> WarehouseError {
    WarehouseError::Backend(err.to_string())
}

impl SqliteWarehouse {
    /// Open or create a warehouse database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError::Backend`] if the directory or database
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self, WarehouseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(backend)?;
            }
        }
        Self::init(Connection::open(path).map_err(backend)?)
    }

    /// In-memory warehouse (for tests).
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError::Backend`] if the registry cannot be created.
    pub fn in_memory() -> Result<Self, WarehouseError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, WarehouseError> {
        conn.execute_batch(CREATE_REGISTRY).map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, what: &'static str, f: F) -> Result<T, WarehouseError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, WarehouseError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| backend("warehouse connection lock poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| backend(format!("{what} task panicked: {e}")))?
    }

    /// Every row of a table ordered by primary key, decoded with its stored
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError::Backend`] if the table does not exist.
    pub async fn rows(
        &self,
        dataset: &str,
        table: &str,
    ) -> Result<Vec<NormalizedRecord>, WarehouseError> {
        let dataset = dataset.to_string();
        let table = table.to_string();
        self.with_conn("rows", move |conn| {
            let schema = load_schema(conn, &dataset, &table)?
                .ok_or_else(|| backend(format!("table {dataset}.{table} does not exist")))?;
            let columns: Vec<String> = schema
                .columns
                .iter()
                .map(|c| quote_identifier(&c.name))
                .collect();
            let sql = format!(
                "SELECT {} FROM {} ORDER BY {}",
                columns.join(", "),
                qualified_table(&dataset, &table),
                quote_identifier(&schema.primary_key)
            );
            let mut stmt = conn.prepare(&sql).map_err(backend)?;
            let mut rows = stmt.query([]).map_err(backend)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(backend)? {
                let mut record = NormalizedRecord::new();
                for (i, column) in schema.columns.iter().enumerate() {
                    let value = row.get_ref(i).map_err(backend)?;
                    record.insert(column.name.clone(), from_sql(column.column_type, value));
                }
                out.push(record);
            }
            Ok(out)
        })
        .await
    }
}

fn load_schema(
    conn: &Connection,
    dataset: &str,
    table: &str,
) -> Result<Option<TableSchema>, WarehouseError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT schema FROM __tables WHERE dataset = ?1 AND name = ?2",
            params![dataset, table],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend)?;
    raw.map(|json| {
        serde_json::from_str(&json)
            .map_err(|e| backend(format!("stored schema for {dataset}.{table} is invalid: {e}")))
    })
    .transpose()
}

fn dataset_registered(conn: &Connection, dataset: &str) -> Result<bool, WarehouseError> {
    conn.query_row(
        "SELECT 1 FROM __datasets WHERE name = ?1",
        params![dataset],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(backend)
}

/// Scoped delete then upsert of one table inside an open transaction.
fn apply_write(
    tx: &rusqlite::Transaction<'_>,
    dataset: &str,
    write: &TableWrite,
) -> Result<u64, WarehouseError> {
    let partial = |e: rusqlite::Error| WarehouseError::Partial {
        table: format!("{dataset}.{}", write.table),
        message: e.to_string(),
    };
    if let Some(scope) = &write.replace {
        let mut delete = tx
            .prepare(&delete_owned_sql(dataset, &write.table, &scope.column))
            .map_err(partial)?;
        let mut removed = 0usize;
        for key in &scope.keys {
            removed += delete.execute([key_to_sql(key)]).map_err(partial)?;
        }
        tracing::debug!(
            dataset = %dataset,
            table = %write.table,
            parents = scope.keys.len(),
            removed,
            "Cleared owned rows"
        );
    }
    if write.rows.is_empty() {
        return Ok(0);
    }
    let mut stmt = tx
        .prepare(&upsert_sql(dataset, &write.table, &write.schema))
        .map_err(partial)?;
    let mut written = 0u64;
    for row in &write.rows {
        let values: Vec<rusqlite::types::Value> = write
            .schema
            .columns
            .iter()
            .map(|c| row.get(&c.name).map_or(rusqlite::types::Value::Null, to_sql))
            .collect();
        stmt.execute(rusqlite::params_from_iter(values))
            .map_err(partial)?;
        written += 1;
    }
    Ok(written)
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError> {
        let dataset = dataset.to_string();
        self.with_conn("dataset_exists", move |conn| dataset_registered(conn, &dataset))
            .await
    }

    async fn create_dataset(
        &self,
        dataset: &str,
        location: &str,
        description: &str,
    ) -> Result<(), WarehouseError> {
        let (dataset, location, description) =
            (dataset.to_string(), location.to_string(), description.to_string());
        self.with_conn("create_dataset", move |conn| {
            conn.execute(
                "INSERT INTO __datasets (name, location, description) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO NOTHING",
                params![dataset, location, description],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn table_schema(
        &self,
        dataset: &str,
        table: &str,
    ) -> Result<Option<TableSchema>, WarehouseError> {
        let (dataset, table) = (dataset.to_string(), table.to_string());
        self.with_conn("table_schema", move |conn| load_schema(conn, &dataset, &table))
            .await
    }

    async fn create_table(
        &self,
        dataset: &str,
        table: &str,
        schema: &TableSchema,
    ) -> Result<(), WarehouseError> {
        let (dataset, table, schema) = (dataset.to_string(), table.to_string(), schema.clone());
        self.with_conn("create_table", move |conn| {
            if !dataset_registered(conn, &dataset)? {
                return Err(backend(format!("dataset {dataset} does not exist")));
            }
            let encoded = serde_json::to_string(&schema).map_err(backend)?;
            let tx = conn.transaction().map_err(backend)?;
            tx.execute_batch(&create_table_sql(&dataset, &table, &schema))
                .map_err(backend)?;
            tx.execute(
                "INSERT INTO __tables (dataset, name, schema) VALUES (?1, ?2, ?3)
                 ON CONFLICT(dataset, name) DO NOTHING",
                params![dataset, table, encoded],
            )
            .map_err(backend)?;
            tx.commit().map_err(backend)?;
            tracing::debug!(dataset = %dataset, table = %table, "Created sqlite table");
            Ok(())
        })
        .await
    }

    async fn write_batch(
        &self,
        dataset: &str,
        writes: Vec<TableWrite>,
    ) -> Result<Vec<u64>, WarehouseError> {
        let dataset = dataset.to_string();
        self.with_conn("write_batch", move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let mut counts = Vec::with_capacity(writes.len());
            for write in &writes {
                counts.push(apply_write(&tx, &dataset, write)?);
            }
            let tables: Vec<&str> = writes.iter().map(|w| w.table.as_str()).collect();
            tx.commit().map_err(|e| WarehouseError::Partial {
                table: format!("{dataset}.{}", tables.join(",")),
                message: e.to_string(),
            })?;
            Ok(counts)
        })
        .await
    }

    async fn row_count(&self, dataset: &str, table: &str) -> Result<u64, WarehouseError> {
        let sql = format!("SELECT COUNT(*) FROM {}", qualified_table(dataset, table));
        self.with_conn("row_count", move |conn| {
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0)).map_err(backend)?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }
}
