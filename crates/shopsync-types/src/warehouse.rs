//! Warehouse boundary.
//!
//! Existence checks, idempotent provisioning and an upsert-by-key bulk
//! write. Implementations must make a successful `write_batch` fully visible
//! and a failed one invisible, across every table it touches.

use async_trait::async_trait;

use crate::record::{KeyValue, NormalizedRecord};
use crate::schema::TableSchema;

/// Rows bound for one table of a batch write.
#[derive(Debug, Clone, PartialEq)]
pub struct TableWrite {
    pub table: String,
    pub schema: TableSchema,
    pub rows: Vec<NormalizedRecord>,
    /// Existing rows owned by these parents are deleted before the upsert.
    pub replace: Option<ParentScope>,
}

impl TableWrite {
    #[must_use]
    pub fn upsert(table: impl Into<String>, schema: TableSchema, rows: Vec<NormalizedRecord>) -> Self {
        Self {
            table: table.into(),
            schema,
            rows,
            replace: None,
        }
    }
}

/// Parent rows whose child rows a write replaces wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentScope {
    /// Child column holding the parent key.
    pub column: String,
    pub keys: Vec<KeyValue>,
}

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    /// Credentials rejected by the warehouse.
    #[error("warehouse authentication failed: {0}")]
    Auth(String),
    /// A bulk write failed after it started; nothing from it is visible.
    #[error("partial load into {table} failed: {message}")]
    Partial { table: String, message: String },
    #[error("warehouse error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError>;

    /// Create a dataset. Creating one that already exists is not an error.
    async fn create_dataset(
        &self,
        dataset: &str,
        location: &str,
        description: &str,
    ) -> Result<(), WarehouseError>;

    /// Stored schema of a table, `None` when the table does not exist.
    async fn table_schema(
        &self,
        dataset: &str,
        table: &str,
    ) -> Result<Option<TableSchema>, WarehouseError>;

    async fn create_table(
        &self,
        dataset: &str,
        table: &str,
        schema: &TableSchema,
    ) -> Result<(), WarehouseError>;

    /// Apply every write as one unit: scoped deletes first, then insert or
    /// replace by `schema.primary_key`. Returns rows written per write.
    async fn write_batch(
        &self,
        dataset: &str,
        writes: Vec<TableWrite>,
    ) -> Result<Vec<u64>, WarehouseError>;

    /// Insert or replace rows of a single table. Returns rows written.
    async fn upsert_rows(
        &self,
        dataset: &str,
        table: &str,
        schema: &TableSchema,
        rows: Vec<NormalizedRecord>,
    ) -> Result<u64, WarehouseError> {
        let written = self
            .write_batch(dataset, vec![TableWrite::upsert(table, schema.clone(), rows)])
            .await?;
        Ok(written.into_iter().sum())
    }

    async fn row_count(&self, dataset: &str, table: &str) -> Result<u64, WarehouseError>;
}
