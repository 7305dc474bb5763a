//! Idempotent warehouse provisioning and upsert-by-key loading.

use std::collections::HashMap;
use std::sync::Arc;

use shopsync_types::dataset::DatasetDescriptor;
use shopsync_types::record::{KeyValue, NormalizedRecord};
use shopsync_types::schema::TableSchema;
use shopsync_types::warehouse::{ParentScope, TableWrite, Warehouse};

use crate::config::types::DestinationConfig;
use crate::errors::PipelineError;
use crate::staging::StagedBatch;

/// Outcome of loading one staged batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadResult {
    /// Parent-table rows written.
    pub rows_written: u64,
    /// Rows without a usable primary key plus rows superseded by a later
    /// duplicate key in the same batch.
    pub rows_skipped: u64,
    pub child_rows_written: u64,
}

/// One table's share of a batch, ready to write.
struct TableLoad {
    table: String,
    schema: TableSchema,
    create: bool,
    rows: Vec<NormalizedRecord>,
    replace: Option<ParentScope>,
}

/// Writes staged batches into one warehouse dataset.
#[derive(Clone)]
pub struct Loader {
    warehouse: Arc<dyn Warehouse>,
    dataset: String,
    location: String,
    description: String,
}

impl Loader {
    #[must_use]
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        dataset: impl Into<String>,
        location: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            warehouse,
            dataset: dataset.into(),
            location: location.into(),
            description: description.into(),
        }
    }

    #[must_use]
    pub fn from_config(warehouse: Arc<dyn Warehouse>, destination: &DestinationConfig) -> Self {
        Self::new(
            warehouse,
            &destination.dataset,
            &destination.location,
            &destination.description,
        )
    }

    #[must_use]
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Create the warehouse dataset if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`PipelineError`] if the warehouse call fails.
    pub async fn ensure_dataset(&self) -> Result<(), PipelineError> {
        if self.warehouse.dataset_exists(&self.dataset).await? {
            tracing::debug!(dataset = %self.dataset, "Warehouse dataset exists");
            return Ok(());
        }
        self.warehouse
            .create_dataset(&self.dataset, &self.location, &self.description)
            .await?;
        tracing::info!(
            dataset = %self.dataset,
            location = %self.location,
            "Created warehouse dataset"
        );
        Ok(())
    }

    /// Load `batch` into `table` (and its child tables).
    ///
    /// Every target table is checked before anything is written: a missing
    /// table is created from the batch schema, an existing one must accept
    /// the batch shape. The parent rows and the child rows they own are
    /// then written as one unit; a parent's previous child rows are
    /// replaced, not merged.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SchemaMismatch`] when an existing table does
    /// not fit, or the mapped warehouse failure.
    pub async fn load(
        &self,
        table: &str,
        descriptor: &DatasetDescriptor,
        batch: &StagedBatch,
    ) -> Result<LoadResult, PipelineError> {
        self.ensure_dataset().await?;

        let (rows, skipped) = dedupe_by_key(batch.rows(), &descriptor.primary_key);
        let parent_keys: Vec<KeyValue> = rows
            .iter()
            .filter_map(|row| row.key(&descriptor.primary_key))
            .collect();
        let mut plan = vec![self.plan_table(table, &batch.schema, rows).await?];

        for spec in &descriptor.child_tables {
            let child_table = format!("{table}_{}", spec.table_suffix);
            let staged = batch
                .children
                .iter()
                .find(|child| child.spec.table_suffix == spec.table_suffix);
            let mut step = match staged {
                Some(child) => {
                    let (rows, _) = dedupe_by_key(child.rows.clone(), &child.spec.primary_key);
                    self.plan_table(&child_table, &child.schema, rows).await?
                }
                None => match self.warehouse.table_schema(&self.dataset, &child_table).await? {
                    Some(schema) => TableLoad {
                        table: child_table,
                        schema,
                        create: false,
                        rows: Vec::new(),
                        replace: None,
                    },
                    None => continue,
                },
            };
            if !parent_keys.is_empty() {
                step.replace = Some(ParentScope {
                    column: spec.parent_column.clone(),
                    keys: parent_keys.clone(),
                });
            }
            plan.push(step);
        }

        let plan: Vec<TableLoad> = plan
            .into_iter()
            .filter(|step| !step.rows.is_empty() || step.replace.is_some())
            .collect();
        if plan.is_empty() {
            return Ok(LoadResult {
                rows_skipped: skipped,
                ..LoadResult::default()
            });
        }

        for step in plan.iter().filter(|step| step.create) {
            self.warehouse
                .create_table(&self.dataset, &step.table, &step.schema)
                .await?;
            tracing::info!(
                dataset = %self.dataset,
                table = %step.table,
                columns = step.schema.columns.len(),
                "Created table"
            );
        }

        let tables: Vec<String> = plan.iter().map(|step| step.table.clone()).collect();
        let writes = plan
            .into_iter()
            .map(|step| TableWrite {
                table: step.table,
                schema: step.schema,
                rows: step.rows,
                replace: step.replace,
            })
            .collect();
        let counts = self.warehouse.write_batch(&self.dataset, writes).await?;

        let mut result = LoadResult {
            rows_skipped: skipped,
            ..LoadResult::default()
        };
        for (step_table, written) in tables.iter().zip(counts) {
            let total = self.warehouse.row_count(&self.dataset, step_table).await?;
            tracing::info!(
                dataset = %self.dataset,
                table = %step_table,
                rows_written = written,
                table_rows = total,
                "Loaded rows"
            );
            if step_table == table {
                result.rows_written = written;
            } else {
                result.child_rows_written += written;
            }
        }
        Ok(result)
    }

    /// Resolve the target schema of one table and conform `rows` to it.
    async fn plan_table(
        &self,
        table: &str,
        batch_schema: &TableSchema,
        rows: Vec<NormalizedRecord>,
    ) -> Result<TableLoad, PipelineError> {
        let existing = self.warehouse.table_schema(&self.dataset, table).await?;
        let (schema, create, rows) = match existing {
            Some(existing) => {
                let fields = existing.mismatches(&rows);
                if !fields.is_empty() {
                    return Err(PipelineError::SchemaMismatch {
                        table: table.to_string(),
                        fields,
                    });
                }
                let rows = rows.into_iter().map(|row| existing.conform_row(row)).collect();
                (existing, false, rows)
            }
            None => (batch_schema.clone(), true, rows),
        };
        Ok(TableLoad {
            table: table.to_string(),
            schema,
            create,
            rows,
            replace: None,
        })
    }
}

/// Drop rows without a usable key and resolve duplicate keys
/// last-write-wins. Returns the surviving rows and the number dropped.
fn dedupe_by_key(rows: Vec<NormalizedRecord>, primary_key: &str) -> (Vec<NormalizedRecord>, u64) {
    let mut slots: Vec<Option<NormalizedRecord>> = Vec::with_capacity(rows.len());
    let mut positions = HashMap::new();
    let mut skipped = 0u64;
    for row in rows {
        let Some(key) = row.key(primary_key) else {
            skipped += 1;
            continue;
        };
        if let Some(previous) = positions.insert(key, slots.len()) {
            slots[previous] = None;
            skipped += 1;
        }
        slots.push(Some(row));
    }
    (slots.into_iter().flatten().collect(), skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use shopsync_types::dataset::{ChildTableSpec, DatasetKind};
    use shopsync_types::error::ErrorCategory;
    use shopsync_types::record::{FieldValue, Record};
    use shopsync_types::schema::{ColumnSpec, ColumnType};
    use shopsync_types::warehouse::WarehouseError;
    use shopsync_types::watermark::Watermark;

    use crate::staging::ChildBatch;

    /// Records calls; optionally reports a stored schema and fails upserts.
    #[derive(Default)]
    struct FakeWarehouse {
        existing: Mutex<HashMap<String, TableSchema>>,
        calls: Mutex<Vec<String>>,
        batches: Mutex<Vec<Vec<TableWrite>>>,
        fail_upsert: bool,
    }

    #[async_trait]
    impl Warehouse for FakeWarehouse {
        async fn dataset_exists(&self, _dataset: &str) -> Result<bool, WarehouseError> {
            self.calls.lock().unwrap().push("dataset_exists".into());
            Ok(false)
        }

        async fn create_dataset(
            &self,
            dataset: &str,
            location: &str,
            _description: &str,
        ) -> Result<(), WarehouseError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create_dataset {dataset} {location}"));
            Ok(())
        }

        async fn table_schema(
            &self,
            _dataset: &str,
            table: &str,
        ) -> Result<Option<TableSchema>, WarehouseError> {
            Ok(self.existing.lock().unwrap().get(table).cloned())
        }

        async fn create_table(
            &self,
            _dataset: &str,
            table: &str,
            schema: &TableSchema,
        ) -> Result<(), WarehouseError> {
            self.calls.lock().unwrap().push(format!("create_table {table}"));
            self.existing
                .lock()
                .unwrap()
                .insert(table.to_string(), schema.clone());
            Ok(())
        }

        async fn write_batch(
            &self,
            _dataset: &str,
            writes: Vec<TableWrite>,
        ) -> Result<Vec<u64>, WarehouseError> {
            if self.fail_upsert {
                return Err(WarehouseError::Partial {
                    table: writes[0].table.clone(),
                    message: "connection dropped".into(),
                });
            }
            let mut calls = self.calls.lock().unwrap();
            for write in &writes {
                if let Some(scope) = &write.replace {
                    calls.push(format!(
                        "replace {} by {} {}",
                        write.table,
                        scope.column,
                        scope.keys.len()
                    ));
                }
                calls.push(format!("upsert {} {}", write.table, write.rows.len()));
            }
            let counts = writes.iter().map(|w| w.rows.len() as u64).collect();
            self.batches.lock().unwrap().push(writes);
            Ok(counts)
        }

        async fn row_count(&self, _dataset: &str, _table: &str) -> Result<u64, WarehouseError> {
            Ok(0)
        }
    }

    fn row(id: Option<i64>, name: &str) -> NormalizedRecord {
        let mut row = NormalizedRecord::new();
        row.insert("id", id.map_or(FieldValue::Null, FieldValue::Int64));
        row.insert("name", FieldValue::String(name.into()));
        row
    }

    fn batch(rows: Vec<NormalizedRecord>) -> StagedBatch {
        let schema = TableSchema::infer(&rows, "id", &Default::default());
        StagedBatch {
            dataset: DatasetKind::Customers,
            table: "shopify_customers".into(),
            schema,
            records: rows
                .into_iter()
                .map(|r| Record::new(DatasetKind::Customers, r))
                .collect(),
            children: Vec::new(),
            candidate_watermark: Watermark::Beginning,
        }
    }

    fn addresses() -> ChildTableSpec {
        ChildTableSpec {
            field: "addresses".into(),
            table_suffix: "addresses".into(),
            primary_key: "id".into(),
            parent_column: "customer_id".into(),
        }
    }

    fn address(id: i64, customer_id: i64) -> NormalizedRecord {
        let mut row = NormalizedRecord::new();
        row.insert("id", FieldValue::Int64(id));
        row.insert("customer_id", FieldValue::Int64(customer_id));
        row
    }

    fn loader(warehouse: Arc<FakeWarehouse>) -> Loader {
        Loader::new(warehouse, "raw_data", "EU", "Raw data from Shopify store.")
    }

    #[test]
    fn dedupe_keeps_last_write_and_drops_keyless() {
        let (rows, skipped) = dedupe_by_key(
            vec![row(Some(1), "a"), row(None, "x"), row(Some(2), "b"), row(Some(1), "c")],
            "id",
        );
        assert_eq!(skipped, 2);
        assert_eq!(rows, vec![row(Some(2), "b"), row(Some(1), "c")]);
    }

    #[tokio::test]
    async fn provisions_dataset_and_table_then_upserts() {
        let wh = Arc::new(FakeWarehouse::default());
        let descriptor = DatasetDescriptor::builtin(DatasetKind::Customers);
        let result = loader(wh.clone())
            .load(
                "shopify_customers",
                &descriptor,
                &batch(vec![row(Some(1), "a"), row(Some(2), "b"), row(None, "c")]),
            )
            .await
            .unwrap();
        assert_eq!(result.rows_written, 2);
        assert_eq!(result.rows_skipped, 1);
        assert_eq!(
            *wh.calls.lock().unwrap(),
            vec![
                "dataset_exists".to_string(),
                "create_dataset raw_data EU".to_string(),
                "create_table shopify_customers".to_string(),
                "upsert shopify_customers 2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn existing_table_with_fewer_columns_is_a_mismatch() {
        let wh = Arc::new(FakeWarehouse::default());
        wh.existing.lock().unwrap().insert(
            "shopify_customers".into(),
            TableSchema {
                columns: vec![ColumnSpec {
                    name: "id".into(),
                    column_type: ColumnType::Int64,
                    nullable: false,
                }],
                primary_key: "id".into(),
            },
        );
        let descriptor = DatasetDescriptor::builtin(DatasetKind::Customers);
        let err = loader(wh.clone())
            .load("shopify_customers", &descriptor, &batch(vec![row(Some(1), "a")]))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::SchemaMismatch);
        assert!(err.to_string().contains("new column 'name'"));
        assert!(!wh.calls.lock().unwrap().iter().any(|c| c.starts_with("upsert")));
    }

    #[tokio::test]
    async fn failed_upsert_is_load_partial_failure() {
        let wh = Arc::new(FakeWarehouse {
            fail_upsert: true,
            ..FakeWarehouse::default()
        });
        let descriptor = DatasetDescriptor::builtin(DatasetKind::Customers);
        let err = loader(wh)
            .load("shopify_customers", &descriptor, &batch(vec![row(Some(1), "a")]))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::LoadPartialFailure);
    }

    #[tokio::test]
    async fn parent_and_children_share_one_write() {
        let wh = Arc::new(FakeWarehouse::default());
        let descriptor =
            DatasetDescriptor::builtin(DatasetKind::Customers).with_child_table(addresses());
        let mut staged = batch(vec![row(Some(1), "a"), row(Some(2), "b")]);
        let child_rows = vec![address(100, 1)];
        staged.children.push(ChildBatch {
            spec: addresses(),
            table: "shopify_customers_addresses".into(),
            schema: TableSchema::infer(&child_rows, "id", &Default::default()),
            rows: child_rows,
        });

        let result = loader(wh.clone())
            .load("shopify_customers", &descriptor, &staged)
            .await
            .unwrap();
        assert_eq!(result.rows_written, 2);
        assert_eq!(result.child_rows_written, 1);
        assert_eq!(wh.batches.lock().unwrap().len(), 1);
        assert_eq!(
            wh.calls.lock().unwrap()[2..],
            [
                "create_table shopify_customers".to_string(),
                "create_table shopify_customers_addresses".to_string(),
                "upsert shopify_customers 2".to_string(),
                "replace shopify_customers_addresses by customer_id 2".to_string(),
                "upsert shopify_customers_addresses 1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn parents_without_children_clear_stored_children() {
        let wh = Arc::new(FakeWarehouse::default());
        wh.existing.lock().unwrap().insert(
            "shopify_customers_addresses".into(),
            TableSchema::infer(&[address(100, 1)], "id", &Default::default()),
        );
        let descriptor =
            DatasetDescriptor::builtin(DatasetKind::Customers).with_child_table(addresses());
        let result = loader(wh.clone())
            .load("shopify_customers", &descriptor, &batch(vec![row(Some(1), "a")]))
            .await
            .unwrap();
        assert_eq!(result.child_rows_written, 0);
        let batches = wh.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let child = &batches[0][1];
        assert_eq!(child.table, "shopify_customers_addresses");
        assert!(child.rows.is_empty());
        assert_eq!(
            child.replace,
            Some(ParentScope {
                column: "customer_id".into(),
                keys: vec![KeyValue::Int(1)],
            })
        );
    }

    #[tokio::test]
    async fn rows_are_conformed_to_the_stored_schema() {
        let wh = Arc::new(FakeWarehouse::default());
        wh.existing.lock().unwrap().insert(
            "shopify_customers".into(),
            TableSchema {
                columns: vec![
                    ColumnSpec {
                        name: "id".into(),
                        column_type: ColumnType::Int64,
                        nullable: false,
                    },
                    ColumnSpec {
                        name: "name".into(),
                        column_type: ColumnType::String,
                        nullable: true,
                    },
                    ColumnSpec {
                        name: "last_order_id".into(),
                        column_type: ColumnType::String,
                        nullable: true,
                    },
                ],
                primary_key: "id".into(),
            },
        );
        let mut populated = row(Some(1), "a");
        populated.insert("last_order_id", FieldValue::Int64(5));
        let descriptor = DatasetDescriptor::builtin(DatasetKind::Customers);
        loader(wh.clone())
            .load("shopify_customers", &descriptor, &batch(vec![populated]))
            .await
            .unwrap();
        let batches = wh.batches.lock().unwrap();
        assert_eq!(
            batches[0][0].rows[0].get("last_order_id"),
            Some(&FieldValue::String("5".into()))
        );
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let wh = Arc::new(FakeWarehouse::default());
        let descriptor = DatasetDescriptor::builtin(DatasetKind::Customers);
        let result = loader(wh.clone())
            .load("shopify_customers", &descriptor, &batch(Vec::new()))
            .await
            .unwrap();
        assert_eq!(result, LoadResult::default());
        assert!(!wh
            .calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.starts_with("create_table")));
    }
}
