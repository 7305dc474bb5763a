//! Pipeline configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shopsync_types::dataset::{ChildTableSpec, DatasetDescriptor, DatasetKind};
use shopsync_types::state::PipelineId;

use crate::retry::RetryPolicy;

pub const DEFAULT_API_VERSION: &str = "2023-10";
pub const DEFAULT_PAGE_SIZE: u32 = 250;
pub const MAX_PAGE_SIZE: u32 = 250;
pub const DEFAULT_DATASET_ID: &str = "raw_data";
pub const DEFAULT_LOCATION: &str = "EU";
pub const DEFAULT_DATASET_DESCRIPTION: &str = "Raw data from Shopify store.";
pub const DEFAULT_STAGING_DIR: &str = "data";
pub const DEFAULT_WAREHOUSE_PATH: &str = "warehouse.db";
pub const DEFAULT_STATE_PATH: &str = "state.db";

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    /// Datasets to move, in run order. Defaults to all supported datasets.
    #[serde(default = "default_datasets")]
    pub datasets: Vec<DatasetConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub state: StateConfig,
}

impl PipelineConfig {
    #[must_use]
    pub fn pipeline_id(&self) -> PipelineId {
        PipelineId::new(self.pipeline.clone())
    }

    /// Descriptors for the configured datasets, in run order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<DatasetDescriptor> {
        self.datasets.iter().map(DatasetConfig::descriptor).collect()
    }

    /// Descriptor for one configured dataset.
    #[must_use]
    pub fn descriptor(&self, kind: DatasetKind) -> Option<DatasetDescriptor> {
        self.datasets
            .iter()
            .find(|d| d.name == kind)
            .map(DatasetConfig::descriptor)
    }
}

/// Source store and credentials.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Store name, the `<store>` in `<store>.myshopify.com`.
    pub store: String,
    pub api_key: String,
    pub password: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Overrides the store URL (tests, proxies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("store", &self.store)
            .field("api_key", &"<redacted>")
            .field("password", &"<redacted>")
            .field("api_version", &self.api_version)
            .field("page_size", &self.page_size)
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Warehouse dataset and location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    /// Warehouse project the dataset belongs to.
    pub project: String,
    #[serde(default = "default_dataset_id")]
    pub dataset: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_description")]
    pub description: String,
    /// Local warehouse database file.
    #[serde(default = "default_warehouse_path")]
    pub path: PathBuf,
}

/// One dataset entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub name: DatasetKind,
    /// Destination table; defaults to the built-in mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Array fields moved into child tables. Other arrays stay repeated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_tables: Vec<ChildTableSpec>,
}

impl DatasetConfig {
    #[must_use]
    pub fn new(name: DatasetKind) -> Self {
        Self {
            name,
            table: None,
            child_tables: Vec::new(),
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> DatasetDescriptor {
        let mut descriptor = DatasetDescriptor::builtin(self.name);
        if let Some(table) = &self.table {
            descriptor = descriptor.with_table(table.clone());
        }
        for spec in &self.child_tables {
            descriptor = descriptor.with_child_table(spec.clone());
        }
        descriptor
    }
}

/// Page fetch retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempt ceiling for transient failures (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Attempt ceiling for rate-limited responses (first try included).
    #[serde(default = "default_max_rate_limit_attempts")]
    pub max_rate_limit_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Random spread applied to computed delays, in `[0, 1]`.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_rate_limit_attempts: default_max_rate_limit_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            max_rate_limit_attempts: self.max_rate_limit_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

/// Where staged batches are written between extract-only and load-only runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagingConfig {
    #[serde(default = "default_staging_dir")]
    pub dir: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: default_staging_dir(),
        }
    }
}

/// Watermark store location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

fn default_datasets() -> Vec<DatasetConfig> {
    DatasetKind::ALL.into_iter().map(DatasetConfig::new).collect()
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_dataset_id() -> String {
    DEFAULT_DATASET_ID.to_string()
}

fn default_location() -> String {
    DEFAULT_LOCATION.to_string()
}

fn default_description() -> String {
    DEFAULT_DATASET_DESCRIPTION.to_string()
}

fn default_warehouse_path() -> PathBuf {
    PathBuf::from(DEFAULT_WAREHOUSE_PATH)
}

fn default_max_attempts() -> u32 {
    4
}

fn default_max_rate_limit_attempts() -> u32 {
    8
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STAGING_DIR)
}

fn default_state_path() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_config_overrides_builtin_descriptor() {
        let config = DatasetConfig {
            name: DatasetKind::Orders,
            table: Some("orders_raw".into()),
            child_tables: vec![ChildTableSpec {
                field: "line_items".into(),
                table_suffix: "line_items".into(),
                primary_key: "id".into(),
                parent_column: "order_id".into(),
            }],
        };
        let descriptor = config.descriptor();
        assert_eq!(descriptor.table, "orders_raw");
        assert_eq!(descriptor.child_tables.len(), 1);
        assert_eq!(descriptor.primary_key, "id");
    }

    #[test]
    fn default_retry_matches_policy() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn source_debug_redacts_credentials() {
        let source = SourceConfig {
            store: "acme".into(),
            api_key: "key-123".into(),
            password: "shpat_secret".into(),
            api_version: default_api_version(),
            page_size: DEFAULT_PAGE_SIZE,
            base_url: None,
            timeout_secs: 30,
        };
        let rendered = format!("{source:?}");
        assert!(rendered.contains("acme"));
        assert!(!rendered.contains("key-123"));
        assert!(!rendered.contains("shpat_secret"));
    }
}
