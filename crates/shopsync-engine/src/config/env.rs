//! Pipeline configuration assembled from environment variables.
//!
//! Used when no pipeline YAML is given. Every missing required variable is
//! reported at once.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::config::types::{
    DatasetConfig, DestinationConfig, PipelineConfig, RetryConfig, SourceConfig, StagingConfig,
    StateConfig, DEFAULT_API_VERSION, DEFAULT_DATASET_DESCRIPTION, DEFAULT_DATASET_ID,
    DEFAULT_LOCATION, DEFAULT_PAGE_SIZE, DEFAULT_STAGING_DIR, DEFAULT_STATE_PATH,
    DEFAULT_WAREHOUSE_PATH,
};
use shopsync_types::dataset::DatasetKind;

pub const STORE_NAME: &str = "SHOPIFY_STORE_NAME";
pub const API_KEY: &str = "SHOPIFY_API_KEY";
pub const PASSWORD: &str = "SHOPIFY_PASSWORD";
pub const API_VERSION: &str = "SHOPIFY_API_VERSION";
pub const PROJECT_ID: &str = "GCP_PROJECT_ID";
pub const DATASET_ID: &str = "BQ_DATASET_ID";
pub const LOCATION: &str = "BQ_LOCATION";
pub const DATA_DIR: &str = "DATA_DIR";
pub const WAREHOUSE_PATH: &str = "WAREHOUSE_PATH";
pub const STATE_PATH: &str = "STATE_PATH";
pub const PIPELINE_NAME: &str = "SHOPSYNC_PIPELINE";
pub const PAGE_SIZE: &str = "SHOPSYNC_PAGE_SIZE";

const DEFAULT_PIPELINE_NAME: &str = "shopify_to_warehouse";

/// Build a pipeline configuration from the process environment.
///
/// # Errors
///
/// Returns an error naming every required variable that is unset, or a
/// variable whose value cannot be parsed.
pub fn from_env() -> Result<PipelineConfig> {
    from_lookup(|name| std::env::var(name).ok())
}

/// Build a pipeline configuration from an arbitrary variable lookup.
///
/// # Errors
///
/// See [`from_env`].
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<PipelineConfig> {
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    let missing: Vec<&str> = [STORE_NAME, API_KEY, PASSWORD, PROJECT_ID]
        .into_iter()
        .filter(|&name| get(name).is_none())
        .collect();
    if !missing.is_empty() {
        bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    let page_size = match get(PAGE_SIZE) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{PAGE_SIZE} must be an integer, got '{raw}'"))?,
        None => DEFAULT_PAGE_SIZE,
    };

    Ok(PipelineConfig {
        version: "1.0".to_string(),
        pipeline: get(PIPELINE_NAME).unwrap_or_else(|| DEFAULT_PIPELINE_NAME.to_string()),
        source: SourceConfig {
            store: get(STORE_NAME).unwrap_or_default(),
            api_key: get(API_KEY).unwrap_or_default(),
            password: get(PASSWORD).unwrap_or_default(),
            api_version: get(API_VERSION).unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            page_size,
            base_url: None,
            timeout_secs: 30,
        },
        destination: DestinationConfig {
            project: get(PROJECT_ID).unwrap_or_default(),
            dataset: get(DATASET_ID).unwrap_or_else(|| DEFAULT_DATASET_ID.to_string()),
            location: get(LOCATION).unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            description: DEFAULT_DATASET_DESCRIPTION.to_string(),
            path: get(WAREHOUSE_PATH)
                .map_or_else(|| PathBuf::from(DEFAULT_WAREHOUSE_PATH), PathBuf::from),
        },
        datasets: DatasetKind::ALL.into_iter().map(DatasetConfig::new).collect(),
        retry: RetryConfig::default(),
        staging: StagingConfig {
            dir: get(DATA_DIR).map_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR), PathBuf::from),
        },
        state: StateConfig {
            path: get(STATE_PATH).map_or_else(|| PathBuf::from(DEFAULT_STATE_PATH), PathBuf::from),
        },
    })
}
