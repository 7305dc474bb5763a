pub mod check;
pub mod run;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use shopsync_engine::config::types::{PipelineConfig, SourceConfig};
use shopsync_engine::config::{env, parser, validator};
use source_shopify::ShopifyConfig;

/// Load the pipeline configuration from YAML or, without a path, from the
/// environment, then validate it.
pub(crate) fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => parser::parse_pipeline(path)
            .with_context(|| format!("Failed to parse pipeline: {}", path.display()))?,
        None => env::from_env().context("Failed to read configuration from environment")?,
    };
    validator::validate_pipeline(&config)?;
    Ok(config)
}

pub(crate) fn shopify_config(source: &SourceConfig) -> ShopifyConfig {
    ShopifyConfig {
        store: source.store.clone(),
        api_key: source.api_key.clone(),
        password: source.password.clone(),
        api_version: source.api_version.clone(),
        base_url: source.base_url.clone(),
        timeout: Duration::from_secs(source.timeout_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
version: "1.0"
pipeline: nightly
source:
  store: acme
  api_key: key
  password: secret
destination:
  project: analytics
"#;

    #[test]
    fn yaml_config_is_parsed_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, PIPELINE).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.pipeline, "nightly");
        assert_eq!(config.datasets.len(), 3);

        let shopify = shopify_config(&config.source);
        assert_eq!(shopify.store, "acme");
        assert_eq!(shopify.api_version, "2023-10");
    }

    #[test]
    fn invalid_yaml_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, PIPELINE.replace("\"1.0\"", "\"2.0\"")).unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("version"));
    }
}
