//! Pipeline YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::PipelineConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut missing: Vec<String> = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        let name = &cap[1];
        lookup(name).unwrap_or_else(|| {
            if !missing.iter().any(|m| m == name) {
                missing.push(name.to_string());
            }
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

/// Parse a pipeline YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_pipeline_str(yaml_str: &str) -> Result<PipelineConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: PipelineConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline YAML")?;
    Ok(config)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopsync_types::dataset::DatasetKind;

    #[test]
    fn substitutes_from_lookup() {
        let result = substitute_with("store: ${SS_STORE}\nkey: ${SS_KEY}", |name| match name {
            "SS_STORE" => Some("acme".into()),
            "SS_KEY" => Some("k".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(result, "store: acme\nkey: k");
    }

    #[test]
    fn env_var_substitution() {
        std::env::set_var("SS_TEST_STORE", "acme-shop");
        let result = substitute_env_vars("store: ${SS_TEST_STORE}").unwrap();
        assert_eq!(result, "store: acme-shop");
        std::env::remove_var("SS_TEST_STORE");
    }

    #[test]
    fn no_env_vars_passthrough() {
        let input = "store: acme\npage_size: 50";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn all_missing_env_vars_reported() {
        let err = substitute_env_vars("${SS_MISSING_X} and ${SS_MISSING_Y}")
            .unwrap_err()
            .to_string();
        assert!(err.contains("SS_MISSING_X"));
        assert!(err.contains("SS_MISSING_Y"));
    }

    #[test]
    fn parse_minimal_pipeline_applies_defaults() {
        let yaml = r#"
version: "1.0"
pipeline: shopify_to_warehouse
source:
  store: acme
  api_key: key
  password: secret
destination:
  project: analytics-prod
"#;
        let config = parse_pipeline_str(yaml).unwrap();
        assert_eq!(config.pipeline, "shopify_to_warehouse");
        assert_eq!(config.source.api_version, "2023-10");
        assert_eq!(config.source.page_size, 250);
        assert_eq!(config.destination.dataset, "raw_data");
        assert_eq!(config.destination.location, "EU");
        assert_eq!(config.datasets.len(), 3);
        assert_eq!(config.datasets[0].name, DatasetKind::Orders);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.staging.dir, std::path::PathBuf::from("data"));
    }

    #[test]
    fn parse_dataset_overrides() {
        let yaml = r#"
version: "1.0"
pipeline: p
source: { store: acme, api_key: k, password: s, page_size: 50 }
destination: { project: proj, dataset: shop_raw, location: US }
datasets:
  - name: orders
    table: orders_v2
    child_tables:
      - field: line_items
        table_suffix: line_items
        primary_key: id
        parent_column: order_id
  - name: products
"#;
        let config = parse_pipeline_str(yaml).unwrap();
        let descriptors = config.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].table, "orders_v2");
        assert_eq!(descriptors[0].child_tables[0].parent_column, "order_id");
        assert_eq!(descriptors[1].table, "shopify_products");
    }

    #[test]
    fn unknown_dataset_is_a_parse_error() {
        let yaml = r#"
version: "1.0"
pipeline: p
source: { store: acme, api_key: k, password: s }
destination: { project: proj }
datasets:
  - name: refunds
"#;
        let err = format!("{:#}", parse_pipeline_str(yaml).unwrap_err());
        assert!(err.contains("Failed to parse pipeline YAML"), "got: {err}");
    }

    #[test]
    fn parse_pipeline_file_not_found() {
        let err = parse_pipeline(Path::new("/nonexistent/pipeline.yaml"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to read pipeline file"));
    }
}
