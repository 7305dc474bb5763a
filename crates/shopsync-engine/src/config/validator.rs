//! Semantic validation for parsed pipeline configuration values.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::types::{PipelineConfig, MAX_PAGE_SIZE};
use crate::normalize::sanitize_identifier;

fn require(value: &str, what: &str, errors: &mut Vec<String>) {
    if value.trim().is_empty() {
        errors.push(format!("{what} must not be empty"));
    }
}

fn check_identifier(name: &str, context: &str, errors: &mut Vec<String>) {
    if name.is_empty() || sanitize_identifier(name) != name {
        errors.push(format!(
            "{context}: '{name}' is not a valid warehouse identifier (use lowercase letters, digits and '_', not starting with a digit)"
        ));
    }
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    require(&config.pipeline, "Pipeline name", &mut errors);
    require(&config.source.store, "Source store name", &mut errors);
    require(&config.source.api_key, "Source api_key", &mut errors);
    require(&config.source.password, "Source password", &mut errors);
    require(&config.source.api_version, "Source api_version", &mut errors);
    require(&config.destination.project, "Destination project", &mut errors);
    require(&config.destination.location, "Destination location", &mut errors);
    check_identifier(&config.destination.dataset, "Destination dataset", &mut errors);

    if !(1..=MAX_PAGE_SIZE).contains(&config.source.page_size) {
        errors.push(format!(
            "Source page_size must be between 1 and {MAX_PAGE_SIZE}, got {}",
            config.source.page_size
        ));
    }
    if config.source.timeout_secs == 0 {
        errors.push("Source timeout_secs must be > 0".to_string());
    }

    let retry = &config.retry;
    if retry.max_attempts == 0 {
        errors.push("retry.max_attempts must be at least 1".to_string());
    }
    if retry.max_rate_limit_attempts == 0 {
        errors.push("retry.max_rate_limit_attempts must be at least 1".to_string());
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        errors.push(format!(
            "retry.max_delay_ms ({}) must not be below retry.base_delay_ms ({})",
            retry.max_delay_ms, retry.base_delay_ms
        ));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        errors.push(format!("retry.jitter must be within [0, 1], got {}", retry.jitter));
    }

    if config.datasets.is_empty() {
        errors.push("At least one dataset must be configured".to_string());
    }

    let mut seen = HashSet::new();
    let mut tables = HashSet::new();
    for dataset in &config.datasets {
        if !seen.insert(dataset.name) {
            errors.push(format!("Dataset '{}' is configured more than once", dataset.name));
            continue;
        }
        let descriptor = dataset.descriptor();
        let context = format!("Dataset '{}'", dataset.name);
        check_identifier(&descriptor.table, &format!("{context} table"), &mut errors);
        if !tables.insert(descriptor.table.clone()) {
            errors.push(format!(
                "{context}: table '{}' is used by another dataset",
                descriptor.table
            ));
        }

        let mut fields = HashSet::new();
        for child in &descriptor.child_tables {
            if !fields.insert(child.field.as_str()) {
                errors.push(format!(
                    "{context}: field '{}' has more than one child table",
                    child.field
                ));
            }
            require(&child.field, &format!("{context} child table field"), &mut errors);
            let child_table = descriptor.child_table_name(child);
            check_identifier(&child_table, &format!("{context} child table"), &mut errors);
            check_identifier(
                &child.primary_key,
                &format!("{context} child table primary_key"),
                &mut errors,
            );
            check_identifier(
                &child.parent_column,
                &format!("{context} child table parent_column"),
                &mut errors,
            );
            if !tables.insert(child_table.clone()) {
                errors.push(format!(
                    "{context}: child table '{child_table}' collides with another table"
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;
    use rstest::rstest;

    fn valid_yaml() -> &'static str {
        r#"
version: "1.0"
pipeline: test_pipeline
source:
  store: acme
  api_key: key
  password: secret
destination:
  project: analytics
"#
    }

    fn validation_error(yaml: &str) -> String {
        let config = parse_pipeline_str(yaml).unwrap();
        validate_pipeline(&config).unwrap_err().to_string()
    }

    #[test]
    fn valid_pipeline_passes() {
        let config = parse_pipeline_str(valid_yaml()).unwrap();
        assert!(validate_pipeline(&config).is_ok());
    }

    #[test]
    fn wrong_version_fails() {
        let err = validation_error(&valid_yaml().replace("\"1.0\"", "\"2.0\""));
        assert!(err.contains("Unsupported pipeline version"));
    }

    #[test]
    fn empty_values_are_all_reported() {
        let yaml = valid_yaml()
            .replace("test_pipeline", "\"\"")
            .replace("store: acme", "store: \"\"")
            .replace("password: secret", "password: \"\"");
        let err = validation_error(&yaml);
        assert!(err.contains("Pipeline name must not be empty"));
        assert!(err.contains("Source store name must not be empty"));
        assert!(err.contains("Source password must not be empty"));
    }

    #[rstest]
    #[case("page_size: 0", "page_size must be between 1 and 250")]
    #[case("page_size: 251", "page_size must be between 1 and 250")]
    fn page_size_bounds(#[case] line: &str, #[case] expected: &str) {
        let yaml = valid_yaml().replace("  password: secret", &format!("  password: secret\n  {line}"));
        assert!(validation_error(&yaml).contains(expected));
    }

    #[rstest]
    #[case("max_attempts: 0", "retry.max_attempts must be at least 1")]
    #[case("max_rate_limit_attempts: 0", "retry.max_rate_limit_attempts must be at least 1")]
    #[case("jitter: 1.5", "retry.jitter must be within [0, 1]")]
    #[case("base_delay_ms: 5000\n  max_delay_ms: 10", "must not be below retry.base_delay_ms")]
    fn retry_bounds(#[case] line: &str, #[case] expected: &str) {
        let yaml = format!("{}retry:\n  {line}\n", valid_yaml());
        assert!(validation_error(&yaml).contains(expected));
    }

    #[test]
    fn duplicate_dataset_fails() {
        let yaml = format!(
            "{}datasets:\n  - name: orders\n  - name: orders\n",
            valid_yaml()
        );
        assert!(validation_error(&yaml).contains("configured more than once"));
    }

    #[test]
    fn empty_dataset_list_fails() {
        let yaml = format!("{}datasets: []\n", valid_yaml());
        assert!(validation_error(&yaml).contains("At least one dataset"));
    }

    #[test]
    fn invalid_table_name_fails() {
        let yaml = format!(
            "{}datasets:\n  - name: orders\n    table: Shopify-Orders\n",
            valid_yaml()
        );
        assert!(validation_error(&yaml).contains("not a valid warehouse identifier"));
    }

    #[test]
    fn shared_table_name_fails() {
        let yaml = format!(
            "{}datasets:\n  - name: orders\n    table: shop\n  - name: products\n    table: shop\n",
            valid_yaml()
        );
        assert!(validation_error(&yaml).contains("used by another dataset"));
    }
}
