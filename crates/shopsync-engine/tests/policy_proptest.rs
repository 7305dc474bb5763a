use std::time::Duration;

use proptest::prelude::*;
use rstest::rstest;
use shopsync_engine::config::parser::parse_pipeline_str;
use shopsync_engine::config::validator::validate_pipeline;
use shopsync_engine::normalize::{sanitize_identifier, MAX_IDENTIFIER_LEN};
use shopsync_engine::retry::RetryPolicy;

fn pipeline_yaml(page_size: u32, jitter: f64) -> String {
    format!(
        r#"
version: "1.0"
pipeline: p
source:
  store: acme
  api_key: k
  password: s
  page_size: {page_size}
destination:
  project: analytics
retry:
  jitter: {jitter}
"#
    )
}

#[rstest]
#[case(1, true)]
#[case(250, true)]
#[case(0, false)]
#[case(251, false)]
fn page_size_bounds(#[case] page_size: u32, #[case] valid: bool) {
    let config = parse_pipeline_str(&pipeline_yaml(page_size, 0.0)).unwrap();
    assert_eq!(validate_pipeline(&config).is_ok(), valid);
}

#[rstest]
#[case("Total Price", "total_price")]
#[case("2fa_enabled", "_2fa_enabled")]
#[case("__id__", "id")]
#[case("¿?", "_unnamed")]
fn sanitize_cases(#[case] raw: &str, #[case] expected: &str) {
    assert_eq!(sanitize_identifier(raw), expected);
}

proptest! {
    #[test]
    fn sanitized_names_are_valid_identifiers(raw in ".{0,400}") {
        let name = sanitize_identifier(&raw);
        prop_assert!(!name.is_empty());
        prop_assert!(name.len() <= MAX_IDENTIFIER_LEN);
        prop_assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
        prop_assert!(!name.starts_with(|c: char| c.is_ascii_digit()));
    }

    #[test]
    fn valid_identifiers_are_unchanged(name in "[a-z][a-z0-9_]{0,30}[a-z0-9]") {
        prop_assert_eq!(sanitize_identifier(&name), name);
    }

    #[test]
    fn backoff_is_monotonic_and_capped(base_ms in 1u64..2_000, max_ms in 1u64..120_000, attempt in 1u32..40) {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms.max(base_ms)),
            ..RetryPolicy::default()
        };
        let here = policy.backoff(attempt);
        prop_assert!(here <= policy.max_delay);
        prop_assert!(here <= policy.backoff(attempt + 1));
    }

    #[test]
    fn jittered_delay_stays_in_band(jitter in 0.0f64..=1.0, attempt in 1u32..10) {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            jitter,
            ..RetryPolicy::default()
        };
        let backoff = policy.backoff(attempt);
        let delay = policy.delay(attempt, None);
        prop_assert!(delay <= policy.max_delay);
        prop_assert!(delay >= backoff.mul_f64(1.0 - jitter).saturating_sub(Duration::from_millis(1)));
        prop_assert!(delay <= backoff.mul_f64(1.0 + jitter) + Duration::from_millis(1));
    }

    #[test]
    fn jitter_outside_unit_interval_is_rejected(jitter in 1.001f64..10.0) {
        let config = parse_pipeline_str(&pipeline_yaml(250, jitter)).unwrap();
        prop_assert!(validate_pipeline(&config).is_err());
    }
}
