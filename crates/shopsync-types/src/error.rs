//! Error classification shared across crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable, operator-facing category of a dataset failure.
///
/// Rendered in snake_case in logs, run history and the JSON run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Credentials rejected by the source or the warehouse. Aborts the run.
    Auth,
    /// Transient or rate-limit retries ran out for a page fetch.
    TransientFetchExhausted,
    /// Two source fields normalize to the same destination name.
    SchemaConflict,
    /// Batch shape does not fit the existing destination table.
    SchemaMismatch,
    /// Watermark or run-history store failure.
    WatermarkStore,
    /// The warehouse rejected part of a batch.
    LoadPartialFailure,
    /// Load-only run found no staged batch.
    StagingNotFound,
    /// Staging file could not be read or written.
    Staging,
    /// Non-retryable source failure (bad response, unexpected status).
    Source,
    /// Invalid configuration.
    Config,
    /// Stopped at a step boundary after the run was cancelled.
    Cancelled,
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::TransientFetchExhausted => "transient_fetch_exhausted",
            Self::SchemaConflict => "schema_conflict",
            Self::SchemaMismatch => "schema_mismatch",
            Self::WatermarkStore => "watermark_store",
            Self::LoadPartialFailure => "load_partial_failure",
            Self::StagingNotFound => "staging_not_found",
            Self::Staging => "staging",
            Self::Source => "source",
            Self::Config => "config",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    /// Whether a failure of this category aborts every other dataset.
    #[must_use]
    pub fn is_run_fatal(self) -> bool {
        matches!(self, Self::Auth)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_serde() {
        for cat in [
            ErrorCategory::Auth,
            ErrorCategory::TransientFetchExhausted,
            ErrorCategory::SchemaConflict,
            ErrorCategory::SchemaMismatch,
            ErrorCategory::WatermarkStore,
            ErrorCategory::LoadPartialFailure,
            ErrorCategory::StagingNotFound,
            ErrorCategory::Staging,
            ErrorCategory::Source,
            ErrorCategory::Config,
            ErrorCategory::Cancelled,
            ErrorCategory::Internal,
        ] {
            let json = serde_json::to_string(&cat).unwrap();
            assert_eq!(json, format!("\"{cat}\""));
        }
    }

    #[test]
    fn only_auth_is_run_fatal() {
        assert!(ErrorCategory::Auth.is_run_fatal());
        assert!(!ErrorCategory::TransientFetchExhausted.is_run_fatal());
        assert!(!ErrorCategory::SchemaMismatch.is_run_fatal());
    }
}
