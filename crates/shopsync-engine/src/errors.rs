//! Dataset-level pipeline errors and their operator-facing categories.

use shopsync_state::StateError;
use shopsync_types::dataset::DatasetKind;
use shopsync_types::error::ErrorCategory;
use shopsync_types::schema::FieldMismatch;
use shopsync_types::source::SourceError;
use shopsync_types::warehouse::WarehouseError;

use crate::normalize::{NameConflict, NormalizeError};
use crate::retry::{RetryClass, RetryError, Retryable};
use crate::staging::StagingError;

/// Why a dataset's state machine ended in `Failed`.
///
/// Caught at the dataset boundary and recorded in the run report; only
/// [`PipelineError::Auth`] affects other datasets.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("page fetch failed after {attempts} attempts: {last}")]
    TransientFetchExhausted { attempts: u32, last: SourceError },

    #[error(transparent)]
    Source(SourceError),

    #[error("schema conflict: {}", join(.conflicts))]
    SchemaConflict { conflicts: Vec<NameConflict> },

    #[error("schema mismatch on {table}: {}", join(.fields))]
    SchemaMismatch {
        table: String,
        fields: Vec<FieldMismatch>,
    },

    #[error("watermark store error: {0}")]
    WatermarkStore(#[from] StateError),

    #[error("load into {table} failed: {message}")]
    LoadPartialFailure { table: String, message: String },

    #[error("warehouse error: {0}")]
    Warehouse(String),

    #[error("no staged batch for {dataset}: {message}")]
    StagingNotFound {
        dataset: DatasetKind,
        message: String,
    },

    #[error(transparent)]
    Staging(StagingError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cancelled before {step}")]
    Cancelled { step: &'static str },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl PipelineError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth(_) => ErrorCategory::Auth,
            Self::TransientFetchExhausted { .. } => ErrorCategory::TransientFetchExhausted,
            Self::Source(_) => ErrorCategory::Source,
            Self::SchemaConflict { .. } => ErrorCategory::SchemaConflict,
            Self::SchemaMismatch { .. } => ErrorCategory::SchemaMismatch,
            Self::WatermarkStore(_) => ErrorCategory::WatermarkStore,
            Self::LoadPartialFailure { .. } | Self::Warehouse(_) => {
                ErrorCategory::LoadPartialFailure
            }
            Self::StagingNotFound { .. } => ErrorCategory::StagingNotFound,
            Self::Staging(_) => ErrorCategory::Staging,
            Self::Config(_) => ErrorCategory::Config,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether this failure aborts every other dataset in the run.
    #[must_use]
    pub fn is_run_fatal(&self) -> bool {
        self.category().is_run_fatal()
    }
}

impl Retryable for SourceError {
    fn retry_class(&self) -> RetryClass {
        match self {
            Self::RateLimited { retry_after } => RetryClass::RateLimited(*retry_after),
            Self::Transient(_) => RetryClass::Transient,
            Self::Auth(_) | Self::Fatal(_) => RetryClass::Fatal,
        }
    }
}

impl From<SourceError> for PipelineError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Auth(message) => Self::Auth(message),
            other => Self::Source(other),
        }
    }
}

impl From<RetryError<SourceError>> for PipelineError {
    fn from(err: RetryError<SourceError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => {
                Self::TransientFetchExhausted { attempts, last }
            }
            RetryError::Fatal(err) => err.into(),
        }
    }
}

impl From<NormalizeError> for PipelineError {
    fn from(err: NormalizeError) -> Self {
        let NormalizeError::SchemaConflict { conflicts, .. } = err;
        Self::SchemaConflict { conflicts }
    }
}

impl From<WarehouseError> for PipelineError {
    fn from(err: WarehouseError) -> Self {
        match err {
            WarehouseError::Auth(message) => Self::Auth(message),
            WarehouseError::Partial { table, message } => {
                Self::LoadPartialFailure { table, message }
            }
            WarehouseError::Backend(message) => Self::Warehouse(message),
        }
    }
}

impl From<StagingError> for PipelineError {
    fn from(err: StagingError) -> Self {
        match err {
            StagingError::NotFound { dataset, path } => Self::StagingNotFound {
                dataset,
                message: format!("{} does not exist", path.display()),
            },
            other => Self::Staging(other),
        }
    }
}
