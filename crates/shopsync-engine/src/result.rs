//! Per-dataset outcomes and the aggregated run report.

use std::fmt;

use serde::Serialize;
use shopsync_types::dataset::DatasetKind;
use shopsync_types::error::ErrorCategory;
use shopsync_types::watermark::Watermark;

use crate::errors::PipelineError;

/// Dataset state machine states.
///
/// `Idle → Extracting → Normalizing → Loading → Committed`, with `Staged`
/// as the terminal success state of extract-only runs and `Failed`
/// reachable from any step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    Idle,
    Extracting,
    Normalizing,
    Loading,
    Committed,
    Staged,
    Failed,
}

impl DatasetState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Extracting => "extracting",
            Self::Normalizing => "normalizing",
            Self::Loading => "loading",
            Self::Committed => "committed",
            Self::Staged => "staged",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Staged | Self::Failed)
    }

    /// Whether `self → next` is a legal step.
    #[must_use]
    pub fn can_transition_to(self, next: DatasetState) -> bool {
        use DatasetState::{Committed, Extracting, Failed, Idle, Loading, Normalizing, Staged};
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Extracting | Loading)
            | (Extracting, Normalizing)
            | (Normalizing, Loading | Staged)
            | (Loading, Committed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DatasetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one dataset within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetOutcome {
    pub dataset: DatasetKind,
    pub table: String,
    pub state: DatasetState,
    pub records_read: u64,
    pub records_written: u64,
    pub records_skipped: u64,
    pub watermark_before: Watermark,
    pub watermark_after: Watermark,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Step the dataset was in when it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_during: Option<DatasetState>,
    pub duration_secs: f64,
}

impl DatasetOutcome {
    #[must_use]
    pub fn new(dataset: DatasetKind, table: impl Into<String>) -> Self {
        Self {
            dataset,
            table: table.into(),
            state: DatasetState::Idle,
            records_read: 0,
            records_written: 0,
            records_skipped: 0,
            watermark_before: Watermark::Beginning,
            watermark_after: Watermark::Beginning,
            error_category: None,
            error: None,
            failed_during: None,
            duration_secs: 0.0,
        }
    }

    /// Mark the dataset failed while in `during`.
    pub fn fail(&mut self, during: DatasetState, err: &PipelineError) {
        self.failed_during = Some(during);
        self.state = DatasetState::Failed;
        self.error_category = Some(err.category());
        self.error = Some(err.to_string());
        self.watermark_after = self.watermark_before.clone();
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self.state, DatasetState::Committed | DatasetState::Staged)
    }
}

/// Everything a run did, one entry per requested dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub pipeline: String,
    pub mode: &'static str,
    pub datasets: Vec<DatasetOutcome>,
    pub duration_secs: f64,
}

impl RunReport {
    #[must_use]
    pub fn failed(&self) -> Vec<&DatasetOutcome> {
        self.datasets.iter().filter(|d| !d.succeeded()).collect()
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.datasets.iter().all(DatasetOutcome::succeeded)
    }

    /// 0 when every dataset committed (or staged), 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.all_succeeded())
    }

    #[must_use]
    pub fn outcome(&self, dataset: DatasetKind) -> Option<&DatasetOutcome> {
        self.datasets.iter().find(|d| d.dataset == dataset)
    }
}
