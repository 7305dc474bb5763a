//! Watermark store trait definition.
//!
//! Model types live in [`shopsync_types::state`] and
//! [`shopsync_types::watermark`].

use shopsync_types::dataset::DatasetKind;
use shopsync_types::state::{PipelineId, RunStats, RunStatus};
use shopsync_types::watermark::Watermark;

use crate::error;

/// Storage contract for per-dataset watermarks and run history.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn WatermarkStore>`. Calls are blocking; async callers go through
/// `spawn_blocking`.
pub trait WatermarkStore: Send + Sync {
    /// Read the committed watermark for a (pipeline, dataset) pair.
    ///
    /// Returns [`Watermark::Beginning`] when the dataset has never committed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure or
    /// an undecodable stored value.
    fn get(&self, pipeline: &PipelineId, dataset: DatasetKind) -> error::Result<Watermark>;

    /// Atomically advance the watermark to `watermark`.
    ///
    /// Never moves backwards: committing a value at or below the stored one
    /// leaves it untouched. Returns the effective stored watermark.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure or
    /// when the cursor kind differs from the stored one.
    fn commit(
        &self,
        pipeline: &PipelineId,
        dataset: DatasetKind,
        watermark: &Watermark,
    ) -> error::Result<Watermark>;

    /// Begin a dataset run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, pipeline: &PipelineId, dataset: DatasetKind) -> error::Result<i64>;

    /// Finalize a dataset run with status and counters.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()>;
}
