//! Pipeline orchestrator: per-dataset state machines run as concurrent tasks.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use shopsync_state::WatermarkStore;
use shopsync_types::dataset::{DatasetDescriptor, DatasetKind};
use shopsync_types::source::PageSource;
use shopsync_types::state::{PipelineId, RunStats, RunStatus};
use shopsync_types::warehouse::Warehouse;
use shopsync_types::watermark::Watermark;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::types::PipelineConfig;
use crate::errors::PipelineError;
use crate::extract::Extractor;
use crate::load::Loader;
use crate::normalize::normalize_batch;
use crate::result::{DatasetOutcome, DatasetState, RunReport};
use crate::retry::{Clock, TokioClock};
use crate::staging::{StagedBatch, StagingArea};

/// Which part of the dataset state machine a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    /// Extract, normalize, load and commit.
    Full,
    /// Extract and normalize, then persist the staged batch.
    ExtractOnly,
    /// Load a previously staged batch and commit.
    LoadOnly,
}

impl RunMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::ExtractOnly => "extract",
            Self::LoadOnly => "load",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract → normalize → load orchestration over injected collaborators.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    pipeline_id: PipelineId,
    source: Arc<dyn PageSource>,
    loader: Loader,
    store: Arc<dyn WatermarkStore>,
    staging: StagingArea,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn PageSource>,
        warehouse: Arc<dyn Warehouse>,
        store: Arc<dyn WatermarkStore>,
        staging: StagingArea,
    ) -> Self {
        let loader = Loader::from_config(warehouse, &config.destination);
        Self {
            pipeline_id: config.pipeline_id(),
            config: Arc::new(config),
            source,
            loader,
            store,
            staging,
            clock: Arc::new(TokioClock),
        }
    }

    /// Replace the clock used for backoff and quota pauses.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn pipeline_id(&self) -> &PipelineId {
        &self.pipeline_id
    }

    /// Run `datasets` (every configured dataset when empty) concurrently.
    ///
    /// Never fails as a whole: each dataset's failure is recorded in its
    /// outcome. An authentication failure cancels `cancel`, stopping the
    /// other datasets at their next step boundary.
    pub async fn run(
        &self,
        mode: RunMode,
        datasets: &[DatasetKind],
        cancel: CancellationToken,
    ) -> RunReport {
        let start = Instant::now();
        let mut requested: Vec<DatasetKind> = Vec::new();
        let candidates: Vec<DatasetKind> = if datasets.is_empty() {
            self.config.datasets.iter().map(|d| d.name).collect()
        } else {
            datasets.to_vec()
        };
        for kind in candidates {
            if !requested.contains(&kind) {
                requested.push(kind);
            }
        }

        tracing::info!(
            pipeline = %self.pipeline_id,
            mode = %mode,
            datasets = ?requested.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            "Starting pipeline run"
        );

        let mut join_set: JoinSet<DatasetOutcome> = JoinSet::new();
        for kind in &requested {
            let this = self.clone();
            let cancel = cancel.clone();
            let kind = *kind;
            join_set.spawn(async move { this.run_dataset(kind, mode, cancel).await });
        }
        let (mut outcomes, panics) = collect_dataset_results(join_set).await;

        for kind in &requested {
            if outcomes.iter().any(|o| o.dataset == *kind) {
                continue;
            }
            let mut outcome = DatasetOutcome::new(*kind, self.table_for(*kind));
            let err = PipelineError::Internal(anyhow::anyhow!(
                "dataset task panicked: {}",
                panics.join("; ")
            ));
            outcome.fail(DatasetState::Idle, &err);
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| requested.iter().position(|k| *k == o.dataset));

        let report = RunReport {
            pipeline: self.pipeline_id.to_string(),
            mode: mode.as_str(),
            datasets: outcomes,
            duration_secs: start.elapsed().as_secs_f64(),
        };
        let failed = report.failed().len();
        if failed == 0 {
            tracing::info!(
                pipeline = %self.pipeline_id,
                mode = %mode,
                datasets = report.datasets.len(),
                duration_secs = report.duration_secs,
                "Pipeline run completed"
            );
        } else {
            tracing::error!(
                pipeline = %self.pipeline_id,
                mode = %mode,
                failed,
                datasets = report.datasets.len(),
                duration_secs = report.duration_secs,
                "Pipeline run finished with failures"
            );
        }
        report
    }

    fn table_for(&self, kind: DatasetKind) -> String {
        self.config
            .descriptor(kind)
            .map_or_else(|| DatasetDescriptor::builtin(kind).table, |d| d.table)
    }

    async fn run_dataset(
        self,
        kind: DatasetKind,
        mode: RunMode,
        cancel: CancellationToken,
    ) -> DatasetOutcome {
        let start = Instant::now();
        let mut outcome = DatasetOutcome::new(kind, self.table_for(kind));

        let run_id = match self.start_run(kind).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(dataset = %kind, error = %err, "Could not record run start");
                None
            }
        };

        let result = match self.config.descriptor(kind) {
            Some(descriptor) => self.drive(&mut outcome, &descriptor, mode, &cancel).await,
            None => Err(PipelineError::Config(format!(
                "dataset '{kind}' is not configured for this pipeline"
            ))),
        };

        if let Err(err) = result {
            let during = outcome.state;
            outcome.fail(during, &err);
            tracing::error!(
                dataset = %kind,
                during = %during,
                category = %err.category(),
                error = %err,
                "Dataset failed"
            );
            if err.is_run_fatal() && !cancel.is_cancelled() {
                tracing::error!(
                    dataset = %kind,
                    "Authentication failed, cancelling remaining datasets"
                );
                cancel.cancel();
            }
        }
        outcome.duration_secs = start.elapsed().as_secs_f64();

        if let Some(run_id) = run_id {
            if let Err(err) = self.complete_run(run_id, &outcome).await {
                tracing::warn!(dataset = %kind, run_id, error = %err, "Could not record run result");
            }
        }
        outcome
    }

    async fn drive(
        &self,
        outcome: &mut DatasetOutcome,
        descriptor: &DatasetDescriptor,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let kind = descriptor.kind;
        let since = self.get_watermark(kind).await?;
        outcome.watermark_before = since.clone();
        outcome.watermark_after = since.clone();

        if mode == RunMode::LoadOnly {
            check_cancel(cancel, "loading")?;
            transition(outcome, DatasetState::Loading);
            let staging = self.staging.clone();
            let batch = blocking("staging read", move || Ok(staging.read(kind)?)).await?;
            outcome.records_read = batch.len() as u64;
            self.load_and_commit(outcome, descriptor, &batch).await?;

            // Committed already; a leftover staged batch only gets reloaded.
            let staging = self.staging.clone();
            match blocking("staging remove", move || Ok(staging.remove(kind)?)).await {
                Ok(()) => tracing::debug!(dataset = %kind, "Removed staged batch"),
                Err(err) => tracing::warn!(
                    dataset = %kind,
                    error = %err,
                    "Could not remove staged batch"
                ),
            }
            return Ok(());
        }

        check_cancel(cancel, "extracting")?;
        transition(outcome, DatasetState::Extracting);
        let extractor = Extractor::new(
            self.source.clone(),
            self.config.retry.policy(),
            self.clock.clone(),
            self.config.source.page_size,
        )
        .with_cancellation(cancel.clone());
        let walker = extractor.extract(descriptor, since);
        let (raws, candidate) = walker.collect_all().await?;
        outcome.records_read = raws.len() as u64;
        tracing::info!(
            dataset = %kind,
            records_read = outcome.records_read,
            candidate_watermark = %candidate,
            "Extraction complete"
        );

        check_cancel(cancel, "normalizing")?;
        transition(outcome, DatasetState::Normalizing);
        let batch = normalize_batch(descriptor, &raws, candidate)?;
        drop(raws);

        if mode == RunMode::ExtractOnly {
            let staging = self.staging.clone();
            let dir = staging.dir().display().to_string();
            let staged = blocking("staging write", move || {
                staging.write(&batch)?;
                Ok(batch.len())
            })
            .await?;
            transition(outcome, DatasetState::Staged);
            tracing::info!(dataset = %kind, records = staged, dir = %dir, "Staged batch");
            return Ok(());
        }

        check_cancel(cancel, "loading")?;
        transition(outcome, DatasetState::Loading);
        self.load_and_commit(outcome, descriptor, &batch).await
    }

    async fn load_and_commit(
        &self,
        outcome: &mut DatasetOutcome,
        descriptor: &DatasetDescriptor,
        batch: &StagedBatch,
    ) -> Result<(), PipelineError> {
        let loaded = self.loader.load(&descriptor.table, descriptor, batch).await?;
        outcome.records_written = loaded.rows_written;
        outcome.records_skipped = loaded.rows_skipped;

        let store = self.store.clone();
        let pipeline_id = self.pipeline_id.clone();
        let kind = descriptor.kind;
        let candidate = batch.candidate_watermark.clone();
        let committed = blocking("watermark commit", move || {
            Ok(store.commit(&pipeline_id, kind, &candidate)?)
        })
        .await?;
        outcome.watermark_after = committed;
        transition(outcome, DatasetState::Committed);
        tracing::info!(
            dataset = %kind,
            rows_written = loaded.rows_written,
            rows_skipped = loaded.rows_skipped,
            watermark = %outcome.watermark_after,
            "Committed watermark"
        );
        Ok(())
    }

    async fn get_watermark(&self, kind: DatasetKind) -> Result<Watermark, PipelineError> {
        let store = self.store.clone();
        let pipeline_id = self.pipeline_id.clone();
        blocking("watermark get", move || Ok(store.get(&pipeline_id, kind)?)).await
    }

    async fn start_run(&self, kind: DatasetKind) -> Result<i64, PipelineError> {
        let store = self.store.clone();
        let pipeline_id = self.pipeline_id.clone();
        blocking("start_run", move || Ok(store.start_run(&pipeline_id, kind)?)).await
    }

    async fn complete_run(&self, run_id: i64, outcome: &DatasetOutcome) -> Result<(), PipelineError> {
        let status = match outcome.state {
            DatasetState::Committed => RunStatus::Completed,
            DatasetState::Staged => RunStatus::Staged,
            _ => RunStatus::Failed,
        };
        let stats = RunStats {
            records_read: outcome.records_read,
            records_written: outcome.records_written,
            records_skipped: outcome.records_skipped,
            error_message: outcome.error.clone(),
        };
        let store = self.store.clone();
        blocking("complete_run", move || {
            Ok(store.complete_run(run_id, status, &stats)?)
        })
        .await
    }
}

fn transition(outcome: &mut DatasetOutcome, next: DatasetState) {
    debug_assert!(
        outcome.state.can_transition_to(next),
        "illegal transition {} -> {next}",
        outcome.state
    );
    tracing::debug!(dataset = %outcome.dataset, from = %outcome.state, to = %next, "State transition");
    outcome.state = next;
}

fn check_cancel(cancel: &CancellationToken, step: &'static str) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled { step })
    } else {
        Ok(())
    }
}

/// Run blocking store or filesystem work off the async runtime.
async fn blocking<T, F>(what: &'static str, f: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Internal(anyhow::anyhow!("{what} task panicked: {e}")))?
}

async fn collect_dataset_results(
    mut join_set: JoinSet<DatasetOutcome>,
) -> (Vec<DatasetOutcome>, Vec<String>) {
    let mut outcomes = Vec::new();
    let mut panics = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(join_err) => {
                tracing::error!("Dataset task panicked: {join_err}");
                panics.push(join_err.to_string());
            }
        }
    }
    (outcomes, panics)
}
