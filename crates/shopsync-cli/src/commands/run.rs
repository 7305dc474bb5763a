use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dest_sqlite::SqliteWarehouse;
use shopsync_engine::staging::StagingArea;
use shopsync_engine::{Pipeline, RunMode, RunReport};
use shopsync_state::SqliteWatermarkStore;
use shopsync_types::dataset::DatasetKind;
use source_shopify::ShopifySource;
use tokio_util::sync::CancellationToken;

use super::{load_config, shopify_config};

/// Exit code reported when the run is interrupted with Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

pub struct RunArgs {
    pub config: Option<PathBuf>,
    pub mode: RunMode,
    pub datasets: Vec<DatasetKind>,
    pub json: bool,
}

pub fn mode(extract: bool, load: bool) -> RunMode {
    match (extract, load) {
        (true, _) => RunMode::ExtractOnly,
        (_, true) => RunMode::LoadOnly,
        _ => RunMode::Full,
    }
}

/// Execute the `run` command: load and validate configuration, wire the
/// backends and run the pipeline. Returns the process exit code.
pub async fn execute(args: RunArgs) -> Result<u8> {
    let config = load_config(args.config.as_deref())?;

    tracing::info!(
        pipeline = config.pipeline,
        store = config.source.store,
        dataset = config.destination.dataset,
        mode = %args.mode,
        "Pipeline validated"
    );

    let source = ShopifySource::new(&shopify_config(&config.source))?;
    let warehouse = SqliteWarehouse::open(&config.destination.path).with_context(|| {
        format!(
            "Failed to open warehouse: {}",
            config.destination.path.display()
        )
    })?;
    let store = SqliteWatermarkStore::open(&config.state.path).with_context(|| {
        format!("Failed to open state store: {}", config.state.path.display())
    })?;
    let staging = StagingArea::new(config.staging.dir.clone());

    let pipeline = Pipeline::new(
        config,
        Arc::new(source),
        Arc::new(warehouse),
        Arc::new(store),
        staging,
    );

    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    let watcher = {
        let cancel = cancel.clone();
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping datasets at the next step");
                interrupted.store(true, Ordering::SeqCst);
                cancel.cancel();
            }
        })
    };

    let report = pipeline.run(args.mode, &args.datasets, cancel).await;
    watcher.abort();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    if interrupted.load(Ordering::SeqCst) {
        return Ok(EXIT_INTERRUPTED);
    }
    Ok(report.exit_code())
}

fn print_summary(report: &RunReport) {
    println!(
        "Pipeline '{}' ({}) finished in {:.2}s",
        report.pipeline, report.mode, report.duration_secs
    );
    for outcome in &report.datasets {
        println!("  {:10} {}", outcome.dataset.as_str(), outcome.state);
        println!("    Table:           {}", outcome.table);
        println!("    Records read:    {}", outcome.records_read);
        println!("    Records written: {}", outcome.records_written);
        if outcome.records_skipped > 0 {
            println!("    Records skipped: {}", outcome.records_skipped);
        }
        println!(
            "    Watermark:       {} -> {}",
            outcome.watermark_before, outcome.watermark_after
        );
        if let (Some(category), Some(error)) = (outcome.error_category, &outcome.error) {
            let during = outcome
                .failed_during
                .map(|s| format!(" while {s}"))
                .unwrap_or_default();
            println!("    Error:           [{category}]{during} {error}");
        }
        println!("    Duration:        {:.2}s", outcome.duration_secs);
    }

    let failed = report.failed().len();
    if failed == 0 {
        println!("\nAll datasets succeeded.");
    } else {
        println!("\n{failed} of {} dataset(s) failed.", report.datasets.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_from_flags() {
        assert_eq!(mode(false, false), RunMode::Full);
        assert_eq!(mode(true, false), RunMode::ExtractOnly);
        assert_eq!(mode(false, true), RunMode::LoadOnly);
    }
}
