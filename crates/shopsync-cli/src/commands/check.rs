use std::path::Path;

use anyhow::Result;
use dest_sqlite::SqliteWarehouse;
use shopsync_state::{SqliteWatermarkStore, WatermarkStore};

use super::load_config;

/// Execute the `check` command: validate configuration and open the state
/// and warehouse backends.
pub async fn execute(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    println!("Pipeline structure: OK");

    let pipeline_id = config.pipeline_id();
    let state_ok = match SqliteWatermarkStore::open(&config.state.path) {
        Ok(store) => {
            let mut ok = true;
            for dataset in config.datasets.iter().map(|d| d.name) {
                match store.get(&pipeline_id, dataset) {
                    Ok(watermark) => println!("  {:10} watermark {watermark}", dataset.as_str()),
                    Err(e) => {
                        println!("  {:10} {e}", dataset.as_str());
                        ok = false;
                    }
                }
            }
            ok
        }
        Err(e) => {
            println!("  {e}");
            false
        }
    };
    print_status("State backend", state_ok);

    let warehouse_ok = match SqliteWarehouse::open(&config.destination.path) {
        Ok(_) => true,
        Err(e) => {
            println!("  {e}");
            false
        }
    };
    print_status("Warehouse", warehouse_ok);

    if state_ok && warehouse_ok {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn print_status(label: &str, ok: bool) {
    let status = if ok { "OK" } else { "FAILED" };
    println!("{:18} {}", format!("{label}:"), status);
}
