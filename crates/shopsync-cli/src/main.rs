mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use shopsync_types::dataset::DatasetKind;

#[derive(Parser)]
#[command(
    name = "shopsync",
    version,
    about = "Incremental Shopify to warehouse extraction and load"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, normalize and load datasets
    Run {
        /// Pipeline YAML file; configuration comes from the environment when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Extract and stage only, without touching the warehouse
        #[arg(long, conflicts_with = "load")]
        extract: bool,
        /// Load previously staged batches only
        #[arg(long)]
        load: bool,
        /// Comma-separated subset of datasets (default: all configured)
        #[arg(long, value_delimiter = ',')]
        datasets: Vec<DatasetKind>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate configuration and open the state and warehouse backends
    Check {
        /// Pipeline YAML file; configuration comes from the environment when omitted
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // A missing .env file is fine; real environment variables still apply.
    dotenv::dotenv().ok();
    logging::init(&cli.log_level);

    let result = match cli.command {
        Commands::Run {
            config,
            extract,
            load,
            datasets,
            json,
        } => {
            let args = commands::run::RunArgs {
                config,
                mode: commands::run::mode(extract, load),
                datasets,
                json,
            };
            commands::run::execute(args).await
        }
        Commands::Check { config } => commands::check::execute(config.as_deref())
            .await
            .map(|()| 0),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "shopsync",
            "run",
            "--load",
            "--datasets",
            "orders,products",
            "--json",
        ])
        .unwrap();
        let Commands::Run {
            load,
            extract,
            datasets,
            json,
            config,
        } = cli.command
        else {
            panic!("expected run");
        };
        assert!(load && !extract && json);
        assert!(config.is_none());
        assert_eq!(datasets, vec![DatasetKind::Orders, DatasetKind::Products]);
    }

    #[test]
    fn extract_and_load_conflict() {
        assert!(Cli::try_parse_from(["shopsync", "run", "--extract", "--load"]).is_err());
    }

    #[test]
    fn unknown_dataset_is_rejected() {
        assert!(Cli::try_parse_from(["shopsync", "run", "--datasets", "refunds"]).is_err());
    }

    #[test]
    fn log_level_is_global() {
        let cli =
            Cli::try_parse_from(["shopsync", "check", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level, "debug");
    }
}
