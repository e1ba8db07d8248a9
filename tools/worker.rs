/// Worker — runs the generation queue against a world database.
///
/// Usage: worldsmith-worker [--config <file>] [--once]
use clap::Parser;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

use worldsmith::config::EngineConfig;
use worldsmith::service::Worker;
use worldsmith::telemetry::init_logging;
use worldsmith::WorldEngine;

#[derive(Parser)]
#[command(name = "worldsmith-worker")]
#[command(about = "Processes queued world generation jobs")]
#[command(version = "0.1.0")]
struct Cli {
    /// RON configuration file. Defaults plus environment overrides when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drain the queue once and exit instead of polling.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match EngineConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("ERROR: {e}");
                process::exit(1);
            }
        },
        None => EngineConfig::from_env(),
    };

    init_logging(&config.log);

    let engine = match WorldEngine::builder().config(&config).and_then(|b| b.build()) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "failed to start engine");
            process::exit(1);
        }
    };

    let worker = Worker::new(engine, config.worker.clone());

    if cli.once {
        if let Err(e) = worker.recover() {
            error!(error = %e, "stale lease recovery failed");
        }
        let stats = worker.drain().await;
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            "queue drained"
        );
        if stats.store_errors > 0 {
            process::exit(1);
        }
        return;
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };
    worker.run(shutdown).await;
}
