//! Identifier assignment service (recruit-assign) - Main entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use recruit_assign::{collect_statistics, AssignmentService};
use recruit_common::config::resolve_config_path;
use recruit_common::logging::init_logging;
use recruit_common::poller::{cancel_on_shutdown, run_once, run_poll_loop};
use recruit_common::store::RedcapClient;
use recruit_common::{FieldDetector, RecordStore, TomlConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line arguments for recruit-assign
#[derive(Parser, Debug)]
#[command(name = "recruit-assign")]
#[command(about = "Evaluates new screening records and assigns study identifiers")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "RECRUIT_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,

    /// Seconds between poll cycles (overrides [poll] interval_secs)
    #[arg(short, long)]
    interval: Option<u64>,

    /// Print assignment statistics and exit
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config);
    let mut config = TomlConfig::load(&config_path)
        .await
        .context("Failed to load configuration")?;
    if let Some(interval) = args.interval {
        config.poll.interval_secs = interval.max(1);
    }

    init_logging(&config.logging).context("Failed to initialize logging")?;
    if !config_path.exists() {
        warn!("Config file {:?} not found, running on defaults and environment", config_path);
    }

    let store: Arc<dyn RecordStore> =
        Arc::new(RedcapClient::from_config(&config).context("Failed to create REDCap client")?);
    let detector = Arc::new(
        FieldDetector::from_config(&config.fields).context("Failed to load detection rules")?,
    );

    if args.stats {
        let stats = collect_statistics(store.as_ref(), &detector, &config.assignment)
            .await
            .context("Failed to collect statistics")?;
        println!("{}", stats);
        return Ok(());
    }

    let service = AssignmentService::from_config(store, detector, &config);
    let cancel = CancellationToken::new();

    if args.once {
        run_once(&service, &cancel).await?;
        return Ok(());
    }

    info!(
        "Starting recruit-assign, polling every {}s",
        config.poll.interval_secs
    );
    cancel_on_shutdown(cancel.clone());
    run_poll_loop(&service, config.poll.interval(), cancel).await?;

    info!("Shutdown complete");
    Ok(())
}
