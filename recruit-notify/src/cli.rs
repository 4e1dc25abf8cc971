//! Shared entry point for the notification binaries

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use recruit_common::config::resolve_config_path;
use recruit_common::logging::init_logging;
use recruit_common::notify::notifier_from_config;
use recruit_common::poller::{cancel_on_shutdown, run_once, run_poll_loop};
use recruit_common::store::RedcapClient;
use recruit_common::{FieldDetector, RecordStore, TomlConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{NotificationKind, NotificationService};

/// Command-line arguments shared by recruit-invite and recruit-ineligible
#[derive(Parser, Debug)]
#[command(version)]
pub struct Args {
    /// Configuration file
    #[arg(short, long, env = "RECRUIT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run a single poll cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Seconds between poll cycles (overrides [poll] interval_secs)
    #[arg(short, long)]
    pub interval: Option<u64>,

    /// Log messages instead of sending them and leave records unchanged
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn run(kind: NotificationKind, args: Args) -> Result<()> {
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
    let notifier = notifier_from_config(&config.notify, args.dry_run)
        .context("Failed to create notifier")?;
    if args.dry_run {
        warn!("Dry run: messages will be logged, not sent");
    }

    let service = NotificationService::from_config(kind, store, detector, notifier, &config)
        .with_dry_run(args.dry_run);
    let cancel = CancellationToken::new();

    if args.once {
        run_once(&service, &cancel).await?;
        return Ok(());
    }

    info!(
        "Starting {}, polling every {}s",
        kind.service_name(),
        config.poll.interval_secs
    );
    cancel_on_shutdown(cancel.clone());
    run_poll_loop(&service, config.poll.interval(), cancel).await?;

    info!("Shutdown complete");
    Ok(())
}
