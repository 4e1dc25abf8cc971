//! Ineligibility notice service (recruit-ineligible) - Main entry point

use clap::Parser;
use recruit_notify::cli::{run, Args};
use recruit_notify::NotificationKind;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    run(NotificationKind::IneligibleNotice, args).await
}
