//! Poll loop runner shared by every service
//!
//! A service implements one cycle; the runner repeats it on an interval until
//! cancelled. Records are handled sequentially within a cycle and the
//! cancellation token is checked between records, so a record that has
//! started always finishes.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Per-cycle counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Records returned by the poll query
    pub fetched: usize,
    /// Outcome counters (`assigned`, `ineligible`, `sent`, `failed`, ...)
    pub counts: BTreeMap<&'static str, usize>,
    /// The cycle stopped early because shutdown was requested
    pub interrupted: bool,
}

impl CycleSummary {
    pub fn bump(&mut self, key: &'static str) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    pub fn get(&self, key: &str) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetched={}", self.fetched)?;
        for (key, count) in &self.counts {
            write!(f, " {}={}", key, count)?;
        }
        if self.interrupted {
            f.write_str(" (interrupted)")?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait PollService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process every currently eligible record once
    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary>;
}

/// Run one cycle and log its summary
pub async fn run_once(service: &dyn PollService, cancel: &CancellationToken) -> Result<CycleSummary> {
    let summary = service.run_cycle(cancel).await?;
    info!(service = service.name(), summary = %summary, "Cycle complete");
    Ok(summary)
}

/// Repeat cycles every `interval` until `cancel` fires.
///
/// A cycle that fails with a store error (the poll query exhausted its
/// retries, REDCap unreachable) is logged and retried next interval. Any
/// other error ends the loop.
pub async fn run_poll_loop(
    service: &dyn PollService,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        service = service.name(),
        interval_secs = interval.as_secs(),
        "Poll loop started"
    );
    let mut consecutive_failures: u32 = 0;

    while !cancel.is_cancelled() {
        match run_once(service, &cancel).await {
            Ok(_) => consecutive_failures = 0,
            Err(Error::Store(e)) => {
                consecutive_failures += 1;
                error!(
                    service = service.name(),
                    consecutive_failures,
                    error = %e,
                    "Cycle failed, will retry next interval"
                );
            }
            Err(e) => {
                error!(service = service.name(), error = %e, "Cycle failed, stopping");
                return Err(e);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!(service = service.name(), "Poll loop stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}

/// Cancel `token` when a shutdown signal arrives
pub fn cancel_on_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
}
