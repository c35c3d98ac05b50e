//! Drain scheduling - manual and periodic modes.
//!
//! The scheduler owns no queue state. It decides *when* the client drains
//! its command queue: on explicit request, on enqueue notifications, and
//! on a fixed interval in periodic mode.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use eaves_common::{Error, Result};

/// Drain mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainMode {
    /// Drain only when asked or notified.
    Manual,
    /// Also drain at regular intervals.
    Periodic { interval: Duration },
}

/// Drain request types.
#[derive(Debug)]
pub enum DrainRequest {
    /// Drain every dispatchable command.
    Drain,
    /// Shutdown the scheduler.
    Shutdown,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Commands still queued when the pass ended.
    pub remaining: usize,
    pub duration: Duration,
}

type Envelope = (DrainRequest, Option<oneshot::Sender<Result<DrainReport>>>);

/// Front end of the drain task.
#[derive(Clone)]
pub struct DrainScheduler {
    request_tx: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
}

impl DrainScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: DrainMode) -> (Self, DrainSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let shutdown = CancellationToken::new();

        let scheduler = Self {
            request_tx,
            shutdown: shutdown.clone(),
        };
        let handle = DrainSchedulerHandle {
            mode,
            request_rx,
            shutdown,
        };
        (scheduler, handle)
    }

    /// Drain now and wait for the report.
    pub async fn request_drain(&self) -> Result<DrainReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send((DrainRequest::Drain, Some(response_tx)))
            .await
            .map_err(|_| Error::Cancelled)?;
        response_rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Ask for a drain without waiting for it.
    ///
    /// Notifications coalesce when the task is busy.
    pub fn notify(&self) {
        if let Err(e) = self.request_tx.try_send((DrainRequest::Drain, None)) {
            debug!("Drain notification dropped: {}", e);
        }
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let _ = self.request_tx.send((DrainRequest::Shutdown, None)).await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Handle for the scheduler background task.
pub struct DrainSchedulerHandle {
    mode: DrainMode,
    request_rx: mpsc::Receiver<Envelope>,
    shutdown: CancellationToken,
}

impl DrainSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. `drain_fn` runs whenever a
    /// drain is due; drains never overlap.
    pub async fn run<F, Fut>(mut self, drain_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<DrainReport>> + Send,
    {
        let mut periodic = match self.mode {
            DrainMode::Periodic { interval: period } => Some(interval(period)),
            DrainMode::Manual => None,
        };

        info!("Drain scheduler started ({:?})", self.mode);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Drain scheduler shutting down");
                    break;
                }

                request = self.request_rx.recv() => {
                    match request {
                        None | Some((DrainRequest::Shutdown, _)) => {
                            info!("Received shutdown request");
                            break;
                        }
                        Some((DrainRequest::Drain, response_tx)) => {
                            let result = drain_fn().await;
                            match response_tx {
                                Some(tx) => {
                                    let _ = tx.send(result);
                                }
                                None => log_result("Requested", &result),
                            }
                        }
                    }
                }

                _ = wait_for_periodic(&mut periodic) => {
                    debug!("Triggering periodic drain");
                    let result = drain_fn().await;
                    log_result("Periodic", &result);
                }
            }
        }
    }
}

fn log_result(label: &str, result: &Result<DrainReport>) {
    match result {
        Ok(report) if report.completed + report.retried + report.failed > 0 => info!(
            "{} drain: {} completed, {} retried, {} failed, {} remaining",
            label, report.completed, report.retried, report.failed, report.remaining
        ),
        Ok(_) => {}
        Err(e) => error!("{} drain failed: {}", label, e),
    }
}

async fn wait_for_periodic(periodic: &mut Option<tokio::time::Interval>) {
    match periodic {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
