//! Batch scheduling: manual, on-demand and periodic modes.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info};

use offsync_common::{Error, Result};

use crate::engine::BatchReport;

/// When batches are triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Only explicit requests.
    Manual,
    /// A batch after every enqueue notification.
    OnDemand,
    /// A batch at regular intervals.
    Periodic { interval: Duration },
    /// Both on-demand and periodic.
    Hybrid { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            _ => None,
        }
    }

    fn reacts_to_enqueue(&self) -> bool {
        matches!(self, SyncMode::OnDemand | SyncMode::Hybrid { .. })
    }
}

/// Work the scheduler hands to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// Process a batch; `None` uses the configured batch size.
    Batch(Option<usize>),
    /// Re-arm stuck items only.
    Reclaim,
    /// Stop the scheduler.
    Shutdown,
}

type Responder = oneshot::Sender<Result<BatchReport>>;

/// Front end for requesting batches from a running scheduler task.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<(SyncRequest, Responder)>,
    shutdown: Arc<AtomicBool>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that drives it.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));
        let shutdown = Arc::new(AtomicBool::new(false));

        let scheduler = Self {
            mode: Arc::clone(&mode),
            request_tx,
            shutdown: Arc::clone(&shutdown),
        };
        let handle = SyncSchedulerHandle {
            mode,
            request_rx,
            shutdown,
        };
        (scheduler, handle)
    }

    /// Request a batch and wait for its report.
    pub async fn request_batch(&self, batch_size: Option<usize>) -> Result<BatchReport> {
        self.request(SyncRequest::Batch(batch_size)).await
    }

    /// Request a reclaim pass and wait for its report.
    pub async fn request_reclaim(&self) -> Result<BatchReport> {
        self.request(SyncRequest::Reclaim).await
    }

    async fn request(&self, request: SyncRequest) -> Result<BatchReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::Internal("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Internal("Failed to receive batch report".to_string()))?
    }

    /// Tell the scheduler a mutation was enqueued.
    ///
    /// Triggers a batch in `OnDemand` and `Hybrid` modes without waiting for it.
    pub async fn notify_enqueued(&self) {
        let mode = self.mode.read().await.clone();
        if !mode.reacts_to_enqueue() {
            debug!("Enqueue notification ignored (mode: {:?})", mode);
            return;
        }

        let (response_tx, _) = oneshot::channel();
        if self
            .request_tx
            .try_send((SyncRequest::Batch(None), response_tx))
            .is_err()
        {
            debug!("Scheduler busy; enqueue notification coalesced");
        }
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    /// Get the current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the scheduler task after its current batch.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Receiving side of the scheduler; run it in its own task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<(SyncRequest, Responder)>,
    shutdown: Arc<AtomicBool>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown or until every
    /// [`SyncScheduler`] is dropped.
    ///
    /// `batch_fn` is called for each explicit request and each periodic tick.
    pub async fn run<F, Fut>(mut self, batch_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<BatchReport>> + Send,
    {
        let mut current_interval = self.mode.read().await.interval();
        let mut ticker = current_interval.map(interval);

        info!("Sync scheduler started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Sync scheduler shutting down");
                break;
            }

            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some((request, response_tx)) = request else {
                        info!("All schedulers dropped; stopping");
                        break;
                    };
                    if request == SyncRequest::Shutdown {
                        info!("Received shutdown request");
                        break;
                    }
                    debug!("Processing request: {:?}", request);
                    let _ = response_tx.send(batch_fn(request).await);
                }

                _ = Self::wait_for_tick(&mut ticker) => {
                    debug!("Triggering periodic batch");
                    match batch_fn(SyncRequest::Batch(None)).await {
                        Ok(report) => info!(
                            "Periodic batch completed: {} applied, {} conflicted, {} failed",
                            report.applied, report.conflicted, report.failed
                        ),
                        Err(e) => error!("Periodic batch failed: {}", e),
                    }
                }
            }

            let expected_interval = self.mode.read().await.interval();
            if expected_interval != current_interval {
                debug!("Sync interval changed to {:?}", expected_interval);
                current_interval = expected_interval;
                ticker = current_interval.map(interval);
            }
        }
    }

    async fn wait_for_tick(ticker: &mut Option<tokio::time::Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
