//! Transfer Worker
//!
//! Drains transfer commands from the inbound channel and runs them through
//! the coordinator, at most `concurrency` in flight at once. Every consumed
//! command produces exactly one completion event, success or not, so the
//! producing side can track outcomes. Duplicates from at-least-once
//! delivery need no special handling here; the coordinator absorbs them.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::coordinator::TransferCoordinator;
use super::types::{TransferCommand, TransferCompleted};

/// Create the inbound command channel pair.
pub fn command_channel(buffer: usize) -> (mpsc::Sender<TransferCommand>, mpsc::Receiver<TransferCommand>) {
    mpsc::channel(buffer)
}

pub struct TransferWorker {
    coordinator: Arc<TransferCoordinator>,
    concurrency: usize,
}

impl TransferWorker {
    pub fn new(coordinator: Arc<TransferCoordinator>, concurrency: usize) -> Self {
        Self {
            coordinator,
            concurrency,
        }
    }

    /// Run until the command feed closes or `shutdown` flips to true.
    /// In-flight transfers are always awaited before returning; on shutdown
    /// they observe the signal as cancellation at their next suspension
    /// point.
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<TransferCommand>,
        completions: mpsc::Sender<TransferCompleted>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(concurrency = self.concurrency, "transfer worker started");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                maybe = commands.recv() => {
                    let Some(cmd) = maybe else {
                        debug!("command feed closed");
                        break;
                    };
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("worker semaphore never closed");
                    let coordinator = self.coordinator.clone();
                    let completions = completions.clone();
                    let cancel = shutdown.clone();
                    in_flight.spawn(async move {
                        let result = coordinator.transfer_cancellable(&cmd, &cancel).await;
                        match &result {
                            Ok(applied) => info!(
                                op_id = %cmd.op_id,
                                duplicate = applied.duplicate,
                                "transfer completed"
                            ),
                            Err(e) if e.is_retriable() => warn!(
                                op_id = %cmd.op_id,
                                code = e.code(),
                                "transfer failed transiently, safe to resubmit"
                            ),
                            Err(e) => warn!(op_id = %cmd.op_id, code = e.code(), "transfer rejected"),
                        }
                        let event = TransferCompleted::from_result(&cmd, &result);
                        if completions.send(event).await.is_err() {
                            debug!(op_id = %cmd.op_id, "completion receiver dropped");
                        }
                        drop(permit);
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown signal received, draining in-flight transfers");
                        break;
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "transfer task panicked");
            }
        }

        info!("transfer worker stopped");
    }
}
