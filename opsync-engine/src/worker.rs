//! Background worker that serializes access to one [`SyncOrchestrator`].
//!
//! Callers talk to the worker through an [`OrchestratorHandle`]. Captures
//! queued behind a sync trigger are logged before the cycle starts, and
//! sync triggers that pile up while a cycle runs collapse into one cycle
//! whose report every caller receives.

use crate::clean_slate::CleanSlateReason;
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{LocalMutation, SyncOrchestrator};
use crate::state::SyncReport;
use opsync_store::Operation;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<SyncResult<T>>;

/// Command sent to the worker loop.
enum SyncCommand {
    Capture(LocalMutation, Reply<Operation>),
    /// Run a cycle; `None` for fire-and-forget triggers.
    Sync(Option<Reply<SyncReport>>),
    ForceUpload(Reply<SyncReport>),
    ForceDownload(Reply<SyncReport>),
    CleanSlate(CleanSlateReason, Reply<Operation>),
    Shutdown,
}

/// Cloneable handle to a running [`SyncWorker`].
#[derive(Clone)]
pub struct OrchestratorHandle {
    command_tx: mpsc::Sender<SyncCommand>,
}

impl OrchestratorHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SyncCommand) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    pub async fn capture(&self, mutation: LocalMutation) -> SyncResult<Operation> {
        self.request(|tx| SyncCommand::Capture(mutation, tx)).await
    }

    /// Runs a sync cycle and waits for its report.
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        self.request(|tx| SyncCommand::Sync(Some(tx))).await
    }

    /// Queues a sync cycle without waiting for it.
    pub async fn trigger_sync(&self) -> SyncResult<()> {
        self.command_tx
            .send(SyncCommand::Sync(None))
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn force_upload(&self) -> SyncResult<SyncReport> {
        self.request(SyncCommand::ForceUpload).await
    }

    pub async fn force_download(&self) -> SyncResult<SyncReport> {
        self.request(SyncCommand::ForceDownload).await
    }

    pub async fn clean_slate(&self, reason: CleanSlateReason) -> SyncResult<Operation> {
        self.request(|tx| SyncCommand::CleanSlate(reason, tx)).await
    }

    /// Asks the worker to stop after the command it is running.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.command_tx
            .send(SyncCommand::Shutdown)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

/// Owns the command loop for one orchestrator.
pub struct SyncWorker {
    orchestrator: Arc<SyncOrchestrator>,
    command_rx: mpsc::Receiver<SyncCommand>,
}

impl SyncWorker {
    /// Spawns the worker loop on the current runtime.
    pub fn spawn(
        orchestrator: Arc<SyncOrchestrator>,
        capacity: usize,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(capacity.max(1));
        let worker = Self {
            orchestrator,
            command_rx,
        };
        let task = tokio::spawn(worker.run());
        (OrchestratorHandle { command_tx }, task)
    }

    async fn run(mut self) {
        info!("Sync worker started");
        while let Some(command) = self.command_rx.recv().await {
            match command {
                SyncCommand::Capture(mutation, tx) => {
                    let _ = tx.send(self.orchestrator.capture(mutation).await);
                }
                SyncCommand::Sync(waiter) => {
                    if !self.run_coalesced_sync(waiter).await {
                        break;
                    }
                }
                SyncCommand::ForceUpload(tx) => {
                    let _ = tx.send(self.orchestrator.force_upload_local_state().await);
                }
                SyncCommand::ForceDownload(tx) => {
                    let _ = tx.send(self.orchestrator.force_download_remote_state().await);
                }
                SyncCommand::CleanSlate(reason, tx) => {
                    let _ = tx.send(self.orchestrator.clean_slate(reason).await);
                }
                SyncCommand::Shutdown => break,
            }
        }
        info!("Sync worker stopped");
    }

    /// Drains queued commands, logs captures, then runs one cycle for all
    /// queued sync triggers. Returns false if a shutdown was drained.
    async fn run_coalesced_sync(&mut self, first: Option<Reply<SyncReport>>) -> bool {
        let mut waiters: Vec<Reply<SyncReport>> = first.into_iter().collect();
        let mut deferred = Vec::new();
        let mut keep_running = true;

        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                SyncCommand::Capture(mutation, tx) => {
                    let _ = tx.send(self.orchestrator.capture(mutation).await);
                }
                SyncCommand::Sync(waiter) => waiters.extend(waiter),
                SyncCommand::Shutdown => {
                    keep_running = false;
                    break;
                }
                other => deferred.push(other),
            }
        }
        if waiters.len() > 1 {
            debug!("Coalesced {} sync triggers into one cycle", waiters.len());
        }

        let mut result = self.orchestrator.sync().await;
        if matches!(&result, Ok(report) if report.reupload_required) {
            debug!("Running follow-up cycle to re-upload local state");
            result = self.orchestrator.sync().await;
        }
        if let Err(e) = &result {
            warn!("Sync cycle failed: {}", e);
        }
        reply_all(waiters, result);

        for command in deferred {
            match command {
                SyncCommand::ForceUpload(tx) => {
                    let _ = tx.send(self.orchestrator.force_upload_local_state().await);
                }
                SyncCommand::ForceDownload(tx) => {
                    let _ = tx.send(self.orchestrator.force_download_remote_state().await);
                }
                SyncCommand::CleanSlate(reason, tx) => {
                    let _ = tx.send(self.orchestrator.clean_slate(reason).await);
                }
                SyncCommand::Capture(..) | SyncCommand::Sync(_) | SyncCommand::Shutdown => {}
            }
        }
        keep_running
    }
}

fn reply_all(waiters: Vec<Reply<SyncReport>>, result: SyncResult<SyncReport>) {
    let mut waiters = waiters.into_iter();
    let Some(first) = waiters.next() else {
        return;
    };
    match &result {
        Ok(report) => {
            for tx in waiters {
                let _ = tx.send(Ok(report.clone()));
            }
        }
        Err(e) => {
            let msg = e.to_string();
            for tx in waiters {
                let _ = tx.send(Err(SyncError::CycleFailed(msg.clone())));
            }
        }
    }
    let _ = first.send(result);
}

/// Triggers a sync every `interval` until the worker goes away.
pub fn spawn_periodic(handle: OrchestratorHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if handle.trigger_sync().await.is_err() {
                debug!("Sync worker gone, stopping periodic trigger");
                break;
            }
        }
    })
}
