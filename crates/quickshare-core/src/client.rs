//! High-level endpoint orchestration.
//!
//! The client ties a session (transport acquisition and linked peers) to a
//! transfer engine and a storage backend: inbound protocol messages flow from
//! the session into the engine, link loss aborts the affected transfers, and
//! completed files are handed to storage.

use crate::{
    config::ClientConfig,
    session::{ConnectOutcome, SessionError, SessionEvent, SessionManager},
    transfer::{FileSource, SendReport, TransferEngine, TransferEvent},
    transport::Acquire,
};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::{Storage, StoredFile};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How often the receive watchdog looks for stalled transfers.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

type SavedSubscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<StoredFile>>>>;

pub struct Client<S> {
    pub session: SessionManager,
    pub engine: Arc<TransferEngine>,
    pub storage: Arc<S>,
    pub cfg: ClientConfig,
    saved: SavedSubscribers,
    tasks: Vec<JoinHandle<()>>,
}

impl<S> Client<S>
where
    S: Storage + Send + Sync + 'static,
{
    /// Start a session on `acquire` and begin pumping its events.
    pub fn start(acquire: Arc<dyn Acquire>, storage: S, cfg: ClientConfig) -> Self {
        let session = SessionManager::start(acquire, cfg.retry_policy());
        let engine = Arc::new(TransferEngine::new(session.outbound(), cfg.stall_timeout()));
        let storage = Arc::new(storage);
        let saved: SavedSubscribers = Arc::default();

        let session_events = session.subscribe();
        let transfer_events = engine.subscribe();

        let tasks = vec![
            tokio::spawn(pump(session_events, engine.clone())),
            tokio::spawn(store_completed(transfer_events, storage.clone(), saved.clone())),
        ];

        Self {
            session,
            engine,
            storage,
            cfg,
            saved,
            tasks,
        }
    }

    pub async fn connect_to_peer(&self, target: &str) -> Result<ConnectOutcome, SessionError> {
        self.session.connect_to_peer(target).await
    }

    pub fn linked_peers(&self) -> Vec<String> {
        self.session.linked_peers()
    }

    /// Send `file` to every currently linked peer.
    pub async fn send_file(&self, file: FileSource) -> Result<SendReport> {
        let sender = self
            .session
            .local_identifier()
            .context("session has no identifier yet")?;
        let peers = self.session.linked_peers();
        let report = self.engine.send_file(&sender, file, &peers).await?;
        Ok(report)
    }

    pub fn subscribe_transfers(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        self.engine.subscribe()
    }

    /// Files written to storage, in completion order.
    pub fn subscribe_saved(&self) -> mpsc::UnboundedReceiver<StoredFile> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.saved.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        rx
    }

    pub async fn shutdown(self) {
        self.session.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Feed session events into the engine and run the receive watchdog.
async fn pump(mut events: mpsc::UnboundedReceiver<SessionEvent>, engine: Arc<TransferEngine>) {
    let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Message { from, message } => {
                        let kind = message.kind();
                        if let Err(e) = engine.handle_message(&from, message).await {
                            tracing::warn!("Dropped {} from {}: {}", kind, from, e);
                        }
                    }
                    SessionEvent::PeerUnlinked(peer) => {
                        let aborted = engine.peer_unlinked(&peer);
                        if aborted > 0 {
                            tracing::warn!("{} transfer(s) from {} aborted by link loss", aborted, peer);
                        }
                    }
                    SessionEvent::StateChanged(state) => tracing::debug!("Session state: {:?}", state),
                    _ => {}
                }
            }
            _ = watchdog.tick() => {
                engine.expire_stalled();
            }
        }
    }
}

async fn store_completed<S: Storage>(
    mut events: mpsc::UnboundedReceiver<TransferEvent>,
    storage: Arc<S>,
    saved: SavedSubscribers,
) {
    while let Some(event) = events.recv().await {
        let TransferEvent::Completed(file) = event else { continue };
        match storage.put_file(&file.file_name, &file.data).await {
            Ok(stored) => {
                tracing::info!(
                    "Saved {} from {} to {} (sha256 {})",
                    file.file_name,
                    file.from,
                    stored.path.display(),
                    stored.sha256
                );
                saved
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|tx| tx.send(stored.clone()).is_ok());
            }
            Err(e) => tracing::error!("Failed to save {}: {:#}", file.file_name, e),
        }
    }
}
