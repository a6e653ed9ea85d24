//! Chunked file transfer engine.
//!
//! Send path: `file-start`, then one `file-chunk` per 16 KiB slice in index
//! order, then `file-end`, once per route. Receive path: chunks are stored by
//! index (never appended), duplicates are idempotent, and `file-end` on a full
//! set reassembles the file and acknowledges it with `file-received`.

use crate::identifier;
use crate::protocol::{format_file_size, total_chunks, PeerMessage, CHUNK_SIZE};
use crate::session::recovery::{Clock, TokioClock};
use crate::transport::{Delivery, Outbound, TransportError};
use rand_core::{OsRng, RngCore};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest inbound file accepted. Received files are held in memory until
/// reassembled.
pub const MAX_INCOMING_SIZE: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("no linked peers to send to")]
    NoPeers,
    #[error("no transfer {file_id} from {peer}")]
    UnknownTransfer { peer: String, file_id: String },
    #[error("chunk {index} out of range for {file_id} ({total} chunks)")]
    ChunkOutOfRange { file_id: String, index: u32, total: u32 },
    #[error("chunk {index} of {file_id} is {len} bytes")]
    OversizedChunk { file_id: String, index: u32, len: usize },
    #[error("{file_id} announces {total_chunks} chunks for {total_size} bytes")]
    BadAnnouncement { file_id: String, total_size: u64, total_chunks: u32 },
    #[error("transfer {file_id} is {state:?}")]
    InvalidState { file_id: String, state: TransferState },
    #[error("file ended early at chunk {index} of {file_id}")]
    ShortRead { file_id: String, index: u32 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Announced,
    Receiving,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LinkLost,
    Stalled,
}

/// One inbound file from one peer.
#[derive(Debug)]
pub struct Transfer {
    /// Link identity the transfer arrived on.
    pub from: String,
    pub file_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub sender: String,
    pub total_size: u64,
    pub total_chunks: u32,
    chunks: Vec<Option<Vec<u8>>>,
    received_count: u32,
    state: TransferState,
    last_activity: Instant,
}

impl Transfer {
    pub fn announced(
        from: String,
        file_id: String,
        file_name: String,
        mime_type: String,
        sender: String,
        total_size: u64,
        total_chunks: u32,
        now: Instant,
    ) -> Self {
        Self {
            from,
            file_id,
            file_name,
            mime_type,
            sender,
            total_size,
            total_chunks,
            chunks: vec![None; total_chunks as usize],
            received_count: 0,
            state: TransferState::Announced,
            last_activity: now,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.received_count as f64 / self.total_chunks as f64
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_chunks
    }

    pub fn begin(&mut self) -> Result<(), TransferError> {
        self.expect_state(&[TransferState::Announced])?;
        self.state = TransferState::Receiving;
        Ok(())
    }

    /// Store `chunk` at `index`. Returns whether the slot was newly filled.
    pub fn store_chunk(&mut self, index: u32, chunk: Vec<u8>, now: Instant) -> Result<bool, TransferError> {
        self.expect_state(&[TransferState::Receiving])?;
        if chunk.len() > CHUNK_SIZE {
            return Err(TransferError::OversizedChunk {
                file_id: self.file_id.clone(),
                index,
                len: chunk.len(),
            });
        }
        let slot = self
            .chunks
            .get_mut(index as usize)
            .ok_or_else(|| TransferError::ChunkOutOfRange {
                file_id: self.file_id.clone(),
                index,
                total: self.total_chunks,
            })?;

        let fresh = slot.is_none();
        *slot = Some(chunk);
        if fresh {
            self.received_count += 1;
        }
        self.last_activity = now;
        Ok(fresh)
    }

    /// Concatenate chunks in index order and mark the transfer completed.
    pub fn assemble(&mut self) -> Result<Vec<u8>, TransferError> {
        self.expect_state(&[TransferState::Receiving])?;
        let len = self.chunks.iter().flatten().map(Vec::len).sum();
        let mut data = Vec::with_capacity(len);
        for (index, chunk) in self.chunks.iter_mut().enumerate() {
            let chunk = chunk.take().ok_or_else(|| TransferError::ShortRead {
                file_id: self.file_id.clone(),
                index: index as u32,
            })?;
            data.extend_from_slice(&chunk);
        }
        self.state = TransferState::Completed;
        Ok(data)
    }

    pub fn abort(&mut self) -> Result<(), TransferError> {
        self.expect_state(&[TransferState::Announced, TransferState::Receiving])?;
        self.state = TransferState::Aborted;
        self.chunks.clear();
        Ok(())
    }

    fn expect_state(&self, allowed: &[TransferState]) -> Result<(), TransferError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(TransferError::InvalidState {
                file_id: self.file_id.clone(),
                state: self.state,
            })
        }
    }
}

/// A fully reassembled file handed off by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub from: String,
    pub file_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Announced { peer: String, file_id: String, file_name: String, total_size: u64, total_chunks: u32 },
    Progress { peer: String, file_id: String, received: u32, total: u32 },
    Completed(ReceivedFile),
    Aborted { peer: String, file_id: String, file_name: String, received: u32, total: u32, reason: AbortReason },
    Sent { peer: String, file_id: String },
    SendFailed { peer: String, file_id: String, error: String },
    Acknowledged { peer: String, file_id: String },
}

/// Where outgoing bytes come from. Each send loop opens its own reader.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path { path: PathBuf, mime_type: Option<String> },
    Memory { name: String, mime_type: String, data: Arc<[u8]> },
}

impl FileSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        FileSource::Path { path: path.into(), mime_type: None }
    }

    pub fn from_bytes(name: &str, mime_type: &str, data: Vec<u8>) -> Self {
        FileSource::Memory {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            data: data.into(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            FileSource::Path { path, .. } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            FileSource::Memory { name, .. } => name.clone(),
        }
    }

    pub fn mime_type(&self) -> String {
        match self {
            FileSource::Path { mime_type: Some(m), .. } => m.clone(),
            FileSource::Path { .. } => guess_mime_type(&self.name()).to_string(),
            FileSource::Memory { mime_type, .. } => mime_type.clone(),
        }
    }

    pub async fn size(&self) -> std::io::Result<u64> {
        match self {
            FileSource::Path { path, .. } => Ok(tokio::fs::metadata(path).await?.len()),
            FileSource::Memory { data, .. } => Ok(data.len() as u64),
        }
    }

    async fn open(&self) -> std::io::Result<Box<dyn AsyncRead + Unpin + Send>> {
        match self {
            FileSource::Path { path, .. } => Ok(Box::new(tokio::fs::File::open(path).await?)),
            FileSource::Memory { data, .. } => Ok(Box::new(std::io::Cursor::new(data.clone()))),
        }
    }
}

pub fn guess_mime_type(file_name: &str) -> &'static str {
    let ext = file_name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub file_id: String,
    pub total_chunks: u32,
    pub delivered: Vec<String>,
    pub failed: Vec<(String, String)>,
}

struct Outgoing {
    file_name: String,
    awaiting_ack: HashSet<String>,
}

type TransferKey = (String, String);

pub struct TransferEngine {
    outbound: Arc<dyn Outbound>,
    clock: Arc<dyn Clock>,
    stall_timeout: Duration,
    incoming: Mutex<HashMap<TransferKey, Transfer>>,
    outgoing: Mutex<HashMap<String, Outgoing>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransferEvent>>>,
}

fn key(peer: &str, file_id: &str) -> TransferKey {
    (identifier::normalize(peer), file_id.to_string())
}

impl TransferEngine {
    pub fn new(outbound: Arc<dyn Outbound>, stall_timeout: Duration) -> Self {
        Self::with_clock(outbound, stall_timeout, Arc::new(TokioClock))
    }

    pub fn with_clock(outbound: Arc<dyn Outbound>, stall_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            outbound,
            clock,
            stall_timeout,
            incoming: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        rx
    }

    fn emit(&self, event: TransferEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Snapshot of an inbound transfer: (state, received, total).
    pub fn incoming_status(&self, peer: &str, file_id: &str) -> Option<(TransferState, u32, u32)> {
        let incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
        incoming
            .get(&key(peer, file_id))
            .map(|t| (t.state(), t.received_count(), t.total_chunks))
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// File ids still waiting for at least one `file-received`.
    pub fn awaiting_ack(&self) -> Vec<String> {
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Reserve a file id not used by any of this sender's active transfers.
    fn reserve_file_id(&self, file_name: &str, peers: &[String]) -> String {
        let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        let file_id = loop {
            let mut bytes = [0u8; 8];
            OsRng.fill_bytes(&mut bytes);
            let candidate = hex::encode(bytes);
            if !outgoing.contains_key(&candidate) {
                break candidate;
            }
        };
        outgoing.insert(
            file_id.clone(),
            Outgoing {
                file_name: file_name.to_string(),
                awaiting_ack: peers.iter().map(|p| identifier::normalize(p)).collect(),
            },
        );
        file_id
    }

    /// Stream `file` to every peer in `peers`. Per-route loops run
    /// independently; one failing peer does not hold up the others.
    pub async fn send_file(
        &self,
        sender: &str,
        file: FileSource,
        peers: &[String],
    ) -> Result<SendReport, TransferError> {
        if peers.is_empty() {
            return Err(TransferError::NoPeers);
        }

        let file_name = file.name();
        let total_size = file.size().await?;
        let total_chunks = total_chunks(total_size);
        let file_id = self.reserve_file_id(&file_name, peers);

        tracing::info!(
            "Sending {} ({}, {} chunks) as {} to {} peer(s)",
            file_name,
            format_file_size(total_size),
            total_chunks,
            file_id,
            peers.len()
        );

        let start = PeerMessage::FileStart {
            file_id: file_id.clone(),
            file_name: file_name.clone(),
            mime_type: file.mime_type(),
            total_size,
            total_chunks,
            sender: sender.to_string(),
        };

        // With hub fan-out a single stream reaches every linked peer.
        let routes: Vec<Vec<String>> = match self.outbound.delivery() {
            Delivery::PerPeer => peers.iter().map(|p| vec![p.clone()]).collect(),
            Delivery::FanOut => vec![peers.to_vec()],
        };

        let mut loops = JoinSet::new();
        for route in routes {
            let outbound = self.outbound.clone();
            let file = file.clone();
            let start = start.clone();
            let file_id = file_id.clone();
            let file_name = file_name.clone();
            loops.spawn(async move {
                let result =
                    stream_file(outbound.as_ref(), &route[0], &file, start, &file_id, &file_name, total_chunks).await;
                (route, result)
            });
        }

        let mut report = SendReport {
            file_id: file_id.clone(),
            total_chunks,
            delivered: Vec::new(),
            failed: Vec::new(),
        };

        while let Some(joined) = loops.join_next().await {
            let (route, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!("Send loop for {} panicked: {}", file_id, e);
                    continue;
                }
            };
            match result {
                Ok(()) => {
                    for peer in route {
                        self.emit(TransferEvent::Sent { peer: peer.clone(), file_id: file_id.clone() });
                        report.delivered.push(peer);
                    }
                }
                Err(e) => {
                    for peer in route {
                        tracing::warn!("Sending {} to {} failed: {}", file_id, peer, e);
                        self.forget_ack(&file_id, &peer);
                        self.emit(TransferEvent::SendFailed {
                            peer: peer.clone(),
                            file_id: file_id.clone(),
                            error: e.to_string(),
                        });
                        report.failed.push((peer, e.to_string()));
                    }
                }
            }
        }

        Ok(report)
    }

    /// Drop `peer` from the set owing an acknowledgement for `file_id`.
    fn forget_ack(&self, file_id: &str, peer: &str) {
        let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = outgoing.get_mut(file_id) {
            entry.awaiting_ack.remove(&identifier::normalize(peer));
            if entry.awaiting_ack.is_empty() {
                outgoing.remove(file_id);
            }
        }
    }

    /// Apply one inbound protocol message from `from`.
    pub async fn handle_message(&self, from: &str, message: PeerMessage) -> Result<(), TransferError> {
        match message {
            PeerMessage::FileStart { file_id, file_name, mime_type, total_size, total_chunks: chunks, sender } => {
                if total_size > MAX_INCOMING_SIZE || u64::from(chunks) != total_size.div_ceil(CHUNK_SIZE as u64) {
                    return Err(TransferError::BadAnnouncement { file_id, total_size, total_chunks: chunks });
                }
                let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
                let k = key(from, &file_id);
                if incoming.contains_key(&k) {
                    tracing::debug!("Duplicate file-start for {} from {}", file_id, from);
                    return Ok(());
                }
                let mut transfer = Transfer::announced(
                    from.to_string(),
                    file_id.clone(),
                    file_name.clone(),
                    mime_type,
                    sender,
                    total_size,
                    chunks,
                    self.clock.now(),
                );
                transfer.begin()?;
                incoming.insert(k, transfer);
                drop(incoming);

                tracing::info!("Receiving {} ({}) from {}", file_name, format_file_size(total_size), from);
                self.emit(TransferEvent::Announced {
                    peer: from.to_string(),
                    file_id,
                    file_name,
                    total_size,
                    total_chunks: chunks,
                });
                Ok(())
            }
            PeerMessage::FileChunk { file_id, chunk_index, chunk, .. } => {
                let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
                let transfer = incoming
                    .get_mut(&key(from, &file_id))
                    .ok_or_else(|| TransferError::UnknownTransfer { peer: from.to_string(), file_id: file_id.clone() })?;
                let fresh = transfer.store_chunk(chunk_index, chunk, self.clock.now())?;
                let (received, total) = (transfer.received_count(), transfer.total_chunks);
                drop(incoming);

                if fresh {
                    self.emit(TransferEvent::Progress { peer: from.to_string(), file_id, received, total });
                }
                Ok(())
            }
            PeerMessage::FileEnd { file_id, .. } => self.finish(from, &file_id).await,
            PeerMessage::FileReceived { file_id } => {
                let known = {
                    let outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
                    outgoing
                        .get(&file_id)
                        .map(|o| (o.file_name.clone(), o.awaiting_ack.contains(&identifier::normalize(from))))
                };
                match known {
                    Some((file_name, true)) => {
                        self.forget_ack(&file_id, from);
                        tracing::info!("{} confirmed receipt of {}", from, file_name);
                        self.emit(TransferEvent::Acknowledged { peer: from.to_string(), file_id });
                    }
                    _ => tracing::debug!("Ignoring acknowledgement for {} from {}", file_id, from),
                }
                Ok(())
            }
        }
    }

    async fn finish(&self, from: &str, file_id: &str) -> Result<(), TransferError> {
        let k = key(from, file_id);
        let received = {
            let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
            let transfer = incoming
                .get_mut(&k)
                .ok_or_else(|| TransferError::UnknownTransfer { peer: from.to_string(), file_id: file_id.to_string() })?;

            if !transfer.is_complete() {
                // No retransmission exists; the watchdog aborts it if nothing more arrives.
                tracing::warn!(
                    "file-end for {} with {}/{} chunks, still waiting",
                    file_id,
                    transfer.received_count(),
                    transfer.total_chunks
                );
                return Ok(());
            }

            let data = transfer.assemble()?;
            if data.len() as u64 != transfer.total_size {
                tracing::warn!("{} reassembled to {} bytes, announced {}", file_id, data.len(), transfer.total_size);
            }
            let received = ReceivedFile {
                from: from.to_string(),
                file_id: file_id.to_string(),
                file_name: transfer.file_name.clone(),
                mime_type: transfer.mime_type.clone(),
                data,
            };
            incoming.remove(&k);
            received
        };

        tracing::info!("Completed {} ({}) from {}", received.file_name, format_file_size(received.data.len() as u64), from);
        self.emit(TransferEvent::Completed(received));

        let ack = PeerMessage::FileReceived { file_id: file_id.to_string() };
        if let Err(e) = self.outbound.send(from, ack).await {
            tracing::warn!("Could not acknowledge {} to {}: {}", file_id, from, e);
        }
        Ok(())
    }

    /// Abort every unfinished inbound transfer from `peer`.
    pub fn peer_unlinked(&self, peer: &str) -> usize {
        let norm = identifier::normalize(peer);
        {
            let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
            outgoing.retain(|_, o| {
                o.awaiting_ack.remove(&norm);
                !o.awaiting_ack.is_empty()
            });
        }
        self.abort_where(|(p, _), _| *p == norm, AbortReason::LinkLost)
    }

    /// Abort inbound transfers idle for longer than the stall timeout.
    pub fn expire_stalled(&self) -> usize {
        let now = self.clock.now();
        let timeout = self.stall_timeout;
        self.abort_where(
            |_, t| now.saturating_duration_since(t.last_activity) >= timeout,
            AbortReason::Stalled,
        )
    }

    fn abort_where<F>(&self, mut predicate: F, reason: AbortReason) -> usize
    where
        F: FnMut(&TransferKey, &Transfer) -> bool,
    {
        let aborted: Vec<Transfer> = {
            let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<TransferKey> = incoming
                .iter()
                .filter(|(k, t)| predicate(k, t))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| incoming.remove(k)).collect()
        };

        let count = aborted.len();
        for mut transfer in aborted {
            let received = transfer.received_count();
            if let Err(e) = transfer.abort() {
                tracing::debug!("Skipping abort: {}", e);
                continue;
            }
            tracing::warn!(
                "Aborted {} from {} at {}/{} chunks ({:?})",
                transfer.file_name,
                transfer.from,
                received,
                transfer.total_chunks,
                reason
            );
            self.emit(TransferEvent::Aborted {
                peer: transfer.from.clone(),
                file_id: transfer.file_id.clone(),
                file_name: transfer.file_name.clone(),
                received,
                total: transfer.total_chunks,
                reason,
            });
        }
        count
    }
}

/// Read until `buf` is full or the reader is exhausted.
async fn read_chunk<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn stream_file(
    outbound: &dyn Outbound,
    peer: &str,
    file: &FileSource,
    start: PeerMessage,
    file_id: &str,
    file_name: &str,
    total_chunks: u32,
) -> Result<(), TransferError> {
    outbound.send(peer, start).await?;

    let mut reader = file.open().await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    for chunk_index in 0..total_chunks {
        let n = read_chunk(&mut reader, &mut buf).await?;
        if n == 0 {
            return Err(TransferError::ShortRead { file_id: file_id.to_string(), index: chunk_index });
        }
        let message = PeerMessage::FileChunk {
            file_id: file_id.to_string(),
            chunk_index,
            total_chunks,
            chunk: buf[..n].to_vec(),
        };
        outbound.send(peer, message).await?;
        tracing::debug!("Sent chunk {}/{} of {} to {}", chunk_index + 1, total_chunks, file_id, peer);
    }

    outbound
        .send(peer, PeerMessage::FileEnd { file_id: file_id.to_string(), file_name: file_name.to_string() })
        .await?;
    Ok(())
}
