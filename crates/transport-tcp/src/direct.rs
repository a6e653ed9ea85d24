//! Peer-to-peer transport: one TCP channel per linked peer.
//!
//! The local identifier is the address other peers dial. Both ends of a new
//! channel exchange a `hello` frame before the link is reported; the dialing
//! side greets first.

use async_trait::async_trait;
use quickshare_core::codec::{read_frame, write_frame};
use quickshare_core::identifier;
use quickshare_core::protocol::{DirectFrame, PeerMessage};
use quickshare_core::transport::{
    Acquire, EventSender, Outbound, Transport, TransportError, TransportEvent,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Time allowed for the greeting exchange on a fresh channel.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

type Writer = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

struct Link {
    id: String,
    serial: u64,
    writer: Writer,
    reader: JoinHandle<()>,
}

struct Shared {
    local_id: String,
    events: EventSender,
    links: Mutex<HashMap<String, Link>>,
    next_serial: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }

    fn linked_count(&self) -> usize {
        self.links.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Install a greeted channel as the link for `peer_id`, replacing any
    /// previous channel to the same identifier.
    fn install(self: &Arc<Self>, peer_id: String, reader: OwnedReadHalf, writer: OwnedWriteHalf) {
        let key = identifier::normalize(&peer_id);
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = links.remove(&key) {
            tracing::debug!("Replacing channel to {}", old.id);
            old.reader.abort();
        }

        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        self.emit(TransportEvent::PeerLinked(peer_id.clone()));
        let task = tokio::spawn(read_loop(self.clone(), peer_id.clone(), serial, reader));
        links.insert(
            key,
            Link {
                id: peer_id,
                serial,
                writer: Arc::new(tokio::sync::Mutex::new(writer)),
                reader: task,
            },
        );
    }

    /// Drop the link for `peer` if it is still the channel `serial`.
    fn remove(&self, peer: &str, serial: Option<u64>) -> Option<Link> {
        let key = identifier::normalize(peer);
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        let stale = match (links.get(&key), serial) {
            (Some(link), Some(serial)) => link.serial != serial,
            (Some(_), None) => false,
            (None, _) => return None,
        };
        if stale {
            return None;
        }
        links.remove(&key)
    }

    fn writer(&self, peer: &str) -> Option<Writer> {
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&identifier::normalize(peer))
            .map(|link| link.writer.clone())
    }
}

async fn read_loop(shared: Arc<Shared>, peer_id: String, serial: u64, mut reader: OwnedReadHalf) {
    loop {
        match read_frame::<_, DirectFrame>(&mut reader).await {
            Ok(Some(DirectFrame::Message(message))) => shared.emit(TransportEvent::Message {
                from: peer_id.clone(),
                message,
            }),
            Ok(Some(DirectFrame::Hello { .. })) => {
                tracing::debug!("Repeated greeting from {}", peer_id);
            }
            Ok(None) => break,
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Unrecognised frame from {}: {}", peer_id, e);
                shared.emit(TransportEvent::Error(format!("unrecognised message from {}: {}", peer_id, e)));
            }
            Err(e) => {
                tracing::debug!("Channel to {} failed: {}", peer_id, e);
                break;
            }
        }
    }

    if shared.remove(&peer_id, Some(serial)).is_some() {
        tracing::info!("Channel to {} closed", peer_id);
        shared.emit(TransportEvent::PeerUnlinked(peer_id));
    }
}

async fn read_hello(reader: &mut OwnedReadHalf) -> Result<String, TransportError> {
    let frame = tokio::time::timeout(HELLO_TIMEOUT, read_frame::<_, DirectFrame>(reader))
        .await
        .map_err(|_| TransportError::ChannelClosed("greeting timed out".into()))??;
    match frame {
        Some(DirectFrame::Hello { identifier: id }) => {
            identifier::canonical(&id).map_err(|_| TransportError::InvalidTarget(id))
        }
        Some(DirectFrame::Message(message)) => Err(TransportError::ChannelClosed(format!(
            "expected greeting, got {}",
            message.kind()
        ))),
        None => Err(TransportError::ChannelClosed("closed before greeting".into())),
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                continue;
            }
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_one(&shared, stream).await {
                tracing::warn!("Inbound channel from {} failed: {}", addr, e);
                shared.emit(TransportEvent::Error(format!("inbound channel from {} failed: {}", addr, e)));
            }
        });
    }
}

async fn accept_one(shared: &Arc<Shared>, stream: TcpStream) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let peer_id = read_hello(&mut reader).await?;
    write_frame(&mut writer, &DirectFrame::Hello { identifier: shared.local_id.clone() }).await?;
    tracing::info!("Accepted channel from {}", peer_id);
    shared.install(peer_id, reader, writer);
    Ok(())
}

async fn dial(shared: &Arc<Shared>, target: &str) -> Result<(), TransportError> {
    let stream = TcpStream::connect(target).await?;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    write_frame(&mut writer, &DirectFrame::Hello { identifier: shared.local_id.clone() }).await?;
    let greeted = read_hello(&mut reader).await?;
    if !identifier::matches(&greeted, target) {
        tracing::debug!("{} introduced itself as {}", target, greeted);
    }
    tracing::info!("Opened channel to {}", target);
    shared.install(target.to_string(), reader, writer);
    Ok(())
}

pub struct DirectTransport {
    shared: Arc<Shared>,
    listen_addr: SocketAddr,
    ice_servers: Vec<String>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl DirectTransport {
    /// Start listening on `listen_addr` and report `Ready` with the
    /// advertised address (or the bound address when none is given).
    pub async fn bind(
        listen_addr: &str,
        advertise_addr: Option<String>,
        ice_servers: Vec<String>,
        events: EventSender,
    ) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(listen_addr).await?;
        let bound = listener.local_addr()?;
        let local_id = advertise_addr.unwrap_or_else(|| bound.to_string());
        tracing::info!("Direct transport listening on {} as {}", bound, local_id);
        tracing::debug!("Connection hints: {:?}", ice_servers);

        let shared = Arc::new(Shared {
            local_id: local_id.clone(),
            events,
            links: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let accept = tokio::spawn(accept_loop(shared.clone(), listener));
        shared.emit(TransportEvent::Ready { local_id });

        Ok(Arc::new(Self {
            shared,
            listen_addr: bound,
            ice_servers,
            accept: Mutex::new(Some(accept)),
        }))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Connection hints this transport was configured with.
    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }
}

#[async_trait]
impl Outbound for DirectTransport {
    async fn send(&self, peer: &str, message: PeerMessage) -> Result<(), TransportError> {
        let writer = self
            .shared
            .writer(peer)
            .ok_or_else(|| TransportError::NotLinked(peer.to_string()))?;
        let mut writer = writer.lock().await;
        write_frame(&mut *writer, &DirectFrame::Message(message))
            .await
            .map_err(|e| {
                tracing::debug!("Send to {} failed: {}", peer, e);
                TransportError::ChannelClosed(peer.to_string())
            })
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn local_identifier(&self) -> Option<String> {
        Some(self.shared.local_id.clone())
    }

    /// Dial `target` in the background. A channel that fails to open is a
    /// transport error; it only counts as losing the transport when no other
    /// peer is reachable.
    async fn connect(&self, target: &str) -> Result<(), TransportError> {
        let target = identifier::canonical(target)
            .map_err(|_| TransportError::InvalidTarget(target.to_string()))?;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = dial(&shared, &target).await {
                tracing::warn!("Could not open channel to {}: {}", target, e);
                shared.emit(TransportEvent::Error(format!("could not open channel to {}: {}", target, e)));
                if shared.linked_count() == 0 {
                    shared.emit(TransportEvent::Lost(format!("no reachable peers after {} failed", target)));
                }
            }
        });
        Ok(())
    }

    async fn unlink(&self, peer: &str) -> Result<(), TransportError> {
        let Some(link) = self.shared.remove(peer, None) else {
            return Ok(());
        };
        link.reader.abort();
        let _ = link.writer.lock().await.shutdown().await;
        tracing::info!("Unlinked from {}", link.id);
        self.shared.emit(TransportEvent::PeerUnlinked(link.id));
        Ok(())
    }

    /// There is no signalling connection to restore; the listener stays up,
    /// so the transport is usable again immediately.
    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotReady);
        }
        self.shared.emit(TransportEvent::Ready {
            local_id: self.shared.local_id.clone(),
        });
        Ok(())
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(accept) = self.accept.lock().unwrap_or_else(|e| e.into_inner()).take() {
            accept.abort();
        }
        let links: Vec<Link> = self
            .shared
            .links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, link)| link)
            .collect();
        for link in links {
            link.reader.abort();
            let _ = link.writer.lock().await.shutdown().await;
        }
    }
}

/// Binds a fresh listener for every acquisition.
pub struct DirectAcquire {
    pub listen_addr: String,
    pub advertise_addr: Option<String>,
    pub ice_servers: Vec<String>,
}

impl DirectAcquire {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            advertise_addr: None,
            ice_servers: Vec::new(),
        }
    }
}

#[async_trait]
impl Acquire for DirectAcquire {
    async fn acquire(&self, events: EventSender) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = DirectTransport::bind(
            &self.listen_addr,
            self.advertise_addr.clone(),
            self.ice_servers.clone(),
            events,
        )
        .await?;
        Ok(transport)
    }
}
