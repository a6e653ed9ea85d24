//! Transport that reaches peers through the relay hub.
//!
//! Every message goes to the hub, which forwards it to all peers linked to
//! this identifier. Losing the hub connection is reported as
//! [`TransportEvent::Lost`]; `reconnect` dials again and re-registers the same
//! identifier.

use async_trait::async_trait;
use quickshare_core::codec::{read_frame, write_frame};
use quickshare_core::identifier;
use quickshare_core::protocol::{HubEvent, HubRequest, PeerMessage};
use quickshare_core::transport::{
    Acquire, Delivery, EventSender, Outbound, Transport, TransportError, TransportEvent,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub struct RelayedTransport {
    hub_addr: String,
    local_id: String,
    events: EventSender,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl RelayedTransport {
    /// Dial the hub and register `local_id`. `Ready` follows once the hub
    /// acknowledges the registration.
    pub async fn connect(
        hub_addr: &str,
        local_id: String,
        events: EventSender,
    ) -> Result<Arc<Self>, TransportError> {
        let transport = Arc::new(Self {
            hub_addr: hub_addr.to_string(),
            local_id,
            events,
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        });
        transport.dial().await?;
        Ok(transport)
    }

    async fn dial(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        self.stop_reader();
        if let Some(mut old) = writer.take() {
            let _ = old.shutdown().await;
        }

        tracing::debug!("Connecting to relay hub at {}", self.hub_addr);
        let stream = TcpStream::connect(&self.hub_addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();

        write_frame(
            &mut write_half,
            &HubRequest::Register {
                identifier: self.local_id.clone(),
            },
        )
        .await?;

        let task = tokio::spawn(read_loop(read_half, self.events.clone(), self.closed.clone()));
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        *writer = Some(write_half);
        Ok(())
    }

    fn stop_reader(&self) {
        if let Some(task) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }

    async fn request(&self, request: HubRequest) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(TransportError::NotReady)?;
        if let Err(e) = write_frame(stream, &request).await {
            tracing::debug!("Write of {} to hub failed: {}", request.kind(), e);
            writer.take();
            return Err(e.into());
        }
        Ok(())
    }
}

/// Translate hub events until the connection ends.
async fn read_loop(mut reader: OwnedReadHalf, events: EventSender, closed: Arc<AtomicBool>) {
    let reason = loop {
        let event = match read_frame::<_, HubEvent>(&mut reader).await {
            Ok(Some(event)) => event,
            Ok(None) => break "hub closed the connection".to_string(),
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Ignoring unrecognised frame from hub: {}", e);
                continue;
            }
            Err(e) => break e.to_string(),
        };

        let translated = match event {
            HubEvent::Registered { identifier } => TransportEvent::Ready { local_id: identifier },
            HubEvent::PeerConnected { peer_id } => TransportEvent::PeerLinked(peer_id),
            HubEvent::PeerDisconnected { peer_id } => TransportEvent::PeerUnlinked(peer_id),
            HubEvent::PeerNotFound { target_id, message } => TransportEvent::PeerNotFound {
                target: target_id,
                message,
            },
            HubEvent::Forwarded { source_id, message } => TransportEvent::Message {
                from: source_id,
                message,
            },
            HubEvent::Error { message } => TransportEvent::Error(message),
        };
        if events.send(translated).is_err() {
            return;
        }
    };

    if !closed.load(Ordering::SeqCst) {
        let _ = events.send(TransportEvent::Lost(reason));
    }
}

#[async_trait]
impl Outbound for RelayedTransport {
    /// The hub decides the recipients, so `peer` only labels the route.
    async fn send(&self, _peer: &str, message: PeerMessage) -> Result<(), TransportError> {
        self.request(HubRequest::Forward {
            source_id: self.local_id.clone(),
            message,
        })
        .await
    }

    fn delivery(&self) -> Delivery {
        Delivery::FanOut
    }
}

#[async_trait]
impl Transport for RelayedTransport {
    fn local_identifier(&self) -> Option<String> {
        Some(self.local_id.clone())
    }

    async fn connect(&self, target: &str) -> Result<(), TransportError> {
        let target_id = identifier::canonical(target)
            .map_err(|_| TransportError::InvalidTarget(target.to_string()))?;
        self.request(HubRequest::ConnectToPeer {
            source_id: self.local_id.clone(),
            target_id,
        })
        .await
    }

    async fn unlink(&self, peer: &str) -> Result<(), TransportError> {
        self.request(HubRequest::Unlink {
            source_id: self.local_id.clone(),
            target_id: peer.to_string(),
        })
        .await
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotReady);
        }
        tracing::info!("Reconnecting to relay hub as {}", self.local_id);
        self.dial().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop_reader();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Acquires relayed transports, each with a freshly generated identifier.
pub struct RelayAcquire {
    hub_addr: String,
    preferred: Mutex<Option<String>>,
}

impl RelayAcquire {
    pub fn new(hub_addr: impl Into<String>) -> Self {
        Self {
            hub_addr: hub_addr.into(),
            preferred: Mutex::new(None),
        }
    }

    /// Use `identifier` for the first acquisition. Later ones, after the
    /// session gives up on reconnecting, still get a new identifier.
    pub fn with_identifier(self, identifier: impl Into<String>) -> Self {
        *self.preferred.lock().unwrap_or_else(|e| e.into_inner()) = Some(identifier.into());
        self
    }
}

#[async_trait]
impl Acquire for RelayAcquire {
    async fn acquire(&self, events: EventSender) -> Result<Arc<dyn Transport>, TransportError> {
        let preferred = self.preferred.lock().unwrap_or_else(|e| e.into_inner()).take();
        let local_id = preferred.unwrap_or_else(identifier::generate);
        tracing::info!("Registering with relay hub {} as {}", self.hub_addr, local_id);
        let transport = RelayedTransport::connect(&self.hub_addr, local_id, events).await?;
        Ok(transport)
    }
}
