//! Transport contract shared by the direct and relayed channels.
//!
//! A transport reports everything that happens to it as [`TransportEvent`]s on
//! the channel it was acquired with; the session manager is its only consumer.

use crate::codec::CodecError;
use crate::protocol::PeerMessage;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport is not ready")]
    NotReady,
    #[error("peer {0} is not linked")]
    NotLinked(String),
    #[error("channel to {0} is closed")]
    ChannelClosed(String),
    #[error("invalid target {0}")]
    InvalidTarget(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Notifications from a transport, delivered in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport has its local identifier and can link peers.
    Ready { local_id: String },
    PeerLinked(String),
    PeerUnlinked(String),
    Message { from: String, message: PeerMessage },
    /// A link request named an identifier nobody has registered.
    PeerNotFound { target: String, message: String },
    /// Non-fatal transport-level failure (e.g. a channel that never opened).
    Error(String),
    /// The underlying signalling/relay connection is gone.
    Lost(String),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// How a `send` reaches linked peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// One private channel per peer; `send` targets exactly that peer.
    PerPeer,
    /// Every `send` is fanned out by the hub to all linked peers.
    FanOut,
}

/// Sending half used by the transfer engine.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, peer: &str, message: PeerMessage) -> Result<(), TransportError>;

    fn delivery(&self) -> Delivery {
        Delivery::PerPeer
    }
}

/// A bidirectional ordered channel to linked peers.
#[async_trait]
pub trait Transport: Outbound {
    fn local_identifier(&self) -> Option<String>;

    /// Ask for a link to `target`. The outcome arrives as an event.
    async fn connect(&self, target: &str) -> Result<(), TransportError>;

    async fn unlink(&self, peer: &str) -> Result<(), TransportError>;

    /// Re-establish the signalling connection keeping the same identity.
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Tear everything down. No further events are emitted.
    async fn close(&self);
}

/// Creates transports for the session manager, fresh identity each time.
#[async_trait]
pub trait Acquire: Send + Sync {
    async fn acquire(&self, events: EventSender) -> Result<Arc<dyn Transport>, TransportError>;
}
