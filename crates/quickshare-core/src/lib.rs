//! QuickShare Core - identifier-linked file transfer
//!
//! Runs one chunked transfer protocol over interchangeable transports (a
//! direct peer channel or a relay hub), with a session manager that keeps
//! track of linked peers and recovers lost transports.

pub mod config;
pub mod identifier;
pub mod protocol;
pub mod codec;
pub mod transport;
pub mod session;
pub mod transfer;
pub mod client;

// Re-export commonly used types
pub use config::{ClientConfig, HubConfig, TransportMode};
pub use protocol::{PeerMessage, CHUNK_SIZE};
pub use session::{ConnectOutcome, SessionEvent, SessionManager, SessionState};
pub use transfer::{FileSource, TransferEngine, TransferEvent};
pub use transport::{Acquire, Transport, TransportEvent};
pub use client::Client;
