//! Wire messages.
//!
//! [`PeerMessage`] is the transfer protocol spoken between endpoints and is
//! carried unchanged by both transports. [`HubRequest`] and [`HubEvent`] are
//! the relay hub's signalling messages; [`DirectFrame`] is the framing used on
//! a direct peer channel.

use serde::{Deserialize, Serialize};

/// Fixed slice size for file chunks.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Number of chunks needed for `size` bytes.
pub fn total_chunks(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE as u64) as u32
}

/// Transfer protocol messages exchanged between linked peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerMessage {
    FileStart {
        file_id: String,
        file_name: String,
        mime_type: String,
        total_size: u64,
        total_chunks: u32,
        sender: String,
    },
    FileChunk {
        file_id: String,
        chunk_index: u32,
        total_chunks: u32,
        chunk: Vec<u8>,
    },
    FileEnd {
        file_id: String,
        file_name: String,
    },
    /// Receiver acknowledgement that a transfer was reassembled.
    FileReceived {
        file_id: String,
    },
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::FileStart { .. } => "file-start",
            PeerMessage::FileChunk { .. } => "file-chunk",
            PeerMessage::FileEnd { .. } => "file-end",
            PeerMessage::FileReceived { .. } => "file-received",
        }
    }

    pub fn file_id(&self) -> &str {
        match self {
            PeerMessage::FileStart { file_id, .. }
            | PeerMessage::FileChunk { file_id, .. }
            | PeerMessage::FileEnd { file_id, .. }
            | PeerMessage::FileReceived { file_id } => file_id,
        }
    }
}

/// Client to hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HubRequest {
    Register { identifier: String },
    ConnectToPeer { source_id: String, target_id: String },
    Unlink { source_id: String, target_id: String },
    /// Payload fanned out to every peer linked to `source_id`.
    Forward { source_id: String, message: PeerMessage },
}

impl HubRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            HubRequest::Register { .. } => "register",
            HubRequest::ConnectToPeer { .. } => "connect-to-peer",
            HubRequest::Unlink { .. } => "unlink",
            HubRequest::Forward { message, .. } => message.kind(),
        }
    }
}

/// Hub to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HubEvent {
    Registered { identifier: String },
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    PeerNotFound { target_id: String, message: String },
    Forwarded { source_id: String, message: PeerMessage },
    Error { message: String },
}

/// Frames on a direct peer channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirectFrame {
    Hello { identifier: String },
    Message(PeerMessage),
}

/// Format a byte count the way transfers are logged.
pub fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{} bytes", bytes)
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    }
}
