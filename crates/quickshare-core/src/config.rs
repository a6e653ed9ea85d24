use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::session::recovery::RetryPolicy;

/// Which transport an endpoint acquires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Every message goes through the relay hub.
    Relayed,
    /// Private TCP channel per linked peer.
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory completed transfers are written to
    pub output_dir: PathBuf,

    /// Port to listen on for direct peer connections
    pub listen_port: u16,

    /// Relay hub address (host:port)
    pub relay_addr: String,

    pub transport: TransportMode,

    /// Address other peers dial for direct links; the identifier in direct mode
    pub advertise_addr: Option<String>,

    /// ICE/STUN hints handed to the direct transport untouched
    pub ice_servers: Vec<String>,

    /// Delay between timed reconnect attempts
    pub retry_interval_ms: u64,

    /// Timed reconnect attempts before a new identity is acquired
    pub max_retries: u32,

    /// Inactivity window after which a partial receive is aborted
    pub stall_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            output_dir: std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("received"),
            listen_port: 3001,
            relay_addr: "127.0.0.1:3000".to_string(),
            transport: TransportMode::Relayed,
            advertise_addr: None,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
                "stun:global.stun.twilio.com:3478".to_string(),
            ],
            retry_interval_ms: 2000,
            max_retries: 5,
            stall_timeout_secs: 30,
        }
    }
}

impl ClientConfig {
    pub fn with_relay(mut self, relay_addr: String) -> Self {
        self.relay_addr = relay_addr;
        self.transport = TransportMode::Relayed;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            interval: Duration::from_millis(self.retry_interval_ms),
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn ensure_output_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }
}

/// Relay hub settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub bind_addr: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl HubConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", port),
        }
    }
}
