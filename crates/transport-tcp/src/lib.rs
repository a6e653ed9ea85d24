//! TCP transports: [`RelayedTransport`] through the hub and
//! [`DirectTransport`] straight to the peer.

pub mod direct;
pub mod relayed;

use quickshare_core::config::{ClientConfig, TransportMode};
use quickshare_core::transport::Acquire;
use std::sync::Arc;

pub use direct::{DirectAcquire, DirectTransport};
pub use relayed::{RelayAcquire, RelayedTransport};

/// Build the acquirer selected by `cfg.transport`.
pub fn acquirer(cfg: &ClientConfig) -> Arc<dyn Acquire> {
    match cfg.transport {
        TransportMode::Relayed => Arc::new(RelayAcquire::new(cfg.relay_addr.clone())),
        TransportMode::Direct => Arc::new(DirectAcquire {
            listen_addr: format!("0.0.0.0:{}", cfg.listen_port),
            advertise_addr: cfg.advertise_addr.clone(),
            ice_servers: cfg.ice_servers.clone(),
        }),
    }
}
