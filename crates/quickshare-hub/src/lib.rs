//! Relay hub: identifier registry, peer links and message fan-out.

pub mod directory;
pub mod server;

pub use directory::{DirectoryCommand, DirectoryError, PeerDirectory, PeerHandle};
pub use server::{run, serve};
