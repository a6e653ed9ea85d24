//! Hub-side peer directory.
//!
//! Maps identifiers to the connection that registered them and records which
//! identifiers are linked. The directory is plain owned state; the hub runs it
//! inside a single task fed by [`DirectoryCommand`]s, which serialises every
//! register/link/forward/unregister against each other.

use quickshare_core::identifier::{self, IdentifierError};
use quickshare_core::protocol::{HubEvent, PeerMessage};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifies one accepted hub connection.
pub type ConnId = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("identifier is empty")]
    Empty,
    #[error("Peer not found or not online. Make sure both devices are connected to the server.")]
    NotFound(String),
    #[error("{0} is not registered on this connection")]
    NotRegistered(String),
    #[error("cannot link {0} to itself")]
    SelfLink(String),
}

impl From<IdentifierError> for DirectoryError {
    fn from(_: IdentifierError) -> Self {
        DirectoryError::Empty
    }
}

/// Outgoing half of a hub connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub conn: ConnId,
    tx: mpsc::UnboundedSender<HubEvent>,
}

impl PeerHandle {
    pub fn new(conn: ConnId, tx: mpsc::UnboundedSender<HubEvent>) -> Self {
        Self { conn, tx }
    }

    /// Queue `event` for the connection's writer. False if it is gone.
    pub fn deliver(&self, event: HubEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

struct Entry {
    identifier: String,
    handle: PeerHandle,
    linked: Vec<String>,
}

/// Requests applied to the directory, in arrival order.
#[derive(Debug)]
pub enum DirectoryCommand {
    Register { identifier: String, handle: PeerHandle },
    ConnectToPeer { source_id: String, target_id: String, handle: PeerHandle },
    Unlink { source_id: String, target_id: String, handle: PeerHandle },
    Forward { source_id: String, message: PeerMessage, handle: PeerHandle },
    Unregister { identifier: String, conn: ConnId },
}

#[derive(Default)]
pub struct PeerDirectory {
    /// Keyed by the normalised identifier.
    entries: HashMap<String, Entry>,
}

impl PeerDirectory {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store `handle` for `identifier`. An existing registration is replaced
    /// outright: its links are torn down and nothing carries over.
    pub fn register(&mut self, identifier: &str, handle: PeerHandle) -> Result<String, DirectoryError> {
        let canonical = identifier::canonical(identifier)?;
        let key = identifier::normalize(&canonical);

        if let Some(old) = self.entries.remove(&key) {
            tracing::info!(
                "Device re-registered: {} (connection {} replaces {})",
                canonical,
                handle.conn,
                old.handle.conn
            );
            self.drop_links(&old);
        } else {
            tracing::info!("Device registered: {} (connection {})", canonical, handle.conn);
        }

        handle.deliver(HubEvent::Registered { identifier: canonical.clone() });
        self.entries.insert(
            key,
            Entry {
                identifier: canonical.clone(),
                handle,
                linked: Vec::new(),
            },
        );
        Ok(canonical)
    }

    /// Canonical spelling of a registered identifier.
    pub fn resolve(&self, query: &str) -> Result<&str, DirectoryError> {
        self.entries
            .get(&identifier::normalize(query))
            .map(|e| e.identifier.as_str())
            .ok_or_else(|| DirectoryError::NotFound(query.trim().to_string()))
    }

    pub fn linked_peers(&self, identifier: &str) -> Vec<String> {
        self.entries
            .get(&identifier::normalize(identifier))
            .map(|e| e.linked.clone())
            .unwrap_or_default()
    }

    /// Link two registered identifiers and tell both sides. Re-linking an
    /// existing pair succeeds without notifying anyone again.
    pub fn link(&mut self, source_id: &str, target_id: &str) -> Result<(String, String), DirectoryError> {
        let source = self.resolve(source_id)?.to_string();
        let target = self.resolve(target_id)?.to_string();
        if identifier::matches(&source, &target) {
            return Err(DirectoryError::SelfLink(source));
        }

        let source_key = identifier::normalize(&source);
        let target_key = identifier::normalize(&target);

        let newly_linked = match self.entries.get_mut(&source_key) {
            Some(entry) if !entry.linked.iter().any(|p| identifier::matches(p, &target)) => {
                entry.linked.push(target.clone());
                true
            }
            _ => false,
        };
        if let Some(entry) = self.entries.get_mut(&target_key) {
            if !entry.linked.iter().any(|p| identifier::matches(p, &source)) {
                entry.linked.push(source.clone());
            }
        }

        if newly_linked {
            if let Some(entry) = self.entries.get(&source_key) {
                entry.handle.deliver(HubEvent::PeerConnected { peer_id: target.clone() });
            }
            if let Some(entry) = self.entries.get(&target_key) {
                entry.handle.deliver(HubEvent::PeerConnected { peer_id: source.clone() });
            }
            tracing::info!("Connection established: {} <-> {}", source, target);
        }
        Ok((source, target))
    }

    /// Remove the link between two identifiers, notifying both.
    pub fn unlink(&mut self, source_id: &str, target_id: &str) -> Result<(), DirectoryError> {
        let source = self.resolve(source_id)?.to_string();
        let target = self.resolve(target_id)?.to_string();

        let mut removed = false;
        for (me, other) in [(&source, &target), (&target, &source)] {
            if let Some(entry) = self.entries.get_mut(&identifier::normalize(me)) {
                let before = entry.linked.len();
                entry.linked.retain(|p| !identifier::matches(p, other));
                if entry.linked.len() != before {
                    removed = true;
                    entry.handle.deliver(HubEvent::PeerDisconnected { peer_id: other.clone() });
                }
            }
        }
        if removed {
            tracing::info!("Link removed: {} <-> {}", source, target);
        }
        Ok(())
    }

    /// Deliver `message` to every peer linked to `source_id`. Peers whose
    /// connection is already gone are skipped; disconnect handles cleanup.
    pub fn forward(&self, source_id: &str, message: &PeerMessage) -> usize {
        let Some(entry) = self.entries.get(&identifier::normalize(source_id)) else {
            return 0;
        };

        let mut delivered = 0;
        for peer in &entry.linked {
            let Some(target) = self.entries.get(&identifier::normalize(peer)) else {
                continue;
            };
            let event = HubEvent::Forwarded {
                source_id: entry.identifier.clone(),
                message: message.clone(),
            };
            if target.handle.deliver(event) {
                delivered += 1;
            } else {
                tracing::debug!("Skipping {} for closed connection of {}", message.kind(), peer);
            }
        }
        delivered
    }

    /// Remove `identifier` if it is still owned by `conn`, unlinking it from
    /// every peer. Returns how many peers were notified.
    pub fn unregister(&mut self, identifier: &str, conn: ConnId) -> usize {
        let key = identifier::normalize(identifier);
        match self.entries.get(&key) {
            Some(entry) if entry.handle.conn == conn => {}
            Some(_) => {
                tracing::debug!("Ignoring unregister of {} from stale connection {}", identifier, conn);
                return 0;
            }
            None => return 0,
        }

        let Some(entry) = self.entries.remove(&key) else {
            return 0;
        };
        tracing::info!("Client disconnected: {}", entry.identifier);
        self.drop_links(&entry)
    }

    /// Remove reverse links to `entry` and tell each former peer.
    fn drop_links(&mut self, entry: &Entry) -> usize {
        let mut notified = 0;
        for peer in &entry.linked {
            if let Some(other) = self.entries.get_mut(&identifier::normalize(peer)) {
                other.linked.retain(|p| !identifier::matches(p, &entry.identifier));
                other.handle.deliver(HubEvent::PeerDisconnected {
                    peer_id: entry.identifier.clone(),
                });
                notified += 1;
            }
        }
        notified
    }

    /// Check that `source_id` is registered through `conn`.
    fn owned_by(&self, source_id: &str, conn: ConnId) -> Result<(), DirectoryError> {
        match self.entries.get(&identifier::normalize(source_id)) {
            Some(entry) if entry.handle.conn == conn => Ok(()),
            _ => Err(DirectoryError::NotRegistered(source_id.trim().to_string())),
        }
    }

    /// Apply one command. Errors go back to the requesting connection only.
    pub fn apply(&mut self, command: DirectoryCommand) {
        match command {
            DirectoryCommand::Register { identifier, handle } => {
                if let Err(e) = self.register(&identifier, handle.clone()) {
                    handle.deliver(HubEvent::Error { message: e.to_string() });
                }
            }
            DirectoryCommand::ConnectToPeer { source_id, target_id, handle } => {
                tracing::info!("Connection request: {} -> {}", source_id.trim(), target_id.trim());
                if self.owned_by(&source_id, handle.conn).is_err() {
                    tracing::info!("Source device {} not registered, registering now", source_id.trim());
                    if let Err(e) = self.register(&source_id, handle.clone()) {
                        handle.deliver(HubEvent::Error { message: e.to_string() });
                        return;
                    }
                }
                match self.link(&source_id, &target_id) {
                    Ok(_) => {}
                    Err(DirectoryError::NotFound(_)) => {
                        tracing::info!("Target device {} not found", target_id.trim());
                        handle.deliver(HubEvent::PeerNotFound {
                            target_id: target_id.trim().to_string(),
                            message: DirectoryError::NotFound(target_id.clone()).to_string(),
                        });
                    }
                    Err(e) => {
                        handle.deliver(HubEvent::Error { message: e.to_string() });
                    }
                }
            }
            DirectoryCommand::Unlink { source_id, target_id, handle } => {
                let result = self
                    .owned_by(&source_id, handle.conn)
                    .and_then(|_| self.unlink(&source_id, &target_id));
                if let Err(e) = result {
                    handle.deliver(HubEvent::Error { message: e.to_string() });
                }
            }
            DirectoryCommand::Forward { source_id, message, handle } => {
                if let Err(e) = self.owned_by(&source_id, handle.conn) {
                    handle.deliver(HubEvent::Error { message: e.to_string() });
                    return;
                }
                let delivered = self.forward(&source_id, &message);
                tracing::debug!("Forwarded {} from {} to {} peer(s)", message.kind(), source_id, delivered);
            }
            DirectoryCommand::Unregister { identifier, conn } => {
                self.unregister(&identifier, conn);
            }
        }
    }
}

/// Sequential processing loop for a directory.
pub async fn run_directory(mut directory: PeerDirectory, mut commands: mpsc::UnboundedReceiver<DirectoryCommand>) {
    while let Some(command) = commands.recv().await {
        directory.apply(command);
    }
    tracing::debug!("Directory loop finished with {} registration(s)", directory.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(conn: ConnId) -> (PeerHandle, mpsc::UnboundedReceiver<HubEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerHandle::new(conn, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<HubEvent>) -> Vec<HubEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn chunk() -> PeerMessage {
        PeerMessage::FileChunk { file_id: "f".into(), chunk_index: 0, total_chunks: 1, chunk: vec![1, 2, 3] }
    }

    #[test]
    fn test_resolve_is_case_and_whitespace_insensitive() {
        let mut dir = PeerDirectory::default();
        let (h, _rx) = handle(1);
        dir.register("abc", h).unwrap();
        assert_eq!(dir.resolve("  ABC ").unwrap(), "abc");
        assert!(matches!(dir.resolve("abd"), Err(DirectoryError::NotFound(_))));
    }

    #[test]
    fn test_link_notifies_both_sides_with_canonical_ids() {
        let mut dir = PeerDirectory::default();
        let (a, mut a_rx) = handle(1);
        let (b, mut b_rx) = handle(2);
        dir.register("node-a", a).unwrap();
        dir.register("NODE-B", b).unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        let (s, t) = dir.link("node-a", " node-b ").unwrap();
        assert_eq!((s.as_str(), t.as_str()), ("node-a", "NODE-B"));
        assert_eq!(drain(&mut a_rx), vec![HubEvent::PeerConnected { peer_id: "NODE-B".into() }]);
        assert_eq!(drain(&mut b_rx), vec![HubEvent::PeerConnected { peer_id: "node-a".into() }]);
        assert_eq!(dir.linked_peers("node-a"), vec!["NODE-B".to_string()]);
        assert_eq!(dir.linked_peers("node-b"), vec!["node-a".to_string()]);

        // Idempotent.
        dir.link("NODE-A", "node-b").unwrap();
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(dir.linked_peers("node-a").len(), 1);
    }

    #[test]
    fn test_link_to_unknown_peer_reports_to_requester_only() {
        let mut dir = PeerDirectory::default();
        let (a, mut a_rx) = handle(1);
        let (b, mut b_rx) = handle(2);
        dir.register("node-a", a.clone()).unwrap();
        dir.register("node-b", b).unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        dir.apply(DirectoryCommand::ConnectToPeer {
            source_id: "node-a".into(),
            target_id: "ghost".into(),
            handle: a,
        });
        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], HubEvent::PeerNotFound { target_id, .. } if target_id == "ghost"));
        assert!(drain(&mut b_rx).is_empty());
        assert!(dir.linked_peers("node-a").is_empty());
    }

    #[test]
    fn test_self_link_rejected() {
        let mut dir = PeerDirectory::default();
        let (a, _rx) = handle(1);
        dir.register("node-a", a).unwrap();
        assert!(matches!(dir.link("node-a", "NODE-A"), Err(DirectoryError::SelfLink(_))));
    }

    #[test]
    fn test_connect_auto_registers_source() {
        let mut dir = PeerDirectory::default();
        let (a, mut a_rx) = handle(1);
        let (b, _b_rx) = handle(2);
        dir.register("node-b", b).unwrap();

        dir.apply(DirectoryCommand::ConnectToPeer {
            source_id: "node-a".into(),
            target_id: "node-b".into(),
            handle: a,
        });
        assert_eq!(
            drain(&mut a_rx),
            vec![
                HubEvent::Registered { identifier: "node-a".into() },
                HubEvent::PeerConnected { peer_id: "node-b".into() },
            ]
        );
    }

    #[test]
    fn test_forward_fans_out_to_linked_only() {
        let mut dir = PeerDirectory::default();
        let (a, _a_rx) = handle(1);
        let (b, mut b_rx) = handle(2);
        let (c, mut c_rx) = handle(3);
        let (d, mut d_rx) = handle(4);
        dir.register("a", a).unwrap();
        dir.register("b", b).unwrap();
        dir.register("c", c).unwrap();
        dir.register("d", d).unwrap();
        dir.link("a", "b").unwrap();
        dir.link("a", "c").unwrap();
        drain(&mut b_rx);
        drain(&mut c_rx);
        drain(&mut d_rx);

        assert_eq!(dir.forward("A", &chunk()), 2);
        let expected = vec![HubEvent::Forwarded { source_id: "a".into(), message: chunk() }];
        assert_eq!(drain(&mut b_rx), expected);
        assert_eq!(drain(&mut c_rx), expected);
        assert!(drain(&mut d_rx).is_empty());
    }

    #[test]
    fn test_forward_skips_closed_handles() {
        let mut dir = PeerDirectory::default();
        let (a, _a_rx) = handle(1);
        let (b, b_rx) = handle(2);
        dir.register("a", a).unwrap();
        dir.register("b", b).unwrap();
        dir.link("a", "b").unwrap();
        drop(b_rx);

        assert_eq!(dir.forward("a", &chunk()), 0);
        // Link cleanup is left to disconnect handling.
        assert_eq!(dir.linked_peers("a"), vec!["b".to_string()]);
    }

    #[test]
    fn test_forward_from_foreign_connection_rejected() {
        let mut dir = PeerDirectory::default();
        let (a, _a_rx) = handle(1);
        let (b, mut b_rx) = handle(2);
        let (mallory, mut m_rx) = handle(3);
        dir.register("a", a).unwrap();
        dir.register("b", b).unwrap();
        dir.link("a", "b").unwrap();
        drain(&mut b_rx);

        dir.apply(DirectoryCommand::Forward { source_id: "a".into(), message: chunk(), handle: mallory });
        assert!(matches!(drain(&mut m_rx).as_slice(), [HubEvent::Error { .. }]));
        assert!(drain(&mut b_rx).is_empty());
    }

    #[test]
    fn test_unregister_notifies_each_linked_peer_once() {
        let mut dir = PeerDirectory::default();
        let (hub, _hub_rx) = handle(1);
        dir.register("hub-node", hub).unwrap();
        let mut receivers = Vec::new();
        for n in 0..3 {
            let (h, rx) = handle(10 + n);
            let id = format!("peer-{}", n);
            dir.register(&id, h).unwrap();
            dir.link("hub-node", &id).unwrap();
            receivers.push((id, rx));
        }
        for (_, rx) in receivers.iter_mut() {
            drain(rx);
        }

        assert_eq!(dir.unregister("HUB-NODE", 1), 3);
        for (id, rx) in receivers.iter_mut() {
            assert_eq!(drain(rx), vec![HubEvent::PeerDisconnected { peer_id: "hub-node".into() }]);
            assert!(dir.linked_peers(id).is_empty());
        }
        assert!(dir.resolve("hub-node").is_err());
    }

    #[test]
    fn test_reregister_replaces_handle_and_ignores_stale_unregister() {
        let mut dir = PeerDirectory::default();
        let (a_old, mut old_rx) = handle(1);
        let (a_new, mut new_rx) = handle(2);
        let (b, mut b_rx) = handle(3);
        dir.register("a", a_old).unwrap();
        dir.register("b", b).unwrap();
        dir.link("a", "b").unwrap();
        drain(&mut old_rx);
        drain(&mut b_rx);

        dir.register("A", a_new).unwrap();
        assert_eq!(drain(&mut b_rx), vec![HubEvent::PeerDisconnected { peer_id: "a".into() }]);
        assert_eq!(drain(&mut new_rx), vec![HubEvent::Registered { identifier: "A".into() }]);
        assert!(dir.linked_peers("a").is_empty());

        // The replaced connection closing must not remove the new registration.
        assert_eq!(dir.unregister("a", 1), 0);
        assert_eq!(dir.resolve("a").unwrap(), "A");

        dir.link("b", "a").unwrap();
        dir.forward("b", &chunk());
        assert!(drain(&mut old_rx).is_empty());
        assert_eq!(drain(&mut new_rx).len(), 2);
    }

    #[test]
    fn test_unlink_notifies_both() {
        let mut dir = PeerDirectory::default();
        let (a, mut a_rx) = handle(1);
        let (b, mut b_rx) = handle(2);
        dir.register("a", a.clone()).unwrap();
        dir.register("b", b).unwrap();
        dir.link("a", "b").unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        dir.apply(DirectoryCommand::Unlink { source_id: "a".into(), target_id: "B".into(), handle: a });
        assert_eq!(drain(&mut a_rx), vec![HubEvent::PeerDisconnected { peer_id: "b".into() }]);
        assert_eq!(drain(&mut b_rx), vec![HubEvent::PeerDisconnected { peer_id: "a".into() }]);
    }

    #[tokio::test]
    async fn test_directory_loop_serialises_commands() {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_directory(PeerDirectory::default(), rx));

        let (a, mut a_rx) = handle(1);
        let (b, mut b_rx) = handle(2);
        tx.send(DirectoryCommand::Register { identifier: "node-a".into(), handle: a.clone() }).unwrap();
        tx.send(DirectoryCommand::Register { identifier: "NODE-B".into(), handle: b }).unwrap();
        tx.send(DirectoryCommand::ConnectToPeer { source_id: "node-a".into(), target_id: "node-b".into(), handle: a.clone() }).unwrap();
        tx.send(DirectoryCommand::Forward { source_id: "node-a".into(), message: chunk(), handle: a }).unwrap();
        tx.send(DirectoryCommand::Unregister { identifier: "node-a".into(), conn: 1 }).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(
            drain(&mut a_rx),
            vec![
                HubEvent::Registered { identifier: "node-a".into() },
                HubEvent::PeerConnected { peer_id: "NODE-B".into() },
            ]
        );
        assert_eq!(
            drain(&mut b_rx),
            vec![
                HubEvent::Registered { identifier: "NODE-B".into() },
                HubEvent::PeerConnected { peer_id: "node-a".into() },
                HubEvent::Forwarded { source_id: "node-a".into(), message: chunk() },
                HubEvent::PeerDisconnected { peer_id: "node-a".into() },
            ]
        );
    }
}
