//! Endpoint session manager.
//!
//! Owns the local identifier and the set of linked peers, acquires a
//! transport through an [`Acquire`] implementation and drives its recovery.
//! All state lives in one driver task; the [`SessionManager`] handle talks to
//! it over a command channel, so every transition is applied in order.

pub mod recovery;

use crate::identifier::{self, IdentifierError};
use crate::protocol::PeerMessage;
use crate::transport::{
    Acquire, Delivery, EventReceiver, Outbound, Transport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use recovery::{Clock, Recovery, RetryPolicy, Step, TokioClock};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

pub use recovery::SessionState;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("peer identifier is empty")]
    EmptyIdentifier,
    #[error("cannot link to own identifier {0}")]
    SelfLink(String),
    #[error("session has shut down")]
    Closed,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<IdentifierError> for SessionError {
    fn from(_: IdentifierError) -> Self {
        SessionError::EmptyIdentifier
    }
}

/// Result of a successful `connect_to_peer` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The link request went out on the transport.
    Requested,
    /// The transport is not ready; the request replays once it is.
    Queued,
    AlreadyLinked,
}

/// Notifications for session subscribers, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Ready { local_id: String },
    PeerLinked(String),
    PeerUnlinked(String),
    PeerNotFound { target: String, message: String },
    Message { from: String, message: PeerMessage },
    TransportError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub local_id: Option<String>,
    pub linked_peers: Vec<String>,
}

enum Command {
    Connect {
        target: String,
        reply: oneshot::Sender<Result<ConnectOutcome, SessionError>>,
    },
    Unlink {
        peer: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Subscribe(mpsc::UnboundedSender<SessionEvent>),
    Shutdown(oneshot::Sender<()>),
}

/// The transport currently held by the session, shared with senders.
#[derive(Default)]
pub struct SessionOutbound {
    current: Mutex<Option<Arc<dyn Transport>>>,
}

impl SessionOutbound {
    fn set(&self, transport: Option<Arc<dyn Transport>>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = transport;
    }

    fn current(&self) -> Option<Arc<dyn Transport>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Outbound for SessionOutbound {
    async fn send(&self, peer: &str, message: PeerMessage) -> Result<(), TransportError> {
        let transport = self.current().ok_or(TransportError::NotReady)?;
        transport.send(peer, message).await
    }

    fn delivery(&self) -> Delivery {
        self.current()
            .map(|t| t.delivery())
            .unwrap_or(Delivery::PerPeer)
    }
}

/// Handle to a running session.
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    outbound: Arc<SessionOutbound>,
}

impl SessionManager {
    pub fn start(acquire: Arc<dyn Acquire>, policy: RetryPolicy) -> Self {
        Self::start_with_clock(acquire, policy, Arc::new(TokioClock))
    }

    pub fn start_with_clock(
        acquire: Arc<dyn Acquire>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: SessionState::Unstarted,
            local_id: None,
            linked_peers: Vec::new(),
        });
        let outbound = Arc::new(SessionOutbound::default());

        let driver = Driver {
            acquire,
            clock,
            recovery: Recovery::new(policy),
            transport: None,
            events: None,
            outbound: outbound.clone(),
            pending: Vec::new(),
            linked: Vec::new(),
            local_id: None,
            subscribers: Vec::new(),
            status: status_tx,
            commands: commands_rx,
        };
        tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            status: status_rx,
            outbound,
        }
    }

    /// Request a link to `target`. Validation failures never reach the wire.
    pub async fn connect_to_peer(&self, target: &str) -> Result<ConnectOutcome, SessionError> {
        let target = identifier::canonical(target)?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { target, reply })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn unlink(&self, peer: &str) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Unlink { peer: peer.to_string(), reply })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Register an observer. Observers are notified in registration order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::Subscribe(tx));
        rx
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn local_identifier(&self) -> Option<String> {
        self.status.borrow().local_id.clone()
    }

    pub fn linked_peers(&self) -> Vec<String> {
        self.status.borrow().linked_peers.clone()
    }

    /// Sender for the transfer engine; follows transport replacement.
    pub fn outbound(&self) -> Arc<SessionOutbound> {
        self.outbound.clone()
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct Driver {
    acquire: Arc<dyn Acquire>,
    clock: Arc<dyn Clock>,
    recovery: Recovery,
    transport: Option<Arc<dyn Transport>>,
    events: Option<EventReceiver>,
    outbound: Arc<SessionOutbound>,
    /// Link requests made before the transport was ready.
    pending: Vec<String>,
    linked: Vec<String>,
    local_id: Option<String>,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
    status: watch::Sender<SessionStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
}

async fn next_event(events: &mut Option<EventReceiver>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        let step = self.recovery.start();
        self.publish_state();
        self.perform(step).await;

        loop {
            let deadline = self.recovery.deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        self.events = None;
                        self.handle_event(TransportEvent::Lost("transport event stream ended".into())).await;
                    }
                },
                _ = sleep_until(deadline) => {
                    let step = self.recovery.tick(self.clock.now());
                    self.perform(step).await;
                }
            }
        }
    }

    async fn perform(&mut self, step: Step) {
        match step {
            Step::Acquire => self.acquire_transport().await,
            Step::Reconnect => {
                if let Some(transport) = &self.transport {
                    tracing::info!("Reconnecting transport (attempt {})", self.recovery.attempts());
                    if let Err(e) = transport.reconnect().await {
                        tracing::warn!("Reconnect attempt failed: {}", e);
                    }
                }
            }
            Step::Recreate => {
                tracing::warn!("Reconnect budget exhausted, creating a new transport");
                self.drop_transport().await;
                self.local_id = None;
                self.publish_state();
                self.acquire_transport().await;
            }
            Step::Release => {
                tracing::warn!("Transport lost before it was ready, acquiring again later");
                self.drop_transport().await;
                self.local_id = None;
                self.publish_state();
            }
            Step::Nothing => {}
        }
    }

    async fn acquire_transport(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.acquire.acquire(tx).await {
            Ok(transport) => {
                tracing::debug!("Transport acquired");
                self.outbound.set(Some(transport.clone()));
                self.transport = Some(transport);
                self.events = Some(rx);
            }
            Err(e) => {
                tracing::warn!("Failed to acquire transport: {}", e);
                self.emit(SessionEvent::TransportError(e.to_string()));
                self.recovery.acquire_failed(self.clock.now());
            }
        }
    }

    async fn drop_transport(&mut self) {
        self.outbound.set(None);
        self.events = None;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }

    async fn shutdown(&mut self) {
        self.drop_transport().await;
        self.unlink_all();
        self.pending.clear();
        self.recovery.shutdown();
        self.publish_state();
        tracing::info!("Session shut down");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { target, reply } => {
                let result = self.connect(target).await;
                let _ = reply.send(result);
            }
            Command::Unlink { peer, reply } => {
                let result = self.unlink(&peer).await;
                let _ = reply.send(result);
            }
            Command::Subscribe(tx) => self.subscribers.push(tx),
            Command::Shutdown(_) => {}
        }
    }

    async fn connect(&mut self, target: String) -> Result<ConnectOutcome, SessionError> {
        if let Some(local) = &self.local_id {
            if identifier::matches(local, &target) {
                return Err(SessionError::SelfLink(target));
            }
        }
        if self.is_linked(&target) {
            tracing::info!("Already linked to {}", target);
            return Ok(ConnectOutcome::AlreadyLinked);
        }

        let transport = match (&self.transport, self.recovery.state()) {
            (Some(transport), SessionState::Ready) => transport.clone(),
            _ => {
                if !self.pending.iter().any(|p| identifier::matches(p, &target)) {
                    tracing::debug!("Transport not ready, queueing link to {}", target);
                    self.pending.push(target);
                }
                return Ok(ConnectOutcome::Queued);
            }
        };

        tracing::info!("Connecting to {}", target);
        transport.connect(&target).await?;
        Ok(ConnectOutcome::Requested)
    }

    async fn unlink(&mut self, peer: &str) -> Result<(), SessionError> {
        if !self.is_linked(peer) {
            return Ok(());
        }
        let transport = self.transport.clone().ok_or(TransportError::NotReady)?;
        transport.unlink(peer).await?;
        Ok(())
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready { local_id } => {
                tracing::info!("Session ready as {}", local_id);
                self.local_id = Some(local_id.clone());
                self.recovery.ready();
                self.publish_state();
                self.emit(SessionEvent::Ready { local_id });

                for target in std::mem::take(&mut self.pending) {
                    match self.connect(target.clone()).await {
                        Ok(outcome) => tracing::debug!("Replayed link to {}: {:?}", target, outcome),
                        Err(e) => tracing::warn!("Queued link to {} dropped: {}", target, e),
                    }
                }
            }
            TransportEvent::PeerLinked(peer) => {
                self.pending.retain(|p| !identifier::matches(p, &peer));
                if !self.is_linked(&peer) {
                    tracing::info!("Linked to {}", peer);
                    self.linked.push(peer.clone());
                    self.publish_state();
                    self.emit(SessionEvent::PeerLinked(peer));
                }
            }
            TransportEvent::PeerUnlinked(peer) => {
                let before = self.linked.len();
                self.linked.retain(|p| !identifier::matches(p, &peer));
                if self.linked.len() != before {
                    tracing::info!("Unlinked from {}", peer);
                    self.publish_state();
                    self.emit(SessionEvent::PeerUnlinked(peer));
                }
            }
            TransportEvent::Message { from, message } => {
                self.emit(SessionEvent::Message { from, message });
            }
            TransportEvent::PeerNotFound { target, message } => {
                tracing::warn!("Peer {} not found: {}", target, message);
                self.emit(SessionEvent::PeerNotFound { target, message });
            }
            TransportEvent::Error(message) => {
                tracing::warn!("Transport error: {}", message);
                self.emit(SessionEvent::TransportError(message));
            }
            TransportEvent::Lost(reason) => {
                tracing::warn!("Transport lost: {}", reason);
                self.unlink_all();
                let step = self.recovery.lost(self.clock.now());
                self.publish_state();
                self.perform(step).await;
            }
        }
    }

    fn unlink_all(&mut self) {
        for peer in std::mem::take(&mut self.linked) {
            self.emit(SessionEvent::PeerUnlinked(peer));
        }
    }

    fn is_linked(&self, peer: &str) -> bool {
        self.linked.iter().any(|p| identifier::matches(p, peer))
    }

    fn publish_state(&mut self) {
        let status = SessionStatus {
            state: self.recovery.state(),
            local_id: self.local_id.clone(),
            linked_peers: self.linked.clone(),
        };
        let changed = self.status.borrow().state != status.state;
        self.status.send_replace(status);
        if changed {
            self.emit(SessionEvent::StateChanged(self.recovery.state()));
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EventSender;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Transport double that records calls and lets tests inject events.
    struct FakeTransport {
        id: String,
        events: EventSender,
        connects: Mutex<Vec<String>>,
        reconnects: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl Outbound for FakeTransport {
        async fn send(&self, _peer: &str, _message: PeerMessage) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn local_identifier(&self) -> Option<String> {
            Some(self.id.clone())
        }

        async fn connect(&self, target: &str) -> Result<(), TransportError> {
            self.connects.lock().unwrap().push(target.to_string());
            let _ = self.events.send(TransportEvent::PeerLinked(target.to_string()));
            Ok(())
        }

        async fn unlink(&self, peer: &str) -> Result<(), TransportError> {
            let _ = self.events.send(TransportEvent::PeerUnlinked(peer.to_string()));
            Ok(())
        }

        async fn reconnect(&self) -> Result<(), TransportError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::NotReady)
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Hands out numbered fake transports; readiness is announced by the test.
    #[derive(Default)]
    struct FakeAcquire {
        made: Mutex<Vec<Arc<FakeTransport>>>,
    }

    impl FakeAcquire {
        fn last(&self) -> Arc<FakeTransport> {
            self.made.lock().unwrap().last().cloned().unwrap()
        }

        fn count(&self) -> usize {
            self.made.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Acquire for FakeAcquire {
        async fn acquire(&self, events: EventSender) -> Result<Arc<dyn Transport>, TransportError> {
            let mut made = self.made.lock().unwrap();
            let transport = Arc::new(FakeTransport {
                id: format!("local-{}", made.len()),
                events,
                connects: Mutex::new(Vec::new()),
                reconnects: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            });
            made.push(transport.clone());
            Ok(transport)
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn ready_session() -> (SessionManager, Arc<FakeAcquire>) {
        let acquire = Arc::new(FakeAcquire::default());
        let session = SessionManager::start(acquire.clone(), RetryPolicy::default());
        settle().await;
        let transport = acquire.last();
        transport.events.send(TransportEvent::Ready { local_id: transport.id.clone() }).unwrap();
        settle().await;
        assert_eq!(session.state(), SessionState::Ready);
        (session, acquire)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_queued_until_ready() {
        let acquire = Arc::new(FakeAcquire::default());
        let session = SessionManager::start(acquire.clone(), RetryPolicy::default());
        let mut events = session.subscribe();

        let outcome = session.connect_to_peer(" node-b ").await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Queued);
        assert!(acquire.last().connects.lock().unwrap().is_empty());

        let transport = acquire.last();
        transport.events.send(TransportEvent::Ready { local_id: "node-a".into() }).unwrap();
        settle().await;

        assert_eq!(*transport.connects.lock().unwrap(), vec!["node-b".to_string()]);
        assert_eq!(session.linked_peers(), vec!["node-b".to_string()]);
        assert_eq!(session.local_identifier().as_deref(), Some("node-a"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&SessionEvent::Ready { local_id: "node-a".into() }));
        assert!(seen.contains(&SessionEvent::PeerLinked("node-b".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_validation() {
        let (session, acquire) = ready_session().await;

        assert!(matches!(session.connect_to_peer("   ").await, Err(SessionError::EmptyIdentifier)));
        assert!(matches!(session.connect_to_peer(" LOCAL-0 ").await, Err(SessionError::SelfLink(_))));

        assert_eq!(session.connect_to_peer("peer-x").await.unwrap(), ConnectOutcome::Requested);
        settle().await;
        assert_eq!(session.connect_to_peer("PEER-X").await.unwrap(), ConnectOutcome::AlreadyLinked);
        assert_eq!(acquire.last().connects.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlink_removes_peer() {
        let (session, _acquire) = ready_session().await;
        session.connect_to_peer("peer-x").await.unwrap();
        settle().await;
        assert_eq!(session.linked_peers().len(), 1);

        session.unlink("PEER-X").await.unwrap();
        settle().await;
        assert!(session.linked_peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_unlinks_and_reconnects_then_recreates() {
        let (session, acquire) = ready_session().await;
        let mut events = session.subscribe();
        session.connect_to_peer("peer-x").await.unwrap();
        settle().await;

        let first = acquire.last();
        first.events.send(TransportEvent::Lost("socket closed".into())).unwrap();
        settle().await;

        assert_eq!(session.state(), SessionState::Degraded);
        assert!(session.linked_peers().is_empty());
        assert_eq!(first.reconnects.load(Ordering::SeqCst), 1);

        // Five timed retries, two seconds apart.
        for expected in 2..=6 {
            tokio::time::sleep(Duration::from_millis(2001)).await;
            settle().await;
            assert_eq!(first.reconnects.load(Ordering::SeqCst), expected);
        }
        assert_eq!(acquire.count(), 1);

        // Budget exhausted: a fresh transport replaces the old one.
        tokio::time::sleep(Duration::from_millis(2001)).await;
        settle().await;
        assert_eq!(acquire.count(), 2);
        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Acquiring);
        assert_eq!(session.local_identifier(), None);

        let second = acquire.last();
        second.events.send(TransportEvent::Ready { local_id: second.id.clone() }).unwrap();
        settle().await;
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.local_identifier().as_deref(), Some("local-1"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&SessionEvent::PeerUnlinked("peer-x".into())));
        assert!(seen.contains(&SessionEvent::StateChanged(SessionState::Degraded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_before_ready_acquires_again() {
        let acquire = Arc::new(FakeAcquire::default());
        let session = SessionManager::start(acquire.clone(), RetryPolicy::default());
        settle().await;
        let first = acquire.last();

        first.events.send(TransportEvent::Lost("hub hung up".into())).unwrap();
        settle().await;
        assert_eq!(session.state(), SessionState::Acquiring);
        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
        assert_eq!(first.reconnects.load(Ordering::SeqCst), 0);
        assert_eq!(acquire.count(), 1);

        tokio::time::sleep(Duration::from_millis(2001)).await;
        settle().await;
        assert_eq!(acquire.count(), 2);

        // The replacement may be lost the same way; the session keeps trying.
        acquire.last().events.send(TransportEvent::Lost("hub hung up".into())).unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_millis(2001)).await;
        settle().await;
        assert_eq!(acquire.count(), 3);

        let third = acquire.last();
        third.events.send(TransportEvent::Ready { local_id: third.id.clone() }).unwrap();
        settle().await;
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.local_identifier().as_deref(), Some("local-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_terminal() {
        let (session, acquire) = ready_session().await;
        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Abandoned);
        assert_eq!(acquire.last().closed.load(Ordering::SeqCst), 1);
        assert!(matches!(session.connect_to_peer("x").await, Err(SessionError::Closed)));
    }
}
