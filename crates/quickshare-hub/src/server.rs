use crate::directory::{run_directory, ConnId, DirectoryCommand, PeerDirectory, PeerHandle};
use anyhow::Result;
use quickshare_core::codec::{read_frame, write_frame};
use quickshare_core::config::HubConfig;
use quickshare_core::identifier;
use quickshare_core::protocol::{HubEvent, HubRequest};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Bind `cfg.bind_addr` and serve until the listener fails.
pub async fn run(cfg: HubConfig) -> Result<()> {
    let listener = TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!("Relay hub listening on {}", listener.local_addr()?);
    serve(listener).await
}

/// Accept loop. Every connection gets its own task; all of them share one
/// directory task.
pub async fn serve(listener: TcpListener) -> Result<()> {
    let (commands, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_directory(PeerDirectory::default(), rx));

    let mut next_conn: ConnId = 0;
    loop {
        let (stream, addr) = listener.accept().await?;
        next_conn += 1;
        let conn = next_conn;
        let commands = commands.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, conn, commands).await {
                tracing::warn!("Connection {} from {} ended with error: {:#}", conn, addr, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn: ConnId,
    commands: mpsc::UnboundedSender<DirectoryCommand>,
) -> Result<()> {
    tracing::debug!("Client connected: {} (connection {})", addr, conn);
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<HubEvent>();
    let handle = PeerHandle::new(conn, events_tx);

    let writer_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &event).await {
                tracing::debug!("Write to connection {} failed: {}", conn, e);
                break;
            }
        }
    });

    // Identifiers this connection has claimed; released on disconnect.
    let mut claimed: Vec<String> = Vec::new();

    let result = loop {
        let request = match read_frame::<_, HubRequest>(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => break Ok(()),
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Connection {} sent an unrecognised message: {}", conn, e);
                handle.deliver(HubEvent::Error { message: e.to_string() });
                continue;
            }
            Err(e) => break Err(e.into()),
        };

        tracing::trace!("Connection {} -> {}", conn, request.kind());
        let command = match request {
            HubRequest::Register { identifier } => {
                claim(&mut claimed, &identifier);
                DirectoryCommand::Register { identifier, handle: handle.clone() }
            }
            HubRequest::ConnectToPeer { source_id, target_id } => {
                claim(&mut claimed, &source_id);
                DirectoryCommand::ConnectToPeer { source_id, target_id, handle: handle.clone() }
            }
            HubRequest::Unlink { source_id, target_id } => {
                DirectoryCommand::Unlink { source_id, target_id, handle: handle.clone() }
            }
            HubRequest::Forward { source_id, message } => {
                DirectoryCommand::Forward { source_id, message, handle: handle.clone() }
            }
        };
        if commands.send(command).is_err() {
            break Err(anyhow::anyhow!("directory is gone"));
        }
    };

    // Unregister is a no-op for identifiers since claimed by another connection.
    for identifier in claimed {
        let _ = commands.send(DirectoryCommand::Unregister { identifier, conn });
    }
    writer_task.abort();
    tracing::debug!("Client disconnected: {} (connection {})", addr, conn);
    result
}

/// Record `id` as claimed by this connection, once per spelling-insensitive identifier.
fn claim(claimed: &mut Vec<String>, id: &str) {
    if !claimed.iter().any(|c| identifier::matches(c, id)) {
        claimed.push(id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickshare_core::protocol::PeerMessage;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    async fn start_hub() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener));
        addr
    }

    async fn client(addr: SocketAddr) -> (OwnedReadHalf, OwnedWriteHalf) {
        TcpStream::connect(addr).await.unwrap().into_split()
    }

    async fn next(reader: &mut OwnedReadHalf) -> HubEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), read_frame(reader))
            .await
            .expect("timed out waiting for hub event")
            .unwrap()
            .expect("hub closed the connection")
    }

    async fn register(addr: SocketAddr, id: &str) -> (OwnedReadHalf, OwnedWriteHalf) {
        let (mut r, mut w) = client(addr).await;
        write_frame(&mut w, &HubRequest::Register { identifier: id.into() }).await.unwrap();
        assert_eq!(next(&mut r).await, HubEvent::Registered { identifier: id.into() });
        (r, w)
    }

    #[tokio::test]
    async fn test_link_forward_and_disconnect_over_tcp() {
        let addr = start_hub().await;
        let (mut a_r, mut a_w) = register(addr, "node-a").await;
        let (mut b_r, b_w) = register(addr, "NODE-B").await;

        write_frame(
            &mut a_w,
            &HubRequest::ConnectToPeer { source_id: "node-a".into(), target_id: "node-b".into() },
        )
        .await
        .unwrap();
        assert_eq!(next(&mut a_r).await, HubEvent::PeerConnected { peer_id: "NODE-B".into() });
        assert_eq!(next(&mut b_r).await, HubEvent::PeerConnected { peer_id: "node-a".into() });

        let message = PeerMessage::FileEnd { file_id: "f1".into(), file_name: "a.txt".into() };
        write_frame(&mut a_w, &HubRequest::Forward { source_id: "node-a".into(), message: message.clone() })
            .await
            .unwrap();
        assert_eq!(
            next(&mut b_r).await,
            HubEvent::Forwarded { source_id: "node-a".into(), message }
        );

        drop(b_w);
        drop(b_r);
        assert_eq!(next(&mut a_r).await, HubEvent::PeerDisconnected { peer_id: "NODE-B".into() });
    }

    #[tokio::test]
    async fn test_unknown_target_and_garbage_frames() {
        let addr = start_hub().await;
        let (mut a_r, mut a_w) = register(addr, "node-a").await;

        quickshare_core::codec::write_lp(&mut a_w, &[0xff, 0xfe, 0xfd]).await.unwrap();
        assert!(matches!(next(&mut a_r).await, HubEvent::Error { .. }));

        write_frame(
            &mut a_w,
            &HubRequest::ConnectToPeer { source_id: "node-a".into(), target_id: "nobody".into() },
        )
        .await
        .unwrap();
        assert!(matches!(next(&mut a_r).await, HubEvent::PeerNotFound { target_id, .. } if target_id == "nobody"));
    }

    #[test]
    fn test_claims_recorded_once_per_identifier() {
        let mut claimed = Vec::new();
        claim(&mut claimed, "node-a");
        for _ in 0..1000 {
            claim(&mut claimed, "node-a");
            claim(&mut claimed, " NODE-A ");
        }
        claim(&mut claimed, "node-b");
        assert_eq!(claimed, vec!["node-a".to_string(), "node-b".to_string()]);
    }

    #[tokio::test]
    async fn test_repeated_links_still_released_on_disconnect() {
        let addr = start_hub().await;
        let (mut a_r, a_w) = register(addr, "node-a").await;
        let (mut b_r, mut b_w) = register(addr, "node-b").await;

        for _ in 0..50 {
            write_frame(
                &mut b_w,
                &HubRequest::ConnectToPeer { source_id: "NODE-B".into(), target_id: "node-a".into() },
            )
            .await
            .unwrap();
        }
        assert_eq!(next(&mut b_r).await, HubEvent::PeerConnected { peer_id: "node-a".into() });
        assert_eq!(next(&mut a_r).await, HubEvent::PeerConnected { peer_id: "node-b".into() });

        drop(b_w);
        drop(b_r);
        assert_eq!(next(&mut a_r).await, HubEvent::PeerDisconnected { peer_id: "node-b".into() });
        drop(a_w);
    }
}
