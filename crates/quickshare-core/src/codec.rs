//! Length-prefixed framing (u32 BE length) with bincode bodies.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    /// The body is not one of the known message kinds. Framing is intact,
    /// so the stream can keep being read.
    #[error("unrecognised message: {0}")]
    Decode(#[from] bincode::Error),
}

impl CodecError {
    /// Whether the stream is still usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::Decode(_))
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, CodecError> {
    Ok(bincode::deserialize(body)?)
}

/// Write one raw frame.
pub async fn write_lp<T: AsyncWrite + Unpin + Send>(
    transport: &mut T,
    data: &[u8]
) -> Result<(), CodecError> {
    if data.len() > MAX_FRAME_LEN {
        return Err(CodecError::TooLarge(data.len()));
    }
    transport.write_all(&(data.len() as u32).to_be_bytes()).await?;
    transport.write_all(data).await?;
    transport.flush().await?;
    Ok(())
}

/// Read one raw frame. `Ok(None)` on a clean end of stream.
pub async fn read_lp<T: AsyncRead + Unpin + Send>(
    transport: &mut T
) -> Result<Option<Vec<u8>>, CodecError> {
    let mut lenb = [0u8; 4];
    match transport.read_exact(&mut lenb).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(lenb) as usize;

    if len > MAX_FRAME_LEN {
        return Err(CodecError::TooLarge(len));
    }

    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<T, M>(transport: &mut T, message: &M) -> Result<(), CodecError>
where
    T: AsyncWrite + Unpin + Send,
    M: Serialize,
{
    let body = encode(message)?;
    write_lp(transport, &body).await
}

/// Read and decode one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<T, M>(transport: &mut T) -> Result<Option<M>, CodecError>
where
    T: AsyncRead + Unpin + Send,
    M: DeserializeOwned,
{
    match read_lp(transport).await? {
        Some(body) => decode(&body).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HubEvent, HubRequest, PeerMessage};

    #[tokio::test]
    async fn test_frames_over_duplex() -> Result<(), CodecError> {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        let chunk = PeerMessage::FileChunk {
            file_id: "f".into(),
            chunk_index: 2,
            total_chunks: 3,
            chunk: vec![7u8; 7232],
        };
        write_frame(&mut a, &HubRequest::Forward { source_id: "node-a".into(), message: chunk.clone() }).await?;
        write_frame(&mut a, &HubRequest::Register { identifier: "node-a".into() }).await?;
        drop(a);

        let first: Option<HubRequest> = read_frame(&mut b).await?;
        assert_eq!(first, Some(HubRequest::Forward { source_id: "node-a".into(), message: chunk }));
        let second: Option<HubRequest> = read_frame(&mut b).await?;
        assert_eq!(second, Some(HubRequest::Register { identifier: "node-a".into() }));
        let end: Option<HubRequest> = read_frame(&mut b).await?;
        assert_eq!(end, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected_and_stream_survives() -> Result<(), CodecError> {
        let (mut a, mut b) = tokio::io::duplex(1024);

        // Variant index far beyond the known kinds.
        write_lp(&mut a, &[0xff, 0, 0, 0]).await?;
        write_frame(&mut a, &HubEvent::Error { message: "x".into() }).await?;

        let err = read_frame::<_, HubEvent>(&mut b).await.unwrap_err();
        assert!(err.is_recoverable());

        let next: Option<HubEvent> = read_frame(&mut b).await?;
        assert_eq!(next, Some(HubEvent::Error { message: "x".into() }));
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes()).await.unwrap();

        let err = read_lp(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::TooLarge(_)));
        assert!(!err.is_recoverable());
    }
}
