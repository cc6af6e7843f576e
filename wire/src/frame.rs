//! Binary framing: a 4-byte unsigned big-endian length followed by that many
//! bytes of UTF-8 JSON. One frame per direction per connection.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame. Requests and responses are short by contract;
/// anything larger is a protocol violation, not a big message.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    MessageTooLarge(usize),
    #[error("zero-length frame")]
    EmptyMessage,
    #[error("stream ended after {read} of {expected} frame bytes")]
    Truncated { read: usize, expected: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one frame. The payload is read with a loop so short reads on the
/// vsock stream are satisfied; EOF mid-frame is `Truncated`.
pub async fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 {
        return Err(FrameError::EmptyMessage);
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::MessageTooLarge(len));
    }
    let mut buffer = vec![0u8; len];
    let mut read = 0;
    while read < len {
        let n = stream.read(&mut buffer[read..]).await?;
        if n == 0 {
            return Err(FrameError::Truncated { read, expected: len });
        }
        read += n;
    }
    Ok(buffer)
}

/// Write one frame. Size checks happen before any byte reaches the stream.
pub async fn write_frame<W>(stream: &mut W, msg: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if msg.is_empty() {
        return Err(FrameError::EmptyMessage);
    }
    if msg.len() > MAX_FRAME_LEN {
        return Err(FrameError::MessageTooLarge(msg.len()));
    }
    let len_bytes = (msg.len() as u32).to_be_bytes();
    stream.write_all(&len_bytes).await?;
    stream.write_all(msg).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[tokio::test]
    async fn test_roundtrip() -> Result<()> {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let payload = br#"{"id":"req-1","url":"https://ec.europa.eu/x"}"#;
        write_frame(&mut a, payload).await?;
        let read = read_frame(&mut b).await?;
        assert_eq!(read, payload);
        Ok(())
    }

    #[tokio::test]
    async fn test_roundtrip_larger_than_buffer() -> Result<()> {
        // Frame larger than the duplex buffer forces short reads and writes.
        let (mut a, mut b) = tokio::io::duplex(64);
        let payload = vec![b'x'; 10_000];
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                write_frame(&mut a, &payload).await?;
                Ok::<_, FrameError>(())
            })
        };
        let read = read_frame(&mut b).await?;
        writer.await??;
        assert_eq!(read, payload);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_empty_rejected() {
        let (mut a, _b) = tokio::io::duplex(64);
        let err = write_frame(&mut a, b"").await.unwrap_err();
        assert!(matches!(err, FrameError::EmptyMessage));
    }

    #[tokio::test]
    async fn test_write_oversized_rejected_before_any_byte() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        let err = write_frame(&mut a, &payload).await.unwrap_err();
        assert!(matches!(err, FrameError::MessageTooLarge(_)));
        // Nothing was written: dropping the writer yields EOF on the reader.
        drop(a);
        let read_err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(read_err, FrameError::Io(_)));
    }

    #[tokio::test]
    async fn test_read_oversized_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        a.write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::MessageTooLarge(_)));
    }

    #[tokio::test]
    async fn test_read_zero_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        a.write_all(&0u32.to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::EmptyMessage));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        match err {
            FrameError::Truncated { read, expected } => {
                assert_eq!(read, 3);
                assert_eq!(expected, 8);
            }
            other => panic!("expected Truncated, got {other}"),
        }
    }
}
