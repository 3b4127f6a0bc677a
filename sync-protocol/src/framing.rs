//! Length-prefixed frame codec shared by the primary's transport server and
//! the agent's session client.
//!
//! Wire shape: a `u32be` length prefix followed by that many bytes of
//! payload. The payload is either a UTF-8 JSON object (a [`Message`](crate::message::Message))
//! or a raw block of bytes, depending on protocol state — the framing layer
//! itself does not distinguish the two, callers drive that based on what
//! they just sent or are expecting to receive.

use crate::error::{ProtocolError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Frames larger than this are a protocol error; the connection is closed.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Read one length-prefixed frame, returning its raw payload bytes.
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(len, MAX_FRAME_BYTES));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one length-prefixed frame from raw payload bytes.
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let len = payload.len();
    if len as u64 > MAX_FRAME_BYTES as u64 {
        return Err(ProtocolError::FrameTooLarge(len as u32, MAX_FRAME_BYTES));
    }
    writer.write_all(&(len as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read a frame and parse it as a JSON-encoded [`crate::message::Message`].
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<crate::message::Message> {
    let payload = read_frame(reader).await?;
    let msg = serde_json::from_slice(&payload)?;
    Ok(msg)
}

/// Serialize a message to JSON and write it as a frame.
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &crate::message::Message,
) -> Result<()> {
    let payload = serde_json::to_vec(msg)?;
    write_frame(writer, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn round_trips_a_json_message() {
        let mut buf = Vec::new();
        let msg = Message::SyncStart {
            task_id: "t-1".into(),
        };
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_message(&mut cursor).await.unwrap();
        match decoded {
            Message::SyncStart { task_id } => assert_eq!(task_id, "t-1"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn round_trips_a_raw_frame() {
        let mut buf = Vec::new();
        let payload = vec![1u8, 2, 3, 4, 5];
        write_frame(&mut buf, &payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn rejects_oversize_frames() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_, _)));
    }

    #[tokio::test]
    async fn closed_connection_on_empty_read() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }
}
