//! Length-prefixed JSON framing for [`Message`]

use crate::messages::Message;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message framing: `[length: u32 BE][payload: JSON message]`.
pub struct MessageCodec;

impl MessageCodec {
    /// Maximum framed payload size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Encode a message into a single frame.
    pub fn encode(msg: &Message) -> Result<Bytes, CodecError> {
        let payload = serde_json::to_vec(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one message from the front of `buf`.
    ///
    /// Returns `Ok(Some(message))` when a complete frame was consumed,
    /// `Ok(None)` when more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);
        let msg: Message = serde_json::from_slice(&msg_bytes)?;

        Ok(Some(msg))
    }
}

/// Write one framed message to `writer` and flush it.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = MessageCodec::encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message from `reader`.
///
/// A clean EOF at a frame boundary maps to [`CodecError::ConnectionClosed`].
pub async fn read_message<R>(reader: &mut R) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(CodecError::ConnectionClosed);
        }
        return Err(CodecError::Io(e));
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MessageCodec::MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    let msg: Message = serde_json::from_slice(&payload)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Pong;

    #[test]
    fn test_encode_decode() {
        let msg = Message::Pong(Pong {
            error: String::new(),
        });

        let encoded = MessageCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded = MessageCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = Message::ReqWorkConn;
        let encoded = MessageCodec::encode(&msg).unwrap();

        // Only the length header available yet.
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(MessageCodec::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(MessageCodec::decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        buf.extend_from_slice(b"garbage");
        assert!(matches!(
            MessageCodec::decode(&mut buf),
            Err(CodecError::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let msg = Message::NewProxyResp(crate::messages::NewProxyResp {
            proxy_name: "web".to_string(),
            remote_addr: ":6000".to_string(),
            error: String::new(),
        });

        write_message(&mut a, &msg).await.unwrap();
        let got = read_message(&mut b).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_read_reports_clean_close() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_message(&mut b).await,
            Err(CodecError::ConnectionClosed)
        ));
    }
}
