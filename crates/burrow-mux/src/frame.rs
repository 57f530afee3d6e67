//! Mux frame layout: `[stream_id: u32][type: u8][length: u32][payload]`.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("session closed")]
    SessionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Peer opened a new stream.
    Open,
    Data,
    /// Peer finished writing to a stream.
    Close,
    Ping,
    Pong,
}

impl FrameType {
    fn as_u8(self) -> u8 {
        match self {
            FrameType::Open => 0,
            FrameType::Data => 1,
            FrameType::Close => 2,
            FrameType::Ping => 3,
            FrameType::Pong => 4,
        }
    }

    fn from_u8(v: u8) -> Result<Self, MuxError> {
        match v {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::Ping),
            4 => Ok(FrameType::Pong),
            other => Err(MuxError::UnknownFrameType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream_id: u32,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Largest accepted payload. Writers chunk at this size.
    pub const MAX_PAYLOAD: usize = 64 * 1024;

    pub fn open(stream_id: u32) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Open,
            payload: Bytes::new(),
        }
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Data,
            payload,
        }
    }

    pub fn close(stream_id: u32) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Close,
            payload: Bytes::new(),
        }
    }

    pub fn ping() -> Self {
        Self {
            stream_id: 0,
            frame_type: FrameType::Ping,
            payload: Bytes::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            stream_id: 0,
            frame_type: FrameType::Pong,
            payload: Bytes::new(),
        }
    }
}

pub(crate) async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), MuxError>
where
    W: AsyncWrite + Unpin,
{
    if frame.payload.len() > Frame::MAX_PAYLOAD {
        return Err(MuxError::FrameTooLarge(frame.payload.len()));
    }
    writer.write_u32(frame.stream_id).await?;
    writer.write_u8(frame.frame_type.as_u8()).await?;
    writer.write_u32(frame.payload.len() as u32).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Frame, MuxError>
where
    R: AsyncRead + Unpin,
{
    let stream_id = reader.read_u32().await?;
    let frame_type = FrameType::from_u8(reader.read_u8().await?)?;
    let length = reader.read_u32().await? as usize;
    if length > Frame::MAX_PAYLOAD {
        return Err(MuxError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        stream_id,
        frame_type,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = Frame::data(7, Bytes::from_static(b"payload"));

        write_frame(&mut a, &frame).await.unwrap();
        let got = read_frame(&mut b).await.unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn test_control_frames_have_empty_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &Frame::ping()).await.unwrap();
        let got = read_frame(&mut b).await.unwrap();
        assert_eq!(got.frame_type, FrameType::Ping);
        assert!(got.payload.is_empty());
    }

    #[test]
    fn test_unknown_frame_type() {
        assert!(FrameType::from_u8(9).is_err());
    }
}
