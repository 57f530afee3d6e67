//! Multiplexed session: many logical byte streams over one connection.

use crate::frame::{read_frame, write_frame, Frame, FrameType, MuxError};
use crate::stream::MuxStream;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Interval between keepalive pings on an otherwise idle session.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

type StreamMap = Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<Bytes>>>>;

/// One end of a multiplexed connection.
///
/// The client end allocates odd stream ids, the server end even ones, so
/// simultaneous opens never collide.
pub struct MuxSession {
    out_tx: mpsc::UnboundedSender<Frame>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    streams: StreamMap,
    next_id: AtomicU32,
}

impl MuxSession {
    pub fn client<S>(io: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(io, 1)
    }

    pub fn server<S>(io: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(io, 2)
    }

    fn start<S>(io: S, first_id: u32) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let streams: StreamMap = Arc::new(Mutex::new(HashMap::new()));

        let session = Arc::new(Self {
            out_tx: out_tx.clone(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            streams: streams.clone(),
            next_id: AtomicU32::new(first_id),
        });

        tokio::spawn(write_loop(write_half, out_rx));
        tokio::spawn(read_loop(read_half, out_tx, accept_tx, streams));

        session
    }

    /// Open a new outbound stream.
    pub fn open_stream(&self) -> Result<MuxStream, MuxError> {
        let stream_id = self.next_id.fetch_add(2, Ordering::SeqCst);
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        if let Ok(mut streams) = self.streams.lock() {
            streams.insert(stream_id, in_tx);
        }

        self.out_tx
            .send(Frame::open(stream_id))
            .map_err(|_| MuxError::SessionClosed)?;

        trace!(stream_id, "opened mux stream");
        Ok(MuxStream::new(stream_id, self.out_tx.clone(), in_rx))
    }

    /// Wait for the peer to open a stream. `None` once the session is dead.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Number of currently routed streams.
    pub fn active_streams(&self) -> usize {
        self.streams.lock().map(|s| s.len()).unwrap_or(0)
    }
}

async fn write_loop<W>(mut write_half: W, mut out_rx: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    keepalive.tick().await;

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    debug!("mux write failed: {}", e);
                    break;
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = write_frame(&mut write_half, &Frame::ping()).await {
                    debug!("mux keepalive failed: {}", e);
                    break;
                }
            }
        }
    }
    debug!("mux write loop ended");
}

async fn read_loop<R>(
    mut read_half: R,
    out_tx: mpsc::UnboundedSender<Frame>,
    accept_tx: mpsc::UnboundedSender<MuxStream>,
    streams: StreamMap,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match read_frame(&mut read_half).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("mux session ended: {}", e);
                break;
            }
        };

        match frame.frame_type {
            FrameType::Open => {
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                if let Ok(mut map) = streams.lock() {
                    map.insert(frame.stream_id, in_tx);
                }
                let stream = MuxStream::new(frame.stream_id, out_tx.clone(), in_rx);
                if accept_tx.send(stream).is_err() {
                    // Nobody accepting; refuse the stream.
                    if let Ok(mut map) = streams.lock() {
                        map.remove(&frame.stream_id);
                    }
                    let _ = out_tx.send(Frame::close(frame.stream_id));
                }
            }
            FrameType::Data => {
                let sender = streams
                    .lock()
                    .ok()
                    .and_then(|map| map.get(&frame.stream_id).cloned());
                match sender {
                    Some(tx) => {
                        if tx.send(frame.payload).is_err() {
                            // Local side dropped the stream.
                            if let Ok(mut map) = streams.lock() {
                                map.remove(&frame.stream_id);
                            }
                            let _ = out_tx.send(Frame::close(frame.stream_id));
                        }
                    }
                    None => warn!(stream_id = frame.stream_id, "data for unknown mux stream"),
                }
            }
            FrameType::Close => {
                if let Ok(mut map) = streams.lock() {
                    // Dropping the sender delivers EOF to the reader.
                    map.remove(&frame.stream_id);
                }
                trace!(stream_id = frame.stream_id, "mux stream closed by peer");
            }
            FrameType::Ping => {
                let _ = out_tx.send(Frame::pong());
            }
            FrameType::Pong => {}
        }
    }

    // Session over: EOF every open stream and stop accepting.
    if let Ok(mut map) = streams.lock() {
        map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_open_and_accept() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let client = MuxSession::client(a);
        let server = MuxSession::server(b);

        let mut outbound = client.open_stream().unwrap();
        let mut inbound = server.accept_stream().await.unwrap();
        assert_eq!(outbound.stream_id(), inbound.stream_id());

        outbound.write_all(b"over the mux").await.unwrap();
        let mut got = [0u8; 12];
        inbound.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"over the mux");
    }

    #[tokio::test]
    async fn test_streams_are_isolated() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let client = MuxSession::client(a);
        let server = MuxSession::server(b);

        let mut s1 = client.open_stream().unwrap();
        let mut s2 = client.open_stream().unwrap();
        assert_ne!(s1.stream_id(), s2.stream_id());

        let mut r1 = server.accept_stream().await.unwrap();
        let mut r2 = server.accept_stream().await.unwrap();

        s1.write_all(b"one").await.unwrap();
        s2.write_all(b"two").await.unwrap();

        let mut b1 = [0u8; 3];
        let mut b2 = [0u8; 3];
        r1.read_exact(&mut b1).await.unwrap();
        r2.read_exact(&mut b2).await.unwrap();
        assert_eq!(&b1, b"one");
        assert_eq!(&b2, b"two");
    }

    #[tokio::test]
    async fn test_shutdown_delivers_eof() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let client = MuxSession::client(a);
        let server = MuxSession::server(b);

        let mut outbound = client.open_stream().unwrap();
        let mut inbound = server.accept_stream().await.unwrap();

        outbound.write_all(b"bye").await.unwrap();
        outbound.shutdown().await.unwrap();

        let mut got = Vec::new();
        inbound.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");
    }

    #[tokio::test]
    async fn test_bidirectional_transfer() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let client = MuxSession::client(a);
        let server = MuxSession::server(b);

        let mut outbound = client.open_stream().unwrap();
        let mut inbound = server.accept_stream().await.unwrap();

        outbound.write_all(b"ping?").await.unwrap();
        let mut got = [0u8; 5];
        inbound.read_exact(&mut got).await.unwrap();
        inbound.write_all(b"pong!").await.unwrap();
        outbound.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong!");
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let client = MuxSession::client(a);
        let server = MuxSession::server(b);

        let payload = vec![0xa5u8; Frame::MAX_PAYLOAD * 2 + 17];
        let mut outbound = client.open_stream().unwrap();
        let mut inbound = server.accept_stream().await.unwrap();

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            outbound.write_all(&payload).await.unwrap();
            outbound.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        inbound.read_to_end(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, expected);
    }
}
