//! Byte-stream abstraction shared by control and work connections.
//!
//! Control and work connections may be plain TCP sockets, TLS sessions or
//! multiplexed streams; everything downstream only needs the combined
//! read/write capability.

use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream usable as a control or work connection.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

impl std::fmt::Debug for dyn ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ByteStream")
    }
}

/// Owned, type-erased byte stream.
pub type BoxedStream = Box<dyn ByteStream>;
