//! Stream multiplexing over a single connection.
//!
//! When `tcp_mux` is enabled, client and server speak this frame protocol
//! over the one TCP connection: the client's first opened stream carries the
//! control channel and every further stream carries one work connection.
//! Idle sessions are kept alive by a 20-second ping.

mod frame;
mod session;
mod stream;

pub use frame::{Frame, FrameType, MuxError};
pub use session::{MuxSession, KEEPALIVE_INTERVAL};
pub use stream::MuxStream;
