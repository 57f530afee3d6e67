//! Wire protocol for the burrow control channel.
//!
//! Everything that crosses the control connection is a [`Message`] framed by
//! [`MessageCodec`]: a 4-byte big-endian length prefix followed by a JSON
//! body. Work connections carry a single plaintext handshake message each
//! way before switching to raw relayed bytes.

mod codec;
mod messages;
mod stream;

pub use codec::{read_message, write_message, CodecError, MessageCodec};
pub use messages::{
    CloseProxy, Login, LoginResp, Message, NewProxy, NewProxyResp, NewWorkConn, Ping, Pong,
    ProxyType, StartWorkConn,
};
pub use stream::{ByteStream, BoxedStream};
