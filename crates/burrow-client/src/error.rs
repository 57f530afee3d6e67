//! Client-side error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] burrow_proto::CodecError),

    #[error("mux error: {0}")]
    Mux(#[from] burrow_mux::MuxError),

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("timed out waiting for login response")]
    LoginTimeout,

    #[error("http proxy handshake failed: {0}")]
    HttpProxy(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("session closed")]
    SessionClosed,
}
