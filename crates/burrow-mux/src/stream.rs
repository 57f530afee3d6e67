//! Per-stream byte handles over a mux session.

use crate::frame::Frame;
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// One logical byte stream inside a [`crate::MuxSession`].
///
/// Reads are fed by the session's demux loop; writes become data frames on
/// the shared connection. Dropping the handle closes the stream.
pub struct MuxStream {
    stream_id: u32,
    out_tx: mpsc::UnboundedSender<Frame>,
    in_rx: mpsc::UnboundedReceiver<Bytes>,
    read_buf: Bytes,
    write_closed: bool,
}

impl MuxStream {
    pub(crate) fn new(
        stream_id: u32,
        out_tx: mpsc::UnboundedSender<Frame>,
        in_rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            stream_id,
            out_tx,
            in_rx,
            read_buf: Bytes::new(),
            write_closed: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    fn send_close(&mut self) {
        if !self.write_closed {
            self.write_closed = true;
            let _ = self.out_tx.send(Frame::close(self.stream_id));
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            match this.in_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.read_buf = chunk,
                // Sender gone: stream closed by peer or session over.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        let n = buf.len().min(Frame::MAX_PAYLOAD);
        let frame = Frame::data(this.stream_id, Bytes::copy_from_slice(&buf[..n]));
        if this.out_tx.send(frame).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().send_close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.send_close();
    }
}
