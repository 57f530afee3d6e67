//! Token-keyed encrypted stream wrapper.
//!
//! The control connection switches to this wrapper right after the
//! plaintext login exchange: an AES-128-CFB stream keyed by
//! PBKDF2-SHA1(token, salt), with a random IV transmitted as the first 16
//! bytes in each direction. Work connections stay plaintext.

use aes::Aes128;
use bytes::{Buf, BytesMut};
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha1::Sha1;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type Encryptor = BufEncryptor<Aes128>;
type Decryptor = BufDecryptor<Aes128>;

/// Process-wide key-derivation salt. Both ends must agree on it.
pub const DEFAULT_SALT: &str = "burrow";

const KEY_LEN: usize = 16;
const IV_LEN: usize = 16;
const PBKDF2_ROUNDS: u32 = 64;

/// Derive the AES key for `token` with the default salt.
pub fn derive_key(token: &str) -> [u8; KEY_LEN] {
    derive_key_with_salt(token, DEFAULT_SALT)
}

pub fn derive_key_with_salt(token: &str, salt: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha1>(token.as_bytes(), salt.as_bytes(), PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypting [`AsyncWrite`] adapter. Emits a random IV before the first
/// ciphertext byte.
pub struct EncryptedWriter<W> {
    inner: W,
    key: [u8; KEY_LEN],
    encryptor: Option<Encryptor>,
    /// Ciphertext (and initially the IV) not yet accepted by `inner`.
    pending: BytesMut,
    /// Plaintext length already encrypted into `pending` for the write in
    /// progress; reported to the caller once `pending` drains.
    claimed: usize,
}

impl<W> EncryptedWriter<W> {
    pub fn new(inner: W, key: [u8; KEY_LEN]) -> Self {
        Self {
            inner,
            key,
            encryptor: None,
            pending: BytesMut::new(),
            claimed: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> EncryptedWriter<W> {
    fn poll_drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.pending) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "encrypted stream closed mid-write",
                    )))
                }
                Poll::Ready(Ok(n)) => self.pending.advance(n),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for EncryptedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.pending.is_empty() {
            if this.encryptor.is_none() {
                let mut iv = [0u8; IV_LEN];
                rand::thread_rng().fill_bytes(&mut iv);
                this.pending.extend_from_slice(&iv);
                this.encryptor = Some(Encryptor::new((&this.key).into(), (&iv).into()));
            }
            let mut ciphertext = buf.to_vec();
            if let Some(enc) = this.encryptor.as_mut() {
                enc.encrypt(&mut ciphertext);
            }
            this.pending.extend_from_slice(&ciphertext);
            this.claimed = buf.len();
        }

        match this.poll_drain_pending(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(std::mem::take(&mut this.claimed))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain_pending(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain_pending(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

/// Decrypting [`AsyncRead`] adapter. Consumes the peer's IV before
/// yielding any plaintext.
pub struct EncryptedReader<R> {
    inner: R,
    key: [u8; KEY_LEN],
    decryptor: Option<Decryptor>,
    iv: [u8; IV_LEN],
    iv_filled: usize,
}

impl<R> EncryptedReader<R> {
    pub fn new(inner: R, key: [u8; KEY_LEN]) -> Self {
        Self {
            inner,
            key,
            decryptor: None,
            iv: [0u8; IV_LEN],
            iv_filled: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EncryptedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.decryptor.is_none() {
            let mut iv_buf = ReadBuf::new(&mut this.iv[this.iv_filled..]);
            match Pin::new(&mut this.inner).poll_read(cx, &mut iv_buf) {
                Poll::Ready(Ok(())) => {
                    let n = iv_buf.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed before iv was received",
                        )));
                    }
                    this.iv_filled += n;
                    if this.iv_filled == IV_LEN {
                        this.decryptor =
                            Some(Decryptor::new((&this.key).into(), (&this.iv).into()));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        let already_filled = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled_mut();
                if filled.len() > already_filled {
                    if let Some(dec) = this.decryptor.as_mut() {
                        dec.decrypt(&mut filled[already_filled..]);
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_round_trip() {
        let key = derive_key("secret-token");
        let (client, server) = tokio::io::duplex(4096);

        let mut writer = EncryptedWriter::new(client, key);
        let mut reader = EncryptedReader::new(server, key);

        writer.write_all(b"hello through the tunnel").await.unwrap();
        writer.flush().await.unwrap();

        let mut got = [0u8; 24];
        reader.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello through the tunnel");
    }

    #[tokio::test]
    async fn test_multiple_writes_decrypt_in_order() {
        let key = derive_key("secret-token");
        let (client, server) = tokio::io::duplex(4096);

        let mut writer = EncryptedWriter::new(client, key);
        let mut reader = EncryptedReader::new(server, key);

        writer.write_all(b"first ").await.unwrap();
        writer.write_all(b"second").await.unwrap();
        writer.flush().await.unwrap();

        let mut got = [0u8; 12];
        reader.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"first second");
    }

    #[tokio::test]
    async fn test_ciphertext_differs_from_plaintext() {
        let key = derive_key("secret-token");
        let (client, mut server) = tokio::io::duplex(4096);

        let mut writer = EncryptedWriter::new(client, key);
        writer.write_all(b"plaintext-payload").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        // IV plus ciphertext, and the ciphertext is not the plaintext.
        assert_eq!(raw.len(), IV_LEN + b"plaintext-payload".len());
        assert_ne!(&raw[IV_LEN..], b"plaintext-payload");
    }

    #[tokio::test]
    async fn test_wrong_key_garbles() {
        let (client, server) = tokio::io::duplex(4096);

        let mut writer = EncryptedWriter::new(client, derive_key("token-a"));
        let mut reader = EncryptedReader::new(server, derive_key("token-b"));

        writer.write_all(b"confidential").await.unwrap();
        writer.flush().await.unwrap();

        let mut got = [0u8; 12];
        reader.read_exact(&mut got).await.unwrap();
        assert_ne!(&got, b"confidential");
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        assert_eq!(derive_key("tok"), derive_key("tok"));
        assert_ne!(derive_key("tok"), derive_key("kot"));
        assert_ne!(
            derive_key_with_salt("tok", "a"),
            derive_key_with_salt("tok", "b")
        );
    }
}
