//! Authenticated, encrypted session layer
//!
//! When a server password is configured, every accepted TCP connection must
//! complete this handshake before its first protocol byte is interpreted:
//!
//! 1. Client sends the 5-byte magic `eVI1\0`, a 32-byte client nonce, and
//!    `HMAC-SHA256(key, "VIIPER-Auth-v1" || client_nonce)`.
//! 2. The server verifies the HMAC against
//!    `key = PBKDF2-HMAC-SHA256(password, "VIIPER-Key-v1", 100000, 32)`.
//!    On failure it writes an RFC 7807 problem in plaintext and closes; on
//!    success it replies `OK\0` followed by a 32-byte server nonce.
//! 3. Both sides derive
//!    `session_key = SHA-256(key || server_nonce || client_nonce || "VIIPER-Session-v1")`.
//!
//! All subsequent bytes are length-prefixed AEAD packets: a 4-byte
//! big-endian length, a 12-byte nonce (4 zero bytes, then the big-endian
//! 64-bit send counter), the ChaCha20-Poly1305 ciphertext and its 16-byte
//! tag. The length field covers everything after itself and is capped at
//! 2 MiB; counters are per direction, start at 0 and must never wrap.
//!
//! The layer is exposed as a split reader/writer pair so the management,
//! stream and USB/IP protocols above it are written as if over a plain
//! socket.

use crate::error::{Error, Result};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hmac::{Hmac, Mac};
use protocol::Problem;
use sha2::{Digest, Sha256};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Handshake magic sent by the client
pub const HANDSHAKE_MAGIC: [u8; 5] = *b"eVI1\0";
/// Server reply on successful authentication
const OK_REPLY: [u8; 3] = *b"OK\0";

const AUTH_CONTEXT: &[u8] = b"VIIPER-Auth-v1";
const KEY_SALT: &[u8] = b"VIIPER-Key-v1";
const SESSION_CONTEXT: &[u8] = b"VIIPER-Session-v1";

/// PBKDF2 iteration count for the password-derived key
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Maximum AEAD packet length (the value of the 4-byte length field)
pub const MAX_PACKET_SIZE: usize = 2 * 1024 * 1024;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Largest plaintext that fits one packet
const MAX_PLAINTEXT: usize = MAX_PACKET_SIZE - NONCE_LEN - TAG_LEN;

fn crypto_err(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.to_string())
}

/// Password-derived authentication material, computed once at startup.
#[derive(Clone)]
pub struct SessionAuth {
    key: [u8; 32],
}

impl SessionAuth {
    /// Derive the handshake key from the server password.
    pub fn from_password(password: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            KEY_SALT,
            PBKDF2_ITERATIONS,
            &mut key,
        );
        Self { key }
    }

    /// HMAC proving knowledge of the key for a given client nonce.
    pub fn auth_tag(&self, client_nonce: &[u8; 32]) -> [u8; 32] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(AUTH_CONTEXT);
        mac.update(client_nonce);
        mac.finalize().into_bytes().into()
    }

    fn verify_auth_tag(&self, client_nonce: &[u8; 32], tag: &[u8; 32]) -> bool {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(AUTH_CONTEXT);
        mac.update(client_nonce);
        mac.verify_slice(tag).is_ok()
    }

    /// Per-connection AEAD key derived from both nonces.
    pub fn session_key(&self, server_nonce: &[u8; 32], client_nonce: &[u8; 32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(server_nonce);
        hasher.update(client_nonce);
        hasher.update(SESSION_CONTEXT);
        hasher.finalize().into()
    }
}

fn nonce_bytes(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

enum ReaderInner {
    Plain(OwnedReadHalf),
    Sealed {
        half: OwnedReadHalf,
        cipher: ChaCha20Poly1305,
        counter: u64,
    },
}

/// Read half of a session transport
pub struct SecureReader {
    inner: ReaderInner,
    buf: Vec<u8>,
    pos: usize,
}

impl std::fmt::Debug for SecureReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureReader").finish_non_exhaustive()
    }
}

enum WriterInner {
    Plain(OwnedWriteHalf),
    Sealed {
        half: OwnedWriteHalf,
        cipher: ChaCha20Poly1305,
        counter: u64,
    },
}

/// Write half of a session transport
pub struct SecureWriter {
    inner: WriterInner,
}

impl std::fmt::Debug for SecureWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureWriter").finish_non_exhaustive()
    }
}

impl SecureReader {
    fn plain(half: OwnedReadHalf) -> Self {
        Self {
            inner: ReaderInner::Plain(half),
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn sealed(half: OwnedReadHalf, key: &[u8; 32]) -> Self {
        Self {
            inner: ReaderInner::Sealed {
                half,
                cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
                counter: 0,
            },
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Refill the plaintext buffer from the transport. Returns false on
    /// clean EOF. May legitimately buffer nothing (an empty AEAD packet)
    /// while the stream is still open.
    async fn fill(&mut self) -> io::Result<bool> {
        self.buf.clear();
        self.pos = 0;
        match &mut self.inner {
            ReaderInner::Plain(half) => {
                let mut tmp = [0u8; 8192];
                let n = half.read(&mut tmp).await?;
                if n == 0 {
                    return Ok(false);
                }
                self.buf.extend_from_slice(&tmp[..n]);
                Ok(true)
            }
            ReaderInner::Sealed {
                half,
                cipher,
                counter,
            } => {
                let mut len_bytes = [0u8; 4];
                if !read_exact_or_eof(half, &mut len_bytes).await? {
                    return Ok(false);
                }
                let len = u32::from_be_bytes(len_bytes) as usize;
                if len > MAX_PACKET_SIZE {
                    return Err(crypto_err("AEAD packet exceeds 2 MiB limit"));
                }
                if len < NONCE_LEN + TAG_LEN {
                    return Err(crypto_err("AEAD packet shorter than nonce and tag"));
                }
                let mut packet = vec![0u8; len];
                half.read_exact(&mut packet).await?;

                let expected = nonce_bytes(*counter);
                if packet[..NONCE_LEN] != expected {
                    return Err(crypto_err("AEAD nonce counter mismatch"));
                }
                let plaintext = cipher
                    .decrypt(Nonce::from_slice(&expected), &packet[NONCE_LEN..])
                    .map_err(|_| crypto_err("AEAD packet authentication failed"))?;
                *counter = counter
                    .checked_add(1)
                    .ok_or_else(|| crypto_err("AEAD receive counter exhausted"))?;
                self.buf = plaintext;
                Ok(true)
            }
        }
    }

    /// Read up to `out.len()` plaintext bytes. Returns 0 on clean EOF.
    pub async fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.buffered() == 0 {
            if !self.fill().await? {
                return Ok(0);
            }
        }
        let n = self.buffered().min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    /// Read exactly `out.len()` bytes, failing on early EOF.
    pub async fn read_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read(&mut out[filled..]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ));
            }
            filled += n;
        }
        Ok(())
    }

    /// Read bytes up to (and consuming) a NUL terminator.
    ///
    /// Returns `None` on clean EOF before any byte. Fails if `max` bytes
    /// arrive without a terminator.
    pub async fn read_until_nul(&mut self, max: usize) -> io::Result<Option<Vec<u8>>> {
        let mut frame = Vec::new();
        loop {
            if self.buffered() == 0 && !self.fill().await? {
                if frame.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before frame terminator",
                ));
            }
            let chunk = &self.buf[self.pos..];
            if let Some(idx) = chunk.iter().position(|&b| b == 0) {
                frame.extend_from_slice(&chunk[..idx]);
                self.pos += idx + 1;
                return Ok(Some(frame));
            }
            frame.extend_from_slice(chunk);
            self.pos = self.buf.len();
            if frame.len() >= max {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "frame exceeds maximum size",
                ));
            }
        }
    }
}

/// read_exact that reports a clean EOF before the first byte as `Ok(false)`.
async fn read_exact_or_eof(half: &mut OwnedReadHalf, out: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < out.len() {
        let n = half.read(&mut out[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-packet",
            ));
        }
        filled += n;
    }
    Ok(true)
}

impl SecureWriter {
    fn plain(half: OwnedWriteHalf) -> Self {
        Self {
            inner: WriterInner::Plain(half),
        }
    }

    fn sealed(half: OwnedWriteHalf, key: &[u8; 32]) -> Self {
        Self {
            inner: WriterInner::Sealed {
                half,
                cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
                counter: 0,
            },
        }
    }

    /// Write the whole buffer, sealing it into AEAD packets as needed.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.inner {
            WriterInner::Plain(half) => half.write_all(data).await,
            WriterInner::Sealed {
                half,
                cipher,
                counter,
            } => {
                for chunk in data.chunks(MAX_PLAINTEXT) {
                    let nonce = nonce_bytes(*counter);
                    let ciphertext = cipher
                        .encrypt(Nonce::from_slice(&nonce), chunk)
                        .map_err(|_| crypto_err("AEAD seal failed"))?;
                    let len = (NONCE_LEN + ciphertext.len()) as u32;
                    half.write_all(&len.to_be_bytes()).await?;
                    half.write_all(&nonce).await?;
                    half.write_all(&ciphertext).await?;
                    *counter = counter
                        .checked_add(1)
                        .ok_or_else(|| crypto_err("AEAD send counter exhausted"))?;
                }
                Ok(())
            }
        }
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            WriterInner::Plain(half) => half.flush().await,
            WriterInner::Sealed { half, .. } => half.flush().await,
        }
    }

    /// Flush and shut down the write direction.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        match &mut self.inner {
            WriterInner::Plain(half) => half.shutdown().await,
            WriterInner::Sealed { half, .. } => half.shutdown().await,
        }
    }
}

/// Server side of session establishment.
///
/// With `auth` set, drives the authenticated handshake; a failed handshake
/// writes a plaintext RFC 7807 problem before returning the error. With
/// `auth` unset the connection passes through unmodified.
pub async fn establish_server(
    stream: TcpStream,
    auth: Option<&SessionAuth>,
) -> Result<(SecureReader, SecureWriter)> {
    let (read_half, mut write_half) = stream.into_split();
    let Some(auth) = auth else {
        return Ok((SecureReader::plain(read_half), SecureWriter::plain(write_half)));
    };

    let mut read_half = read_half;
    let mut hello = [0u8; 5 + 32 + 32];
    if let Err(e) = read_half.read_exact(&mut hello).await {
        return Err(Error::Auth(format!("handshake not received: {}", e)));
    }

    if hello[..5] != HANDSHAKE_MAGIC {
        reject(&mut write_half, "bad handshake magic").await;
        return Err(Error::Auth("bad handshake magic".into()));
    }
    let mut client_nonce = [0u8; 32];
    client_nonce.copy_from_slice(&hello[5..37]);
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&hello[37..69]);

    if !auth.verify_auth_tag(&client_nonce, &tag) {
        warn!("Rejected connection: authentication proof did not verify");
        reject(&mut write_half, "authentication failed").await;
        return Err(Error::Auth("authentication proof did not verify".into()));
    }

    let mut server_nonce = [0u8; 32];
    rand::Rng::fill(&mut rand::rng(), &mut server_nonce[..]);

    write_half.write_all(&OK_REPLY).await?;
    write_half.write_all(&server_nonce).await?;
    write_half.flush().await?;

    let session_key = auth.session_key(&server_nonce, &client_nonce);
    debug!("Session established");
    Ok((
        SecureReader::sealed(read_half, &session_key),
        SecureWriter::sealed(write_half, &session_key),
    ))
}

/// Client side of session establishment. Counterpart of
/// [`establish_server`]; used by tests and client tooling.
pub async fn establish_client(
    stream: TcpStream,
    auth: Option<&SessionAuth>,
) -> Result<(SecureReader, SecureWriter)> {
    let (read_half, write_half) = stream.into_split();
    let Some(auth) = auth else {
        return Ok((SecureReader::plain(read_half), SecureWriter::plain(write_half)));
    };

    let mut read_half = read_half;
    let mut write_half = write_half;

    let mut client_nonce = [0u8; 32];
    rand::Rng::fill(&mut rand::rng(), &mut client_nonce[..]);
    let tag = auth.auth_tag(&client_nonce);

    write_half.write_all(&HANDSHAKE_MAGIC).await?;
    write_half.write_all(&client_nonce).await?;
    write_half.write_all(&tag).await?;
    write_half.flush().await?;

    let mut reply = [0u8; 3];
    read_half
        .read_exact(&mut reply)
        .await
        .map_err(|e| Error::Auth(format!("no handshake reply: {}", e)))?;
    if reply != OK_REPLY {
        // The server wrote a problem document instead; salvage what we can.
        let mut rest = Vec::new();
        let _ = read_half.read_to_end(&mut rest).await;
        let mut body = reply.to_vec();
        body.extend_from_slice(&rest);
        let detail = String::from_utf8_lossy(&body).trim().to_string();
        return Err(Error::Auth(detail));
    }

    let mut server_nonce = [0u8; 32];
    read_half
        .read_exact(&mut server_nonce)
        .await
        .map_err(|e| Error::Auth(format!("truncated handshake reply: {}", e)))?;

    let session_key = auth.session_key(&server_nonce, &client_nonce);
    Ok((
        SecureReader::sealed(read_half, &session_key),
        SecureWriter::sealed(write_half, &session_key),
    ))
}

async fn reject(half: &mut OwnedWriteHalf, detail: &str) {
    let problem = Problem::unauthorized(detail);
    if let Ok(mut line) = serde_json::to_vec(&problem) {
        line.push(b'\n');
        let _ = half.write_all(&line).await;
        let _ = half.flush().await;
    }
}
