//! # Secure Stream
//!
//! Mutual Noise_XX handshake over a duplex byte stream, then length-framed
//! AEAD records.
//!
//! The XX pattern authenticates both static keys and lets each side attach
//! an identity payload to its first authenticated message: the responder's
//! payload rides message 2 (`e, ee, s, es`), the initiator's rides message 3
//! (`s, se`). The payload carries `{name, user_pub}` so the remote user
//! identity is bound to the Noise static key before any envelope flows.
//!
//! ## Framing
//!
//! - Handshake messages: `u16`-be length prefix, zero length invalid.
//! - Transport records: `u32`-be length prefix, one AEAD-sealed record per
//!   frame, zero length invalid. A record larger than a single Noise
//!   message is a fatal error for the connection.

use std::sync::{Arc, Mutex};

use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, TransportState};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Canonical pattern: X25519 DH, ChaCha20-Poly1305 AEAD, BLAKE2s hash.
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Maximum size of a single Noise message (handshake or transport).
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// AEAD tag overhead per transport record.
const TAG_LEN: usize = 16;

/// Maximum plaintext that fits one transport record.
pub const MAX_RECORD_SIZE: usize = MAX_MESSAGE_SIZE - TAG_LEN;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("noise: {0}")]
    Noise(#[from] snow::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("handshake message too long")]
    HandshakeTooLong,
    #[error("record exceeds maximum frame size")]
    RecordTooLarge,
    #[error("handshake did not yield a remote static key")]
    MissingRemoteStatic,
}

fn params() -> NoiseParams {
    NOISE_PATTERN
        .parse()
        .unwrap_or_else(|_| unreachable!("pattern constant is valid"))
}

/// Generate a fresh X25519 static keypair for use as the Noise static key.
pub fn generate_static_keypair() -> Result<([u8; 32], [u8; 32]), snow::Error> {
    let keypair = Builder::new(params()).generate_keypair()?;
    let mut private = [0u8; 32];
    let mut public = [0u8; 32];
    private.copy_from_slice(&keypair.private);
    public.copy_from_slice(&keypair.public);
    Ok((private, public))
}

// ============================================================================
// Handshake framing
// ============================================================================

async fn write_handshake_msg<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &[u8],
) -> Result<(), StreamError> {
    if msg.is_empty() || msg.len() > u16::MAX as usize {
        return Err(StreamError::HandshakeTooLong);
    }
    w.write_all(&(msg.len() as u16).to_be_bytes()).await?;
    w.write_all(msg).await?;
    w.flush().await?;
    Ok(())
}

async fn read_handshake_msg<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, StreamError> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf).await?;
    let n = u16::from_be_bytes(len_buf) as usize;
    if n == 0 {
        return Err(StreamError::InvalidFrameLength);
    }
    let mut msg = vec![0u8; n];
    r.read_exact(&mut msg).await?;
    Ok(msg)
}

// ============================================================================
// Handshake
// ============================================================================

/// Result of a completed handshake: the transport-mode stream, the remote
/// side's identity payload, and the authenticated remote static key.
pub struct HandshakeOutcome<S> {
    pub stream: SecureStream<S>,
    pub remote_payload: Vec<u8>,
    pub remote_static: [u8; 32],
}

fn write_buf_for(payload: &[u8]) -> Vec<u8> {
    // Static key, ephemeral key, and tags add well under 256 bytes.
    vec![0u8; payload.len() + 256]
}

fn finish<S>(
    hs: HandshakeState,
    io: S,
    remote_payload: Vec<u8>,
) -> Result<HandshakeOutcome<S>, StreamError> {
    let remote_static: [u8; 32] = hs
        .get_remote_static()
        .and_then(|s| s.try_into().ok())
        .ok_or(StreamError::MissingRemoteStatic)?;
    let transport = hs.into_transport_mode()?;
    Ok(HandshakeOutcome {
        stream: SecureStream { io, transport },
        remote_payload,
        remote_static,
    })
}

/// Run a Noise_XX handshake as initiator, carrying `local_payload` in
/// message 3. On any error the stream is dropped and no state leaks.
pub async fn client_handshake<S>(
    mut io: S,
    static_private: &[u8; 32],
    local_payload: &[u8],
) -> Result<HandshakeOutcome<S>, StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hs = Builder::new(params())
        .local_private_key(static_private)
        .build_initiator()?;

    // -> e
    let mut buf = write_buf_for(&[]);
    let n = hs.write_message(&[], &mut buf)?;
    write_handshake_msg(&mut io, &buf[..n]).await?;

    // <- e, ee, s, es  (carries the responder's payload)
    let msg2 = read_handshake_msg(&mut io).await?;
    let mut payload_buf = vec![0u8; msg2.len()];
    let n = hs.read_message(&msg2, &mut payload_buf)?;
    let remote_payload = payload_buf[..n].to_vec();

    // -> s, se  (carries our payload)
    let mut buf = write_buf_for(local_payload);
    let n = hs.write_message(local_payload, &mut buf)?;
    write_handshake_msg(&mut io, &buf[..n]).await?;

    finish(hs, io, remote_payload)
}

/// Run a Noise_XX handshake as responder, carrying `local_payload` in
/// message 2 and extracting the initiator's payload from message 3.
pub async fn server_handshake<S>(
    mut io: S,
    static_private: &[u8; 32],
    local_payload: &[u8],
) -> Result<HandshakeOutcome<S>, StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hs = Builder::new(params())
        .local_private_key(static_private)
        .build_responder()?;

    // <- e
    let msg1 = read_handshake_msg(&mut io).await?;
    let mut scratch = vec![0u8; msg1.len()];
    hs.read_message(&msg1, &mut scratch)?;

    // -> e, ee, s, es  (carries our payload)
    let mut buf = write_buf_for(local_payload);
    let n = hs.write_message(local_payload, &mut buf)?;
    write_handshake_msg(&mut io, &buf[..n]).await?;

    // <- s, se  (carries the initiator's payload)
    let msg3 = read_handshake_msg(&mut io).await?;
    let mut payload_buf = vec![0u8; msg3.len()];
    let n = hs.read_message(&msg3, &mut payload_buf)?;
    let remote_payload = payload_buf[..n].to_vec();

    finish(hs, io, remote_payload)
}

// ============================================================================
// Transport
// ============================================================================

/// An established secure stream: one AEAD-sealed record per `u32`-framed
/// message.
pub struct SecureStream<S> {
    io: S,
    transport: TransportState,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureStream<S> {
    /// Split into independently owned read/write halves. The transport
    /// state is shared behind a mutex held only around encrypt/decrypt,
    /// never across a socket await.
    pub fn split(self) -> (SecureReader<S>, SecureWriter<S>) {
        let (read_half, write_half) = tokio::io::split(self.io);
        let transport = Arc::new(Mutex::new(self.transport));
        (
            SecureReader {
                io: read_half,
                transport: transport.clone(),
            },
            SecureWriter {
                io: write_half,
                transport,
            },
        )
    }
}

pub struct SecureReader<S> {
    io: ReadHalf<S>,
    transport: Arc<Mutex<TransportState>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureReader<S> {
    /// Read and decrypt one record.
    pub async fn read_record(&mut self) -> Result<Vec<u8>, StreamError> {
        let mut len_buf = [0u8; 4];
        self.io.read_exact(&mut len_buf).await?;
        let n = u32::from_be_bytes(len_buf) as usize;
        if n == 0 {
            return Err(StreamError::InvalidFrameLength);
        }
        if n > MAX_MESSAGE_SIZE {
            return Err(StreamError::RecordTooLarge);
        }
        let mut ciphertext = vec![0u8; n];
        self.io.read_exact(&mut ciphertext).await?;

        let mut plaintext = vec![0u8; n];
        let len = {
            let mut ts = self.transport.lock().unwrap_or_else(|e| e.into_inner());
            ts.read_message(&ciphertext, &mut plaintext)?
        };
        plaintext.truncate(len);
        Ok(plaintext)
    }
}

pub struct SecureWriter<S> {
    io: WriteHalf<S>,
    transport: Arc<Mutex<TransportState>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureWriter<S> {
    /// Encrypt and write one record.
    pub async fn write_record(&mut self, plaintext: &[u8]) -> Result<(), StreamError> {
        if plaintext.is_empty() || plaintext.len() > MAX_RECORD_SIZE {
            return Err(StreamError::RecordTooLarge);
        }
        let mut ciphertext = vec![0u8; plaintext.len() + TAG_LEN];
        let len = {
            let mut ts = self.transport.lock().unwrap_or_else(|e| e.into_inner());
            ts.write_message(plaintext, &mut ciphertext)?
        };
        self.io.write_all(&(len as u32).to_be_bytes()).await?;
        self.io.write_all(&ciphertext[..len]).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Shut down the underlying write half, signalling EOF to the peer.
    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}
