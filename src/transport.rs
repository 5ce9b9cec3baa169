//! # Peer Sessions
//!
//! Everything between an accepted/dialed TCP stream and an installed peer:
//! the Noise handshake with its identity payload, the hello exchange, and
//! the per-peer write machinery.
//!
//! Each installed peer owns a bounded outbound queue (capacity 128) drained
//! by a dedicated write task. Enqueueing never blocks: on a full queue the
//! [`SendPolicy`] decides between scheduling the peer for removal
//! (`Disconnect` — a slow peer must not block the node) and silently
//! discarding the message (`Drop`). Teardown is idempotent: the first
//! caller wins the latch, cancels both tasks, and the disconnect event is
//! emitted exactly once by the registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::identity::Identity;
use crate::messages::{Envelope, Hello, MessageType, NoiseIdentityPayload};
use crate::noise::{self, SecureReader, SecureWriter};

/// Outbound queue depth per peer.
pub const SEND_QUEUE_DEPTH: usize = 128;

/// Deadline for the Noise handshake and for the hello response read.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// What to do when a peer's send queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendPolicy {
    /// Schedule the peer for removal and drop the message. Used for
    /// peer lists, relay fan-out, and RPC replies.
    Disconnect,
    /// Silently discard the message.
    Drop,
}

#[derive(Clone, Default)]
struct PeerMeta {
    name: String,
    user_id: String,
    user_pub: Vec<u8>,
}

/// A connected remote, uniquely identified by NetworkID.
pub struct Peer {
    /// Hex of the remote Noise static key, taken from the hello `from_id`.
    pub network_id: String,
    /// Advertised listen address from the hello.
    pub addr: String,
    /// Observed socket address of the underlying stream.
    pub observed_addr: String,

    meta: RwLock<PeerMeta>,
    send_tx: mpsc::Sender<Envelope>,
    pub cancel: CancellationToken,
    torn_down: AtomicBool,
}

impl Peer {
    pub fn name(&self) -> String {
        self.meta.read().unwrap_or_else(|e| e.into_inner()).name.clone()
    }

    pub fn user_id(&self) -> String {
        self.meta
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .user_id
            .clone()
    }

    pub fn user_pub(&self) -> Vec<u8> {
        self.meta
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .user_pub
            .clone()
    }

    /// Update display metadata from an identify payload. The user binding
    /// only tightens: a valid 32-byte key replaces an absent one.
    pub fn set_identify(&self, name: &str, user_pub: &[u8]) {
        let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
        if !name.is_empty() {
            meta.name = name.to_string();
        }
        if user_pub.len() == 32 {
            meta.user_pub = user_pub.to_vec();
            meta.user_id = hex::encode(user_pub);
        }
    }

    pub fn set_name_if_empty(&self, name: &str) {
        let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
        if meta.name.is_empty() && !name.is_empty() {
            meta.name = name.to_string();
        }
    }

    /// Non-blocking enqueue. Applies `policy` on a full queue; a closed
    /// queue (peer tearing down) always drops.
    pub fn send(&self, env: Envelope, policy: SendPolicy) {
        match self.send_tx.try_send(env) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => match policy {
                SendPolicy::Disconnect => {
                    debug!(peer = %short(&self.network_id), "send buffer full, disconnecting");
                    self.cancel.cancel();
                }
                SendPolicy::Drop => {
                    trace!(peer = %short(&self.network_id), "send buffer full, dropping message");
                }
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// First caller wins; later callers see `false`.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }
}

/// Everything `establish` produces for the node to wire up: the installed
/// peer handle plus the halves its two tasks will own.
pub struct SessionSetup {
    pub peer: std::sync::Arc<Peer>,
    pub reader: SecureReader<TcpStream>,
    pub writer: SecureWriter<TcpStream>,
    pub send_rx: mpsc::Receiver<Envelope>,
}

pub struct LocalIdentity<'a> {
    pub identity: &'a Identity,
    pub name: &'a str,
    pub listen_addr: &'a str,
    pub protocol: &'a str,
}

/// Run the secure handshake and hello exchange over a fresh stream.
///
/// On success the remote is fully identified: NetworkID from the hello
/// `from_id`, user identity from the Noise payload, listen address from the
/// hello. On any failure the stream is dropped and no peer state leaks.
pub async fn establish(
    stream: TcpStream,
    local: LocalIdentity<'_>,
    inbound: bool,
) -> Result<SessionSetup> {
    let observed_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let payload = serde_json::to_vec(&NoiseIdentityPayload {
        name: local.name.to_string(),
        user_pub: local.identity.signing_public().to_vec(),
    })?;

    let handshake = async {
        if inbound {
            noise::server_handshake(stream, local.identity.noise_private(), &payload).await
        } else {
            noise::client_handshake(stream, local.identity.noise_private(), &payload).await
        }
    };
    let outcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
        .await
        .context("noise handshake timed out")?
        .context("noise handshake failed")?;

    let remote_ident: NoiseIdentityPayload = serde_json::from_slice(&outcome.remote_payload)
        .context("bad remote identity payload")?;

    let (mut reader, mut writer) = outcome.stream.split();

    // Hello handshake over the encrypted channel: send ours, then read
    // theirs with a deadline.
    let hello = Envelope::new(
        MessageType::Hello,
        local.identity.network_id(),
        &Hello {
            name: local.name.to_string(),
            listen: local.listen_addr.to_string(),
            protocol: local.protocol.to_string(),
        },
    )?;
    writer.write_record(&serde_json::to_vec(&hello)?).await?;

    let env = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_record())
        .await
        .context("hello read timed out")??;
    let env: Envelope = serde_json::from_slice(&env).context("bad hello envelope")?;
    if env.msg_type != MessageType::Hello {
        bail!("expected hello, got {:?}", env.msg_type);
    }
    let remote_hello: Hello = env.parse_payload().context("bad hello payload")?;
    if remote_hello.protocol != local.protocol {
        bail!(
            "protocol mismatch: ours {:?}, theirs {:?}",
            local.protocol,
            remote_hello.protocol
        );
    }

    let network_id = env.from_id;
    if network_id != hex::encode(outcome.remote_static) {
        debug!(
            claimed = %short(&network_id),
            authenticated = %short(&hex::encode(outcome.remote_static)),
            "hello from_id differs from authenticated static key"
        );
    }

    let user_id = if remote_ident.user_pub.len() == 32 {
        hex::encode(&remote_ident.user_pub)
    } else {
        String::new()
    };

    let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    let peer = std::sync::Arc::new(Peer {
        network_id,
        addr: remote_hello.listen,
        observed_addr,
        meta: RwLock::new(PeerMeta {
            name: remote_ident.name,
            user_id,
            user_pub: remote_ident.user_pub,
        }),
        send_tx,
        cancel: CancellationToken::new(),
        torn_down: AtomicBool::new(false),
    });

    Ok(SessionSetup {
        peer,
        reader,
        writer,
        send_rx,
    })
}

/// Drain the peer's queue into the socket in enqueue order. A write error
/// cancels the peer so the read side tears the session down.
pub async fn write_loop(
    peer: std::sync::Arc<Peer>,
    mut writer: SecureWriter<TcpStream>,
    mut send_rx: mpsc::Receiver<Envelope>,
) {
    loop {
        tokio::select! {
            _ = peer.cancel.cancelled() => break,
            env = send_rx.recv() => {
                let Some(env) = env else { break };
                let bytes = match serde_json::to_vec(&env) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!(peer = %short(&peer.network_id), error = %e, "encode failed");
                        peer.cancel.cancel();
                        break;
                    }
                };
                if let Err(e) = writer.write_record(&bytes).await {
                    debug!(peer = %short(&peer.network_id), error = %e, "write failed");
                    peer.cancel.cancel();
                    break;
                }
            }
        }
    }
    writer.shutdown().await;
}

pub(crate) fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

#[cfg(test)]
pub(crate) fn test_peer(network_id: &str, user_id: &str, addr: &str) -> (std::sync::Arc<Peer>, mpsc::Receiver<Envelope>) {
    let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    let peer = std::sync::Arc::new(Peer {
        network_id: network_id.to_string(),
        addr: addr.to_string(),
        observed_addr: String::new(),
        meta: RwLock::new(PeerMeta {
            name: String::new(),
            user_id: user_id.to_string(),
            user_pub: Vec::new(),
        }),
        send_tx,
        cancel: CancellationToken::new(),
        torn_down: AtomicBool::new(false),
    });
    (peer, send_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Gossip;

    fn gossip_env(i: usize) -> Envelope {
        Envelope::new(
            MessageType::Gossip,
            &"ab".repeat(32),
            &Gossip {
                id: format!("g-{i}"),
                channel: "global".into(),
                body: serde_json::Value::Null,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn full_queue_disconnect_policy_cancels_peer() {
        let (peer, _rx) = test_peer(&"aa".repeat(32), &"bb".repeat(32), "127.0.0.1:1");

        for i in 0..SEND_QUEUE_DEPTH {
            peer.send(gossip_env(i), SendPolicy::Disconnect);
        }
        assert!(!peer.cancel.is_cancelled());

        peer.send(gossip_env(999), SendPolicy::Disconnect);
        assert!(peer.cancel.is_cancelled(), "overflow must schedule removal");
    }

    #[tokio::test]
    async fn full_queue_drop_policy_keeps_peer() {
        let (peer, _rx) = test_peer(&"aa".repeat(32), &"bb".repeat(32), "127.0.0.1:1");

        for i in 0..SEND_QUEUE_DEPTH + 10 {
            peer.send(gossip_env(i), SendPolicy::Drop);
        }
        assert!(!peer.cancel.is_cancelled());
    }

    #[test]
    fn teardown_latch_is_single_shot() {
        let (peer, _rx) = test_peer(&"aa".repeat(32), &"bb".repeat(32), "127.0.0.1:1");
        assert!(peer.begin_teardown());
        assert!(!peer.begin_teardown());
        assert!(!peer.begin_teardown());
    }

    #[test]
    fn identify_tightens_user_binding() {
        let (peer, _rx) = test_peer(&"aa".repeat(32), "", "127.0.0.1:1");
        assert_eq!(peer.user_id(), "");

        peer.set_identify("carol", &[7u8; 32]);
        assert_eq!(peer.name(), "carol");
        assert_eq!(peer.user_id(), hex::encode([7u8; 32]));

        // Short keys are ignored, names persist.
        peer.set_identify("", &[1u8; 4]);
        assert_eq!(peer.name(), "carol");
        assert_eq!(peer.user_id(), hex::encode([7u8; 32]));
    }
}
