//! Seam traits between the DHT engine and the node.
//!
//! The DHT engine composes RPCs but owns no sockets; it reaches the network
//! through [`Sender`], which the node implements. Keeping the seam a trait
//! lets the engine be driven by a loopback harness in tests and avoids a
//! dependency cycle between the routing layer and the peer registry.

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::Envelope;

/// Outbound envelope delivery toward a connected peer.
#[async_trait]
pub trait Sender: Send + Sync {
    /// This node's NetworkID, used as `from_id` on outgoing envelopes.
    fn network_id(&self) -> &str;

    /// Enqueue an envelope toward the peer addressed by `peer_id` (the
    /// remote UserID). Non-blocking; errors when the peer is unknown or
    /// the enqueue fails.
    async fn send_to_peer(&self, peer_id: &str, env: Envelope) -> Result<()>;
}
