//! # Identity and Routing Coordinates
//!
//! Every node holds two long-term keypairs:
//!
//! - An **Ed25519 signing keypair**. Its public key, hex-encoded, is the
//!   node's *UserID* — the identity application signatures are verified
//!   against, and the identity the DHT addresses peers by.
//! - An **X25519 static keypair** used as the Noise static key. Its public
//!   key, hex-encoded, is the node's *NetworkID* — the identity a live
//!   connection is bound to.
//!
//! The routing coordinate is derived, not carried: *NodeID* is the SHA-256
//! of the signing public key. A wire node entry `{node_id, peer_id, addr}`
//! is therefore self-certifying: any receiver can check
//! `node_id == sha256(decode(peer_id))` without extra material.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of a routing coordinate in bytes (256-bit keyspace).
pub const NODE_ID_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("bad peer id: expected 64 hex chars of an ed25519 public key")]
    BadPeerId,
    #[error("bad node id: expected 64 hex chars")]
    BadNodeId,
    #[error("noise keypair generation failed: {0}")]
    Keygen(#[from] snow::Error),
}

// ============================================================================
// NodeId — the 256-bit XOR-metric routing coordinate
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Derive the routing coordinate from a hex-encoded signing public key.
    pub fn from_user_hex(user_id: &str) -> Result<Self, IdError> {
        let pub_bytes = hex::decode(user_id).map_err(|_| IdError::BadPeerId)?;
        if pub_bytes.len() != 32 {
            return Err(IdError::BadPeerId);
        }
        Ok(Self::from_pubkey(&pub_bytes))
    }

    /// SHA-256 of the raw public key bytes.
    pub fn from_pubkey(pubkey: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(pubkey);
        Self(h.finalize().into())
    }

    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(s).map_err(|_| IdError::BadNodeId)?;
        if bytes.len() != NODE_ID_LEN {
            return Err(IdError::BadNodeId);
        }
        let mut out = [0u8; NODE_ID_LEN];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance `self ^ other`.
    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Index of the bucket `other` falls in relative to `self`: the position
    /// of the highest-order set bit of the XOR distance, MSB-first
    /// (0 = most distant prefix class). `None` when the ids are equal.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return Some(byte_idx * 8 + byte.leading_zeros() as usize);
            }
        }
        None
    }

    /// Uniform random id; used as a lookup target when expanding the mesh.
    pub fn random() -> Self {
        Self(rand::random::<[u8; NODE_ID_LEN]>())
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

/// Lexicographic comparison of raw distance bytes. Must be done on bytes,
/// not any encoded form, so the ordering is encoding-independent.
#[inline]
pub fn distance_cmp(a: &[u8; NODE_ID_LEN], b: &[u8; NODE_ID_LEN]) -> std::cmp::Ordering {
    a.cmp(b)
}

// ============================================================================
// Identity — the node's long-term key material
// ============================================================================

pub struct Identity {
    signing: SigningKey,
    noise_private: [u8; 32],
    noise_public: [u8; 32],

    user_id: String,
    network_id: String,
    node_id: NodeId,
}

impl Identity {
    /// Generate a fresh identity: an Ed25519 signing keypair and an X25519
    /// static keypair for the Noise handshake.
    pub fn generate() -> Result<Self, IdError> {
        let signing = SigningKey::generate(&mut OsRng);
        let (noise_private, noise_public) = crate::noise::generate_static_keypair()?;
        Ok(Self::assemble(signing, noise_private, noise_public))
    }

    fn assemble(signing: SigningKey, noise_private: [u8; 32], noise_public: [u8; 32]) -> Self {
        let sign_pub = signing.verifying_key().to_bytes();
        let user_id = hex::encode(sign_pub);
        let network_id = hex::encode(noise_public);
        let node_id = NodeId::from_pubkey(&sign_pub);
        Self {
            signing,
            noise_private,
            noise_public,
            user_id,
            network_id,
            node_id,
        }
    }

    /// Hex of the Ed25519 signing public key.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Hex of the X25519 static public key (the dialing identity).
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// SHA-256 of the signing public key (the routing coordinate).
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn signing_public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn noise_private(&self) -> &[u8; 32] {
        &self.noise_private
    }

    pub fn noise_public(&self) -> &[u8; 32] {
        &self.noise_public
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &&self.user_id[..16])
            .field("network_id", &&self.network_id[..16])
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature against a raw public key.
pub fn verify_signature(pubkey: &[u8], message: &[u8], sig: &[u8]) -> bool {
    let Ok(pub_arr) = <&[u8; 32]>::try_from(pubkey) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(pub_arr) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(sig) else {
        return false;
    };
    vk.verify(message, &signature).is_ok()
}
