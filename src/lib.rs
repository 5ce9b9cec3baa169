//! # Paddock - Peer-to-Peer Overlay Node
//!
//! Paddock is a small overlay networking stack: each node establishes
//! authenticated, encrypted streams with other nodes, discovers additional
//! peers through several complementary mechanisms, participates in a
//! Kademlia-style DHT, and disseminates application messages by
//! flood-gossip with deduplication.
//!
//! - **Identity**: an Ed25519 signing keypair (UserID) plus an X25519
//!   static keypair for the Noise handshake (NetworkID); the routing
//!   coordinate is `SHA-256(signing-pubkey)`
//! - **Transport**: TCP with a mutual Noise_XX handshake, then
//!   length-framed AEAD records carrying JSON envelopes
//! - **DHT**: 256 LRU k-buckets with eviction-by-ping and a per-subnet
//!   diversity cap; signed mutable records and content-addressed
//!   immutable records; α-parallel iterative lookups
//! - **Gossip**: best-effort flood relay with a TTL dedup cache
//! - **Seed mode**: a user registry plus relay of addressed envelopes for
//!   peers that cannot accept connections
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | high-level API combining all components |
//! | `identity` | keypairs, hex identifiers, XOR-metric node ids |
//! | `noise` | Noise_XX secure stream and record framing |
//! | `messages` | serialization types for all wire traffic |
//! | `dht` | routing table, record store, RPC layer, lookups |
//! | `transport` | peer sessions: handshake, hello, send queues |
//! | `gossip` | dedup cache for flood relay |
//! | `store` | persisted peer/DHT address books |
//! | `protocols` | seam traits between engine and node |

mod dht;
mod gossip;
mod identity;
mod messages;
mod noise;
mod node;
mod protocols;
mod store;
mod transport;

pub use dht::{
    validate_record_against_key, Dht, DhtError, LookupConfig, MemRecordStore, PeerContact,
    RecordError, RecordStore, RoutingEntry, RoutingTable, DEFAULT_ALPHA, DEFAULT_K,
};
pub use gossip::SeenCache;
pub use identity::{verify_signature, Identity, NodeId};
pub use messages::{
    key_from_immutable, key_from_mutable, new_msg_id, sign_mutable, sign_points_snapshot,
    sign_quiz_grant, verify_mutable, verify_points_snapshot, verify_quiz_grant, DhtKind,
    DhtNodeEntry, DhtRecord, DhtWire, Envelope, Gossip, Hello, Identify, MessageType, NatRegister,
    NatRelay, PeerInfo, PeerList, PointsSnapshot, QuizGrant, RecordType, SignedPointsSnapshot,
    PROTOCOL_VERSION,
};
pub use node::{Event, Node, NodeConfig, PeerSnapshot};
pub use protocols::Sender;
pub use store::{DhtStore, PeerStore};
pub use transport::SendPolicy;
