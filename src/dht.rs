//! # Kademlia-style Distributed Hash Table
//!
//! The DHT engine owns routing, pending RPCs, record storage, and lookup
//! behavior. It composes RPCs through the [`Sender`] seam and never touches
//! sockets directly.
//!
//! ## Key operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `observe_peer` | upsert a peer into routing with eviction-by-ping |
//! | `iterative_find_node` | α-parallel lookup toward a target id |
//! | `get_value` | iterative FIND_VALUE with validation short-circuit |
//! | `put_immutable` / `put_mutable` | build, validate, and publish records |
//! | `handle_wire` | server-side dispatch of inbound DHT envelopes |
//!
//! ## Routing table
//!
//! 256 k-buckets indexed by the first differing bit of `self ⊕ peer`
//! (MSB-first). Buckets are LRU-ordered (index 0 = most recently seen),
//! hold up to k entries plus a bounded replacement cache, and enforce a
//! per-subnet diversity cap. Eviction pings the LRU tail *without holding
//! the table lock* and reconciles on reacquisition: a slot may have opened,
//! the tail may have changed, a duplicate may have been inserted.
//!
//! ## Admission control
//!
//! - Global pending-RPC table capped at 2048.
//! - Per-peer inflight cap of 4, rolled back on rejection.
//! - Per-peer token bucket on inbound traffic (20 req/s, burst 40);
//!   over-rate messages are dropped silently.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use futures::future::join_all;
use lru::LruCache;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::identity::{distance_cmp, Identity, NodeId};
use crate::messages::{
    key_from_immutable, key_from_mutable, sign_mutable, verify_mutable, DhtKind, DhtNodeEntry,
    DhtRecord, DhtWire, Envelope, MessageType, RecordType, MAX_RECORD_VALUE,
};
use crate::protocols::Sender;
use crate::store::DhtStore;

/// Bucket capacity and lookup result size.
pub const DEFAULT_K: usize = 20;

/// Parallelism of iterative lookups.
pub const DEFAULT_ALPHA: usize = 3;

/// Default per-RPC deadline.
pub const RPC_TIMEOUT: Duration = Duration::from_millis(1200);

/// Deadline for liveness pings (eviction checks).
pub const PING_TIMEOUT: Duration = Duration::from_millis(800);

/// Global cap on outstanding RPC waiters.
const MAX_PENDING_RPCS: usize = 2048;

/// Per-peer cap on outstanding RPCs.
const MAX_INFLIGHT_PER_PEER: usize = 4;

/// Inbound DHT traffic per peer: sustained rate and burst.
const INBOUND_RATE: f64 = 20.0;
const INBOUND_BURST: f64 = 40.0;

/// Bound on the per-peer rate-limit table.
const MAX_TRACKED_RATE_PEERS: usize = 1024;

/// Replacement cache size per bucket.
const REPLACEMENT_CACHE_MAX: usize = 10;

/// Default diversity cap: entries per subnet per bucket. 0 disables.
const DEFAULT_MAX_PER_SUBNET: usize = 2;

/// Lookup candidate pool cap, as a multiple of k.
const LOOKUP_POOL_FACTOR: usize = 8;

/// Record maintenance cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);
const REPUBLISH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Cadence of random-target lookups that keep sparse buckets warm.
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn new_rpc_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("too many pending rpcs")]
    TooManyPending,
    #[error("peer inflight limit reached")]
    PeerOverloaded,
    #[error("rpc deadline exceeded")]
    Timeout,
    #[error("send failed: {0}")]
    Send(String),
    #[error("bad target or key: expected 64 hex chars")]
    BadTarget,
}

/// Record validation failures. Display strings travel in STORE_RESULT
/// replies, so they stay short and stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("bad-record")]
    BadRecord,
    #[error("bad-signature")]
    BadSignature,
    #[error("seq-too-low")]
    SeqTooLow,
    #[error("key-mismatch")]
    KeyMismatch,
    #[error("record-too-large")]
    TooLarge,
    #[error("record-expired")]
    Expired,
}

// ============================================================================
// Routing Table (XOR-metric, LRU buckets)
// ============================================================================

/// One routing row. `peer_id` is the UserID (hex signing key) — the DHT
/// addressing key — and `node_id` is its SHA-256.
#[derive(Clone, Debug)]
pub struct RoutingEntry {
    pub node_id: NodeId,
    pub peer_id: String,
    pub addr: String,
    pub name: String,
    pub last_seen: Instant,
}

#[derive(Default)]
struct Bucket {
    /// LRU: index 0 = most recently seen.
    nodes: Vec<RoutingEntry>,
    /// Bounded stand-by list for candidates that lost an eviction check.
    replacements: Vec<RoutingEntry>,
}

impl Bucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|e| e.node_id == *id)
    }

    fn add_replacement(&mut self, entry: RoutingEntry) {
        if self.replacements.iter().any(|e| e.node_id == entry.node_id) {
            return;
        }
        self.replacements.insert(0, entry);
        self.replacements.truncate(REPLACEMENT_CACHE_MAX);
    }
}

struct TableInner {
    buckets: Vec<Bucket>,
    max_per_subnet: usize,
}

pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    inner: RwLock<TableInner>,
}

/// Outcome of the locked first phase of an upsert.
enum UpsertPhase {
    Done,
    /// Bucket full and the candidate is new: the LRU tail must prove
    /// liveness before anything changes.
    Full { bucket: usize, tail: RoutingEntry },
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let k = if k == 0 { DEFAULT_K } else { k };
        let mut buckets = Vec::with_capacity(256);
        buckets.resize_with(256, Bucket::default);
        Self {
            self_id,
            k,
            inner: RwLock::new(TableInner {
                buckets,
                max_per_subnet: DEFAULT_MAX_PER_SUBNET,
            }),
        }
    }

    pub fn set_diversity_limit(&self, max_per_subnet: usize) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .max_per_subnet = max_per_subnet;
    }

    /// No-network upsert: maintains LRU ordering, never evicts. A full
    /// bucket drops the new entry.
    pub fn upsert(&self, entry: RoutingEntry) {
        let _ = self.upsert_phase1(entry);
    }

    /// Kademlia upsert: move-to-front, insert when there is room, and on a
    /// full bucket ping the LRU tail with the table lock released. A dead
    /// tail is evicted; a live one keeps its slot and the candidate goes to
    /// the replacement cache.
    pub async fn upsert_with_eviction<F, Fut>(&self, entry: RoutingEntry, ping: F)
    where
        F: FnOnce(RoutingEntry) -> Fut,
        Fut: std::future::Future<Output = bool> + Send,
    {
        let candidate = entry.clone();
        let UpsertPhase::Full { bucket, tail } = self.upsert_phase1(entry) else {
            return;
        };

        // The ping happens with no lock held; state is reconciled below.
        let alive = ping(tail.clone()).await;
        self.resolve_eviction(bucket, tail, candidate, alive);
    }

    fn upsert_phase1(&self, mut entry: RoutingEntry) -> UpsertPhase {
        if entry.node_id == self.self_id {
            return UpsertPhase::Done;
        }
        let Some(bi) = self.self_id.bucket_index(&entry.node_id) else {
            return UpsertPhase::Done;
        };

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let max_per_subnet = inner.max_per_subnet;
        let bucket = &mut inner.buckets[bi];

        if let Some(pos) = bucket.position(&entry.node_id) {
            let mut existing = bucket.nodes.remove(pos);
            if !entry.peer_id.is_empty() {
                existing.peer_id = std::mem::take(&mut entry.peer_id);
            }
            existing.addr = std::mem::take(&mut entry.addr);
            if !entry.name.is_empty() {
                existing.name = std::mem::take(&mut entry.name);
            }
            existing.last_seen = entry.last_seen;
            bucket.nodes.insert(0, existing);
            return UpsertPhase::Done;
        }

        // Anti-eclipse diversity: cap entries from one subnet per bucket.
        if max_per_subnet > 0 {
            if let Some(sk) = subnet_key(&entry.addr) {
                let count = bucket
                    .nodes
                    .iter()
                    .filter(|e| subnet_key(&e.addr).as_deref() == Some(sk.as_str()))
                    .count();
                if count >= max_per_subnet {
                    trace!(subnet = %sk, "routing upsert dropped by diversity cap");
                    return UpsertPhase::Done;
                }
            }
        }

        if bucket.nodes.len() < self.k {
            bucket.nodes.insert(0, entry);
            return UpsertPhase::Done;
        }

        let tail = bucket.nodes[bucket.nodes.len() - 1].clone();
        UpsertPhase::Full { bucket: bi, tail }
    }

    fn resolve_eviction(
        &self,
        bucket_idx: usize,
        tail: RoutingEntry,
        entry: RoutingEntry,
        tail_alive: bool,
    ) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let bucket = &mut inner.buckets[bucket_idx];

        // A duplicate may have been inserted while unlocked.
        if let Some(pos) = bucket.position(&entry.node_id) {
            let mut existing = bucket.nodes.remove(pos);
            existing.last_seen = entry.last_seen;
            bucket.nodes.insert(0, existing);
            return;
        }

        // A slot may have opened while unlocked.
        if bucket.nodes.len() < self.k {
            bucket.nodes.insert(0, entry);
            return;
        }

        // The tail may have changed while unlocked.
        let cur_tail = &bucket.nodes[bucket.nodes.len() - 1];
        if tail_alive && cur_tail.node_id == tail.node_id {
            bucket.add_replacement(entry);
            return;
        }

        bucket.nodes.pop();
        bucket.nodes.insert(0, entry);
    }

    /// The `n` entries closest to `target` by raw-byte XOR distance.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<RoutingEntry> {
        let n = if n == 0 { self.k } else { n };
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        let mut all: Vec<(RoutingEntry, [u8; 32])> = inner
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .map(|e| (e.clone(), e.node_id.xor_distance(target)))
            .collect();
        drop(inner);

        all.sort_by(|a, b| distance_cmp(&a.1, &b.1));
        all.truncate(n);
        all.into_iter().map(|(e, _)| e).collect()
    }

    pub fn size(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn bucket_size(&self, index: usize) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.buckets.get(index).map_or(0, |b| b.nodes.len())
    }

    #[cfg(test)]
    fn replacement_len(&self, index: usize) -> usize {
        let inner = self.inner.read().unwrap();
        inner.buckets[index].replacements.len()
    }
}

/// Coarse network key for the diversity cap: IPv4 `/24`, IPv6 `/64`.
/// Loopback buckets by host:port and DNS names by lowercased host, so local
/// test fleets are not culled by the cap.
fn subnet_key(addr: &str) -> Option<String> {
    if addr.is_empty() {
        return None;
    }

    let (host, port) = match addr.rsplit_once(':') {
        Some((h, p)) if !h.is_empty() => (h, Some(p)),
        _ => (addr, None),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let Ok(ip) = host.parse::<std::net::IpAddr>() else {
        return Some(format!("dns:{}", host.to_lowercase()));
    };

    if ip.is_loopback() {
        return Some(match port {
            Some(p) => format!("loopback:{host}:{p}"),
            None => format!("loopback:{host}"),
        });
    }

    match ip {
        std::net::IpAddr::V4(v4) => {
            let o = v4.octets();
            Some(format!("v4:{}.{}.{}.0/24", o[0], o[1], o[2]))
        }
        std::net::IpAddr::V6(v6) => {
            let mut bytes = v6.octets();
            for b in &mut bytes[8..] {
                *b = 0;
            }
            Some(format!("v6:{}/64", std::net::Ipv6Addr::from(bytes)))
        }
    }
}

// ============================================================================
// Record Store
// ============================================================================

/// Key→record map. Implementations return defensive copies so callers
/// cannot mutate stored state.
pub trait RecordStore: Send + Sync {
    fn get(&self, key: &[u8; 32], now: i64) -> Option<DhtRecord>;
    fn put(&self, key: [u8; 32], rec: &DhtRecord) -> Result<(), RecordError>;
    fn delete(&self, key: &[u8; 32]);
    fn sweep_expired(&self, now: i64) -> usize;
    fn keys(&self) -> Vec<[u8; 32]>;
    fn len(&self) -> usize;
}

#[derive(Default)]
pub struct MemRecordStore {
    data: RwLock<HashMap<[u8; 32], DhtRecord>>,
}

impl MemRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemRecordStore {
    fn get(&self, key: &[u8; 32], now: i64) -> Option<DhtRecord> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let rec = data.get(key)?;
        if rec.expires_unix != 0 && now > rec.expires_unix {
            return None;
        }
        Some(rec.clone())
    }

    fn put(&self, key: [u8; 32], rec: &DhtRecord) -> Result<(), RecordError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());

        // Mutable records are monotonic in seq per key.
        if rec.record_type == RecordType::Mutable {
            if let Some(old) = data.get(&key) {
                if old.record_type == RecordType::Mutable && rec.seq <= old.seq {
                    return Err(RecordError::SeqTooLow);
                }
            }
        }

        data.insert(key, rec.clone());
        Ok(())
    }

    fn delete(&self, key: &[u8; 32]) {
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn sweep_expired(&self, now: i64) -> usize {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let before = data.len();
        data.retain(|_, rec| rec.expires_unix == 0 || now <= rec.expires_unix);
        before - data.len()
    }

    fn keys(&self) -> Vec<[u8; 32]> {
        self.data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Validate a record against its claimed key. Invoked on STORE and on the
/// returned VALUE of FIND_VALUE; never stores, pure on its inputs.
pub fn validate_record_against_key(
    key: &[u8; 32],
    rec: &DhtRecord,
    now: i64,
) -> Result<(), RecordError> {
    if rec.expires_unix != 0 && now > rec.expires_unix {
        return Err(RecordError::Expired);
    }
    if rec.value.len() > MAX_RECORD_VALUE {
        return Err(RecordError::TooLarge);
    }

    match rec.record_type {
        RecordType::Immutable => {
            if key_from_immutable(&rec.value) != *key {
                return Err(RecordError::KeyMismatch);
            }
            Ok(())
        }
        RecordType::Mutable => {
            let Some(pubkey) = rec.pubkey.as_deref() else {
                return Err(RecordError::BadRecord);
            };
            let Some(sig) = rec.sig.as_deref() else {
                return Err(RecordError::BadRecord);
            };
            if pubkey.len() != 32 || sig.is_empty() {
                return Err(RecordError::BadRecord);
            }
            if key_from_mutable(pubkey, &rec.name) != *key {
                return Err(RecordError::KeyMismatch);
            }
            if !verify_mutable(pubkey, key, rec.seq, rec.expires_unix, &rec.value, sig) {
                return Err(RecordError::BadSignature);
            }
            Ok(())
        }
    }
}

pub fn parse_key_hex(s: &str) -> Result<[u8; 32], DhtError> {
    let bytes = hex::decode(s).map_err(|_| DhtError::BadTarget)?;
    <[u8; 32]>::try_from(bytes).map_err(|_| DhtError::BadTarget)
}

// ============================================================================
// Inbound rate limiting
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct TokenBucket {
    tokens: f64,
    last: Option<Instant>,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            tokens: 0.0,
            last: None,
        }
    }

    fn allow(&mut self, now: Instant, rate: f64, burst: f64, cost: f64) -> bool {
        let last = match self.last {
            Some(last) => last,
            None => {
                self.tokens = burst;
                now
            }
        };
        self.last = Some(now);

        self.tokens = (self.tokens + now.duration_since(last).as_secs_f64() * rate).min(burst);
        if self.tokens < cost {
            return false;
        }
        self.tokens -= cost;
        true
    }
}

// ============================================================================
// The engine
// ============================================================================

/// The sending side of an observed peer, as the session layer knows it.
#[derive(Clone, Debug)]
pub struct PeerContact {
    /// UserID (hex signing key).
    pub peer_id: String,
    /// Advertised listen address.
    pub addr: String,
    pub name: String,
}

#[derive(Clone, Copy)]
struct OwnedState {
    next_republish: Instant,
}

pub struct LookupConfig {
    pub alpha: usize,
    pub k: usize,
    pub rpc_timeout: Duration,
    pub max_rounds: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            k: DEFAULT_K,
            rpc_timeout: RPC_TIMEOUT,
            max_rounds: 32,
        }
    }
}

pub struct Dht {
    self_peer_id: String,
    self_node: NodeId,
    rt: RoutingTable,

    pending: Mutex<HashMap<String, oneshot::Sender<DhtWire>>>,
    inflight: Mutex<HashMap<String, usize>>,
    limiter: Mutex<LruCache<String, TokenBucket>>,

    records: Box<dyn RecordStore>,
    owned: Mutex<HashMap<[u8; 32], OwnedState>>,

    addr_store: Option<DhtStore>,
}

impl Dht {
    /// `self_peer_id` is this node's UserID; the routing coordinate is its
    /// SHA-256.
    pub fn new(self_peer_id: &str, k: usize) -> Result<Self> {
        let self_node =
            NodeId::from_user_hex(self_peer_id).map_err(|e| anyhow!("invalid self peer id: {e}"))?;
        Ok(Self {
            self_peer_id: self_peer_id.to_string(),
            self_node,
            rt: RoutingTable::new(self_node, k),
            pending: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            limiter: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_RATE_PEERS).unwrap(),
            )),
            records: Box::new(MemRecordStore::new()),
            owned: Mutex::new(HashMap::new()),
            addr_store: None,
        })
    }

    pub fn with_addr_store(mut self, store: DhtStore) -> Self {
        self.addr_store = Some(store);
        self
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.rt
    }

    pub fn records(&self) -> &dyn RecordStore {
        self.records.as_ref()
    }

    pub fn self_node_id(&self) -> NodeId {
        self.self_node
    }

    /// Best persisted addresses for cold-start dialing.
    pub fn bootstrap_addrs(&self, limit: usize) -> Vec<String> {
        self.addr_store
            .as_ref()
            .map(|s| s.candidates(5, limit))
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Routing observation
    // ------------------------------------------------------------------

    /// Pure upsert at connection time: no eviction, no network.
    pub fn on_peer_seen(&self, peer_id: &str, addr: &str, name: &str) {
        let Ok(node_id) = NodeId::from_user_hex(peer_id) else {
            return;
        };
        self.rt.upsert(RoutingEntry {
            node_id,
            peer_id: peer_id.to_string(),
            addr: addr.to_string(),
            name: name.to_string(),
            last_seen: Instant::now(),
        });
        self.note_addr_success(&node_id, addr, name);
    }

    /// Full upsert with eviction-by-ping, used for every observed RPC
    /// participant and every node learned from lookups.
    pub async fn observe_peer<S: Sender + ?Sized>(
        &self,
        n: &S,
        peer_id: &str,
        addr: &str,
        name: &str,
    ) {
        let Ok(node_id) = NodeId::from_user_hex(peer_id) else {
            return;
        };
        let entry = RoutingEntry {
            node_id,
            peer_id: peer_id.to_string(),
            addr: addr.to_string(),
            name: name.to_string(),
            last_seen: Instant::now(),
        };
        self.rt
            .upsert_with_eviction(entry, |tail| async move {
                matches!(
                    self.query_ping(n, &tail.peer_id, PING_TIMEOUT).await,
                    Ok(w) if w.kind == Some(DhtKind::Pong)
                )
            })
            .await;
        self.note_addr_success(&node_id, addr, name);
    }

    fn note_addr_success(&self, node_id: &NodeId, addr: &str, name: &str) {
        if addr.is_empty() {
            return;
        }
        if let Some(store) = &self.addr_store {
            store.note_success(&node_id.to_hex(), addr, name);
        }
    }

    // ------------------------------------------------------------------
    // Correlated RPCs
    // ------------------------------------------------------------------

    fn begin_rpc(
        &self,
        peer_id: &str,
        rpc_id: &str,
        tx: oneshot::Sender<DhtWire>,
    ) -> Result<(), DhtError> {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.len() >= MAX_PENDING_RPCS {
                return Err(DhtError::TooManyPending);
            }
            pending.insert(rpc_id.to_string(), tx);
        }

        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        let count = inflight.entry(peer_id.to_string()).or_insert(0);
        if *count >= MAX_INFLIGHT_PER_PEER {
            drop(inflight);
            // Roll back the pending slot that was just installed.
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(rpc_id);
            return Err(DhtError::PeerOverloaded);
        }
        *count += 1;
        Ok(())
    }

    fn end_rpc(&self, peer_id: &str, rpc_id: &str) {
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(count) = inflight.get_mut(peer_id) {
                *count -= 1;
                if *count == 0 {
                    inflight.remove(peer_id);
                }
            }
        }
        // Pending is removed by the handler on delivery; this makes cleanup
        // idempotent on timeout and error paths.
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(rpc_id);
    }

    async fn query<S: Sender + ?Sized>(
        &self,
        n: &S,
        peer_id: &str,
        mut req: DhtWire,
        timeout: Duration,
    ) -> Result<DhtWire, DhtError> {
        let rpc_id = new_rpc_id();
        req.rpc_id = rpc_id.clone();

        let (tx, rx) = oneshot::channel();
        self.begin_rpc(peer_id, &rpc_id, tx)?;

        let env = match Envelope::new(MessageType::Dht, n.network_id(), &req) {
            Ok(env) => env,
            Err(e) => {
                self.end_rpc(peer_id, &rpc_id);
                return Err(DhtError::Send(e.to_string()));
            }
        };

        if let Err(e) = n.send_to_peer(peer_id, env).await {
            self.end_rpc(peer_id, &rpc_id);
            return Err(DhtError::Send(e.to_string()));
        }

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(DhtError::Timeout),
            Err(_) => Err(DhtError::Timeout),
        };
        self.end_rpc(peer_id, &rpc_id);
        result
    }

    pub async fn query_ping<S: Sender + ?Sized>(
        &self,
        n: &S,
        peer_id: &str,
        timeout: Duration,
    ) -> Result<DhtWire, DhtError> {
        self.query(n, peer_id, DhtWire::request(DhtKind::Ping, String::new()), timeout)
            .await
    }

    pub async fn query_find_node<S: Sender + ?Sized>(
        &self,
        n: &S,
        peer_id: &str,
        target_hex: &str,
        timeout: Duration,
    ) -> Result<DhtWire, DhtError> {
        let mut req = DhtWire::request(DhtKind::FindNode, String::new());
        req.target = target_hex.to_string();
        self.query(n, peer_id, req, timeout).await
    }

    pub async fn query_find_value<S: Sender + ?Sized>(
        &self,
        n: &S,
        peer_id: &str,
        key_hex: &str,
        timeout: Duration,
    ) -> Result<DhtWire, DhtError> {
        let mut req = DhtWire::request(DhtKind::FindValue, String::new());
        req.key = key_hex.to_string();
        self.query(n, peer_id, req, timeout).await
    }

    pub async fn query_store<S: Sender + ?Sized>(
        &self,
        n: &S,
        peer_id: &str,
        key_hex: &str,
        rec: &DhtRecord,
        timeout: Duration,
    ) -> Result<DhtWire, DhtError> {
        let mut req = DhtWire::request(DhtKind::Store, String::new());
        req.key = key_hex.to_string();
        req.record = Some(rec.clone());
        self.query(n, peer_id, req, timeout).await
    }

    // ------------------------------------------------------------------
    // Server-side dispatch
    // ------------------------------------------------------------------

    /// Handle one inbound DHT payload from a connected peer. Rate limiting
    /// and routing observation happen before any dispatch; responses with a
    /// known rpc_id wake the pending waiter instead.
    pub async fn handle_wire<S: Sender + ?Sized>(&self, n: &S, from: &PeerContact, wire: DhtWire) {
        {
            let mut limiter = self.limiter.lock().unwrap_or_else(|e| e.into_inner());
            let bucket = limiter.get_or_insert_mut(from.peer_id.clone(), TokenBucket::new);
            if !bucket.allow(Instant::now(), INBOUND_RATE, INBOUND_BURST, 1.0) {
                return;
            }
        }

        // Routing observes all DHT traffic.
        self.observe_peer(n, &from.peer_id, &from.addr, &from.name).await;

        let Some(kind) = wire.kind else {
            return;
        };

        // Deliver responses to pending RPC waiters.
        if !wire.rpc_id.is_empty()
            && matches!(
                kind,
                DhtKind::Pong | DhtKind::Nodes | DhtKind::Value | DhtKind::StoreResult
            )
        {
            let waiter = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&wire.rpc_id);
            if let Some(tx) = waiter {
                let _ = tx.send(wire);
            }
            return;
        }

        match kind {
            DhtKind::Ping => {
                let reply = DhtWire::request(DhtKind::Pong, wire.rpc_id);
                self.reply(n, &from.peer_id, reply).await;
            }

            DhtKind::FindNode => {
                let Ok(target) = NodeId::from_hex(&wire.target) else {
                    return;
                };
                let mut reply = DhtWire::request(DhtKind::Nodes, wire.rpc_id);
                reply.target = wire.target;
                reply.nodes = self.closest_entries(&target, DEFAULT_K);
                self.reply(n, &from.peer_id, reply).await;
            }

            DhtKind::Store => {
                let mut reply = DhtWire::request(DhtKind::StoreResult, wire.rpc_id);
                let outcome = match (parse_key_hex(&wire.key), &wire.record) {
                    (Ok(key), Some(rec)) => {
                        validate_record_against_key(&key, rec, now_unix())
                            .and_then(|()| self.records.put(key, rec))
                    }
                    _ => Err(RecordError::BadRecord),
                };
                match outcome {
                    Ok(()) => reply.ok = Some(true),
                    Err(e) => {
                        debug!(peer = %short(&from.peer_id), error = %e, "rejected STORE");
                        reply.ok = Some(false);
                        reply.error = e.to_string();
                    }
                }
                self.reply(n, &from.peer_id, reply).await;
            }

            DhtKind::FindValue => {
                let Ok(key) = parse_key_hex(&wire.key) else {
                    return;
                };
                let mut reply = DhtWire::request(DhtKind::Value, wire.rpc_id);
                reply.key = wire.key;

                let now = now_unix();
                if let Some(rec) = self.records.get(&key, now) {
                    if validate_record_against_key(&key, &rec, now).is_ok() {
                        reply.record = Some(rec);
                        self.reply(n, &from.peer_id, reply).await;
                        return;
                    }
                }

                // Not found: closest nodes toward the key.
                let target = NodeId::from_bytes(key);
                reply.nodes = self.closest_entries(&target, DEFAULT_K);
                self.reply(n, &from.peer_id, reply).await;
            }

            _ => {}
        }
    }

    async fn reply<S: Sender + ?Sized>(&self, n: &S, peer_id: &str, wire: DhtWire) {
        let Ok(env) = Envelope::new(MessageType::Dht, n.network_id(), &wire) else {
            return;
        };
        if let Err(e) = n.send_to_peer(peer_id, env).await {
            trace!(peer = %short(peer_id), error = %e, "dht reply dropped");
        }
    }

    fn closest_entries(&self, target: &NodeId, k: usize) -> Vec<DhtNodeEntry> {
        self.rt
            .closest(target, k)
            .into_iter()
            .map(|e| DhtNodeEntry {
                node_id: e.node_id.to_hex(),
                peer_id: e.peer_id,
                addr: e.addr,
                name: e.name,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Iterative lookups
    // ------------------------------------------------------------------

    /// Iterative FIND_NODE toward `target_hex`. Returns the k candidates
    /// closest to the target that the lookup converged on.
    pub async fn iterative_find_node<S: Sender + ?Sized>(
        &self,
        n: &S,
        target_hex: &str,
        cfg: LookupConfig,
    ) -> Result<Vec<DhtNodeEntry>, DhtError> {
        let target = NodeId::from_hex(target_hex).map_err(|_| DhtError::BadTarget)?;
        match self.run_lookup(n, target, None, cfg).await {
            LookupOutcome::Nodes(nodes) => Ok(nodes),
            LookupOutcome::Record(_) => unreachable!("node lookup cannot yield a record"),
        }
    }

    /// Iterative FIND_VALUE. Checks the local store first; a valid record
    /// from any queried peer terminates the lookup and is cached locally.
    pub async fn get_value<S: Sender + ?Sized>(
        &self,
        n: &S,
        key: [u8; 32],
        cfg: LookupConfig,
    ) -> Result<Option<DhtRecord>, DhtError> {
        if let Some(rec) = self.records.get(&key, now_unix()) {
            return Ok(Some(rec));
        }
        let target = NodeId::from_bytes(key);
        match self.run_lookup(n, target, Some(key), cfg).await {
            LookupOutcome::Record(rec) => Ok(Some(rec)),
            LookupOutcome::Nodes(_) => Ok(None),
        }
    }

    async fn run_lookup<S: Sender + ?Sized>(
        &self,
        n: &S,
        target: NodeId,
        value_key: Option<[u8; 32]>,
        cfg: LookupConfig,
    ) -> LookupOutcome {
        let target_hex = target.to_hex();
        let key_hex = value_key.map(hex::encode).unwrap_or_default();
        let pool_cap = cfg.k * LOOKUP_POOL_FACTOR;

        let mut candidates: Vec<Candidate> = self
            .rt
            .closest(&target, cfg.k)
            .into_iter()
            .map(|e| Candidate {
                entry: DhtNodeEntry {
                    node_id: e.node_id.to_hex(),
                    peer_id: e.peer_id,
                    addr: e.addr,
                    name: e.name,
                },
                dist: e.node_id.xor_distance(&target),
                state: CandState::Unqueried,
            })
            .collect();

        let mut seen: HashSet<String> = candidates.iter().map(|c| c.entry.node_id.clone()).collect();

        for round in 0..cfg.max_rounds {
            candidates.sort_by(|a, b| distance_cmp(&a.dist, &b.dist));
            if candidates.len() > pool_cap {
                candidates.truncate(pool_cap);
            }
            if candidates.is_empty() {
                break;
            }

            // Select up to α unqueried candidates from the closest 2k.
            let window = candidates.len().min(cfg.k * 2);
            let wave: Vec<usize> = candidates[..window]
                .iter()
                .enumerate()
                .filter(|(_, c)| c.state == CandState::Unqueried)
                .map(|(i, _)| i)
                .take(cfg.alpha)
                .collect();

            if wave.is_empty() {
                // Terminate once the top k holds nothing left to query.
                let top = candidates.len().min(cfg.k);
                let left = candidates[..top]
                    .iter()
                    .any(|c| c.state == CandState::Unqueried);
                if !left {
                    break;
                }
                continue;
            }

            for &i in &wave {
                candidates[i].state = CandState::Querying;
            }

            let queries: Vec<_> = wave
                .iter()
                .map(|&i| {
                    let peer_id = candidates[i].entry.peer_id.clone();
                    let target_hex = target_hex.clone();
                    let key_hex = key_hex.clone();
                    async move {
                        let result = if value_key.is_some() {
                            self.query_find_value(n, &peer_id, &key_hex, cfg.rpc_timeout).await
                        } else {
                            self.query_find_node(n, &peer_id, &target_hex, cfg.rpc_timeout).await
                        };
                        (i, result)
                    }
                })
                .collect();

            trace!(
                target = %short(&target_hex),
                round,
                wave = queries.len(),
                pool = candidates.len(),
                "lookup round"
            );

            for (i, result) in join_all(queries).await {
                let wire = match result {
                    Ok(wire) => wire,
                    Err(_) => {
                        candidates[i].state = CandState::Failed;
                        continue;
                    }
                };

                // FIND_VALUE short-circuit: a validated record wins.
                if let (Some(key), Some(rec)) = (value_key, &wire.record) {
                    if validate_record_against_key(&key, rec, now_unix()).is_ok() {
                        let _ = self.records.put(key, rec);
                        return LookupOutcome::Record(rec.clone());
                    }
                    candidates[i].state = CandState::Failed;
                    continue;
                }

                candidates[i].state = CandState::Done;

                let mut nodes = wire.nodes;
                if nodes.len() > cfg.k * 2 {
                    nodes.truncate(cfg.k * 2);
                }
                for nd in nodes {
                    let Some(node_id) = valid_wire_node(&nd) else {
                        continue;
                    };
                    if node_id == self.self_node || !seen.insert(nd.node_id.clone()) {
                        continue;
                    }

                    self.observe_peer(n, &nd.peer_id, &nd.addr, &nd.name).await;

                    candidates.push(Candidate {
                        dist: node_id.xor_distance(&target),
                        entry: nd,
                        state: CandState::Unqueried,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| distance_cmp(&a.dist, &b.dist));
        candidates.truncate(cfg.k);
        LookupOutcome::Nodes(candidates.into_iter().map(|c| c.entry).collect())
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Build and publish an immutable record keyed by `sha256(value)`.
    pub async fn put_immutable<S: Sender + ?Sized>(
        &self,
        n: &S,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<[u8; 32]> {
        let key = key_from_immutable(&value);
        let now = now_unix();
        let rec = DhtRecord {
            record_type: RecordType::Immutable,
            value,
            created_unix: now,
            expires_unix: ttl.map_or(0, |t| now + t.as_secs() as i64),
            pubkey: None,
            seq: 0,
            sig: None,
            name: String::new(),
        };
        self.publish_record(n, key, &rec).await?;
        Ok(key)
    }

    /// Build, sign, and publish a mutable record keyed by
    /// `sha256(pubkey ∥ name)`.
    pub async fn put_mutable<S: Sender + ?Sized>(
        &self,
        n: &S,
        id: &Identity,
        name: &str,
        value: Vec<u8>,
        seq: u64,
        ttl: Option<Duration>,
    ) -> Result<[u8; 32]> {
        let pubkey = id.signing_public();
        let key = key_from_mutable(&pubkey, name);
        let now = now_unix();
        let expires = ttl.map_or(0, |t| now + t.as_secs() as i64);
        let sig = sign_mutable(id, &key, seq, expires, &value);
        let rec = DhtRecord {
            record_type: RecordType::Mutable,
            value,
            created_unix: now,
            expires_unix: expires,
            pubkey: Some(pubkey.to_vec()),
            seq,
            sig: Some(sig.to_vec()),
            name: name.to_string(),
        };
        self.publish_record(n, key, &rec).await?;
        Ok(key)
    }

    /// Validate, store locally, mark as owned for republish, then STORE to
    /// the k peers closest to the key with α-bounded parallelism.
    /// Best-effort: the first error observed is returned.
    pub async fn publish_record<S: Sender + ?Sized>(
        &self,
        n: &S,
        key: [u8; 32],
        rec: &DhtRecord,
    ) -> Result<()> {
        validate_record_against_key(&key, rec, now_unix())?;
        self.records.put(key, rec)?;
        self.owned.lock().unwrap_or_else(|e| e.into_inner()).insert(
            key,
            OwnedState {
                next_republish: Instant::now() + REPUBLISH_INTERVAL,
            },
        );

        let cfg = LookupConfig::default();
        let alpha = cfg.alpha;
        let key_hex = hex::encode(key);
        let target_hex = NodeId::from_bytes(key).to_hex();
        let mut nodes = self.iterative_find_node(n, &target_hex, cfg).await?;
        nodes.truncate(DEFAULT_K);

        let mut first_err: Option<anyhow::Error> = None;
        for chunk in nodes.chunks(alpha) {
            let stores: Vec<_> = chunk
                .iter()
                .map(|nd| self.query_store(n, &nd.peer_id, &key_hex, rec, RPC_TIMEOUT))
                .collect();
            for result in join_all(stores).await {
                let err = match result {
                    Ok(w) if w.kind == Some(DhtKind::StoreResult) && w.ok == Some(false) => {
                        Some(anyhow!("remote rejected store: {}", w.error))
                    }
                    Ok(_) => None,
                    Err(e) => Some(e.into()),
                };
                if let (Some(e), None) = (err, &first_err) {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Sweep expired records and republish owned ones on their cadence.
    /// Runs until cancelled.
    pub async fn run_record_maintenance<S: Sender + ?Sized>(&self, n: &S, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        let mut republish = tokio::time::interval(REPUBLISH_INTERVAL);
        sweep.tick().await;
        republish.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sweep.tick() => {
                    let purged = self.records.sweep_expired(now_unix());
                    if purged > 0 {
                        debug!(purged, "swept expired records");
                    }
                }
                _ = republish.tick() => {
                    self.republish_owned(n).await;
                }
            }
        }
    }

    async fn republish_owned<S: Sender + ?Sized>(&self, n: &S) {
        let now = Instant::now();
        let due: Vec<[u8; 32]> = {
            let owned = self.owned.lock().unwrap_or_else(|e| e.into_inner());
            owned
                .iter()
                .filter(|(_, st)| st.next_republish <= now)
                .map(|(k, _)| *k)
                .collect()
        };

        for key in due {
            let Some(rec) = self.records.get(&key, now_unix()) else {
                // Expired or deleted underneath us; stop owning it.
                self.owned
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
                continue;
            };
            if let Err(e) = self.publish_record(n, key, &rec).await {
                debug!(key = %short(&hex::encode(key)), error = %e, "republish failed");
            }
            self.owned.lock().unwrap_or_else(|e| e.into_inner()).insert(
                key,
                OwnedState {
                    next_republish: Instant::now() + REPUBLISH_INTERVAL,
                },
            );
        }
    }

    /// Periodic random-target lookups keep sparse buckets populated.
    pub async fn run_bucket_refresh<S: Sender + ?Sized>(&self, n: &S, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(BUCKET_REFRESH_INTERVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    let target = NodeId::random().to_hex();
                    if let Err(e) = self.iterative_find_node(n, &target, LookupConfig::default()).await {
                        warn!(error = %e, "bucket refresh lookup failed");
                    }
                }
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CandState {
    Unqueried,
    Querying,
    Done,
    Failed,
}

struct Candidate {
    entry: DhtNodeEntry,
    dist: [u8; 32],
    state: CandState,
}

enum LookupOutcome {
    Nodes(Vec<DhtNodeEntry>),
    Record(DhtRecord),
}

/// Sanity-check a wire node entry: host:port form and a self-certifying
/// node id (`node_id == sha256(decode(peer_id))`).
fn valid_wire_node(nd: &DhtNodeEntry) -> Option<NodeId> {
    if nd.node_id.is_empty() || nd.peer_id.is_empty() || nd.addr.is_empty() {
        return None;
    }
    let (host, port) = nd.addr.rsplit_once(':')?;
    if host.is_empty() || port.is_empty() {
        return None;
    }
    let claimed = NodeId::from_hex(&nd.node_id).ok()?;
    let derived = NodeId::from_user_hex(&nd.peer_id).ok()?;
    (claimed == derived).then_some(claimed)
}

fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}
