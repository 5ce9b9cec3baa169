//! # Node Orchestrator
//!
//! A [`Node`] combines the underlying components — secure transport, peer
//! registry, DHT engine, gossip relay, seed registry — behind one handle.
//!
//! ## Quick start
//!
//! ```ignore
//! let node = Node::start(NodeConfig {
//!     name: "alice".into(),
//!     bind_addr: "127.0.0.1:0".into(),
//!     bootstraps: vec!["10.0.0.5:4000".into()],
//!     ..Default::default()
//! }).await?;
//!
//! let mut incoming = node.incoming().unwrap();
//! node.broadcast(&Gossip { id: new_msg_id(), channel: "global".into(), body: json!({}) })?;
//! while let Some(env) = incoming.recv().await { /* ... */ }
//! ```
//!
//! ## Task structure
//!
//! The node runs an accept loop, a bootstrap discovery loop, a DHT
//! expansion loop, and the record-maintenance loops. Each connected peer
//! adds a read task and a write task. Every loop selects on the node's
//! cancellation token; per-peer failures never outlive the peer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::dht::{Dht, LookupConfig, PeerContact, DEFAULT_K, PING_TIMEOUT};
use crate::gossip::SeenCache;
use crate::identity::{Identity, NodeId};
use crate::messages::{
    DhtNodeEntry, DhtRecord, Envelope, Gossip, Identify, MessageType, NatRegister, NatRelay,
    PeerInfo, PeerList, PROTOCOL_VERSION,
};
use crate::protocols::Sender;
use crate::store::{DhtStore, PeerStore};
use crate::transport::{self, LocalIdentity, Peer, SendPolicy};

/// Pause after a transient accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Bootstrap re-dial cadence.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(20);

/// DHT expansion cadence and targets.
const DHT_BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(3);
const DHT_BOOTSTRAP_MIN_PEERS: usize = 6;
const DHT_BOOTSTRAP_LOOKUPS_PER_TICK: usize = 2;

/// Cold-start dial limit from the persisted address store.
const COLD_START_DIAL_LIMIT: usize = 8;

/// Depth of the app-facing inbound queue and the event queue.
const INCOMING_QUEUE_DEPTH: usize = 128;
const EVENT_QUEUE_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub enum Event {
    PeerConnected {
        network_id: String,
        user_id: String,
        name: String,
        addr: String,
    },
    PeerDisconnected {
        network_id: String,
        user_id: String,
        name: String,
        addr: String,
    },
}

/// Read-only view of a connected peer.
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub network_id: String,
    pub user_id: String,
    pub name: String,
    pub addr: String,
}

pub struct NodeConfig {
    /// User-facing display name.
    pub name: String,
    /// Bind address, e.g. `127.0.0.1:0` for a random port.
    pub bind_addr: String,
    /// Known peers to dial on startup and re-dial while disconnected.
    pub bootstraps: Vec<String>,
    /// Protocol version string; mismatched hellos are rejected.
    pub protocol: String,
    /// Seed nodes keep a user registry and forward NAT relay envelopes.
    pub is_seed: bool,
    /// Persisted dialable-address book, if any.
    pub peerstore_path: Option<std::path::PathBuf>,
    /// Persisted DHT address book, if any.
    pub dhtstore_path: Option<std::path::PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "anon".into(),
            bind_addr: "127.0.0.1:0".into(),
            bootstraps: Vec::new(),
            protocol: PROTOCOL_VERSION.into(),
            is_seed: false,
            peerstore_path: None,
            dhtstore_path: None,
        }
    }
}

type TakeOnce<T> = StdMutex<Option<mpsc::Receiver<T>>>;

struct NodeInner {
    cfg: NodeConfig,
    identity: Identity,
    listen_addr: String,

    dht: Dht,
    seen: SeenCache,

    /// Connected peers by NetworkID.
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    /// UserID → NetworkID for DHT and user-addressed sends.
    peers_by_user: RwLock<HashMap<String, String>>,
    /// Seed-only: registered UserID → NetworkID for NAT relay.
    nat_registry: RwLock<HashMap<String, String>>,

    incoming_tx: mpsc::Sender<Envelope>,
    incoming_rx: TakeOnce<Envelope>,
    events_tx: mpsc::Sender<Event>,
    events_rx: TakeOnce<Event>,

    peer_store: Option<PeerStore>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Bring a node online: bind the listener, then launch the accept,
    /// discovery, DHT-expansion, and record-maintenance loops.
    pub async fn start(cfg: NodeConfig) -> Result<Self> {
        let identity = Identity::generate()?;

        let listener = TcpListener::bind(&cfg.bind_addr)
            .await
            .with_context(|| format!("bind {}", cfg.bind_addr))?;
        let listen_addr = listener.local_addr()?.to_string();

        let mut dht = Dht::new(identity.user_id(), DEFAULT_K)?;
        if let Some(path) = &cfg.dhtstore_path {
            dht = dht.with_addr_store(DhtStore::open(path));
        }
        let peer_store = cfg.peerstore_path.as_ref().map(PeerStore::open);

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let node = Node {
            inner: Arc::new(NodeInner {
                cfg,
                identity,
                listen_addr,
                dht,
                seen: SeenCache::default(),
                peers: RwLock::new(HashMap::new()),
                peers_by_user: RwLock::new(HashMap::new()),
                nat_registry: RwLock::new(HashMap::new()),
                incoming_tx,
                incoming_rx: StdMutex::new(Some(incoming_rx)),
                events_tx,
                events_rx: StdMutex::new(Some(events_rx)),
                peer_store,
                cancel: CancellationToken::new(),
            }),
        };

        info!(
            addr = %node.inner.listen_addr,
            network_id = %transport::short(node.inner.identity.network_id()),
            user_id = %transport::short(node.inner.identity.user_id()),
            seed = node.inner.cfg.is_seed,
            "node listening"
        );

        tokio::spawn(node.clone().accept_loop(listener));
        tokio::spawn(node.clone().discovery_loop());
        tokio::spawn(node.clone().dht_bootstrap_loop());
        {
            let node = node.clone();
            tokio::spawn(async move {
                node.inner
                    .dht
                    .run_record_maintenance(&node, node.inner.cancel.clone())
                    .await;
            });
        }
        {
            let node = node.clone();
            tokio::spawn(async move {
                node.inner
                    .dht
                    .run_bucket_refresh(&node, node.inner.cancel.clone())
                    .await;
            });
        }

        // Cold start: with no bootstraps, fall back to the persisted
        // address book.
        if node.inner.cfg.bootstraps.is_empty() {
            let addrs = node.inner.dht.bootstrap_addrs(COLD_START_DIAL_LIMIT);
            for addr in addrs {
                let node = node.clone();
                tokio::spawn(async move {
                    let _ = node.connect_to(&addr).await;
                });
            }
        }

        Ok(node)
    }

    /// Cancel every loop and tear down all peers.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let ids: Vec<String> = {
            let peers = self.inner.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.keys().cloned().collect()
        };
        for id in ids {
            self.remove_peer(&id);
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn listen_addr(&self) -> &str {
        &self.inner.listen_addr
    }

    pub fn user_id(&self) -> &str {
        self.inner.identity.user_id()
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.identity.node_id()
    }

    pub fn name(&self) -> &str {
        &self.inner.cfg.name
    }

    pub fn dht(&self) -> &Dht {
        &self.inner.dht
    }

    pub fn peer_count(&self) -> usize {
        self.inner
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn snapshot_peers(&self) -> Vec<PeerSnapshot> {
        let peers = self.inner.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .map(|p| PeerSnapshot {
                network_id: p.network_id.clone(),
                user_id: p.user_id(),
                name: p.name(),
                addr: p.addr.clone(),
            })
            .collect()
    }

    /// Messages for higher-level app logic: gossip, inbound NAT relays,
    /// and unknown envelope types.
    pub fn incoming(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inner
            .incoming_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Peer lifecycle events; the receiver can be taken once.
    pub fn events(&self) -> Option<mpsc::Receiver<Event>> {
        self.inner
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn emit(&self, event: Event) {
        // Backpressure on the event queue silently drops: observers are
        // advisory, the overlay is not.
        let _ = self.inner.events_tx.try_send(event);
    }

    // ------------------------------------------------------------------
    // Dialing and session lifecycle
    // ------------------------------------------------------------------

    /// Dial a remote listener and run the session to completion in the
    /// background.
    pub async fn connect_to(&self, addr: &str) -> Result<()> {
        if addr.is_empty() {
            bail!("empty dial address");
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Some(store) = &self.inner.peer_store {
                    store.note_success(addr);
                }
                let node = self.clone();
                tokio::spawn(node.handle_conn(stream, false));
                Ok(())
            }
            Err(e) => {
                if let Some(store) = &self.inner.peer_store {
                    store.note_failure(addr);
                }
                debug!(addr, error = %e, "dial failed");
                Err(e.into())
            }
        }
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                result = listener.accept() => match result {
                    Ok((stream, _)) => {
                        let node = self.clone();
                        tokio::spawn(node.handle_conn(stream, true));
                    }
                    Err(e) => {
                        if self.inner.cancel.is_cancelled() {
                            return;
                        }
                        warn!(error = %e, "accept error");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    fn handle_conn(
        self,
        stream: TcpStream,
        inbound: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.handle_conn_inner(stream, inbound))
    }

    async fn handle_conn_inner(self, stream: TcpStream, inbound: bool) {
        let local = LocalIdentity {
            identity: &self.inner.identity,
            name: &self.inner.cfg.name,
            listen_addr: &self.inner.listen_addr,
            protocol: &self.inner.cfg.protocol,
        };
        let setup = match transport::establish(stream, local, inbound).await {
            Ok(setup) => setup,
            Err(e) => {
                debug!(inbound, error = %e, "handshake failed");
                return;
            }
        };

        let peer = setup.peer.clone();
        if !self.install_peer(&peer) {
            // First connection wins; the losing stream closes silently.
            debug!(peer = %transport::short(&peer.network_id), "duplicate peer; closing");
            return;
        }

        let user_id = peer.user_id();
        if !user_id.is_empty() {
            self.inner.dht.on_peer_seen(&user_id, &peer.addr, &peer.name());
        }

        tokio::spawn(transport::write_loop(
            peer.clone(),
            setup.writer,
            setup.send_rx,
        ));

        info!(
            peer = %transport::short(&peer.network_id),
            name = %peer.name(),
            addr = %peer.addr,
            inbound,
            "peer connected"
        );
        self.emit(Event::PeerConnected {
            network_id: peer.network_id.clone(),
            user_id,
            name: peer.name(),
            addr: peer.addr.clone(),
        });

        if !self.inner.cfg.is_seed {
            self.send_nat_register(&peer);
        }
        self.send_identify(&peer);
        self.send_peer_list(&peer);

        self.run_peer(peer, setup.reader).await;
    }

    fn install_peer(&self, peer: &Arc<Peer>) -> bool {
        if peer.network_id == self.inner.identity.network_id() {
            return false;
        }
        {
            let mut peers = self.inner.peers.write().unwrap_or_else(|e| e.into_inner());
            if peers.contains_key(&peer.network_id) {
                return false;
            }
            peers.insert(peer.network_id.clone(), peer.clone());
        }
        let user_id = peer.user_id();
        if !user_id.is_empty() {
            self.inner
                .peers_by_user
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(user_id, peer.network_id.clone());
        }
        true
    }

    /// Idempotent removal: the first caller cancels the peer's tasks,
    /// clears every index, and emits the disconnect event exactly once.
    fn remove_peer(&self, network_id: &str) {
        let peer = {
            let mut peers = self.inner.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.remove(network_id)
        };
        let Some(peer) = peer else { return };
        if !peer.begin_teardown() {
            return;
        }

        let user_id = peer.user_id();
        if !user_id.is_empty() {
            let mut by_user = self
                .inner
                .peers_by_user
                .write()
                .unwrap_or_else(|e| e.into_inner());
            if by_user.get(&user_id).map(String::as_str) == Some(network_id) {
                by_user.remove(&user_id);
            }
        }
        {
            let mut registry = self
                .inner
                .nat_registry
                .write()
                .unwrap_or_else(|e| e.into_inner());
            registry.retain(|_, nid| nid != network_id);
        }

        peer.cancel.cancel();
        info!(peer = %transport::short(network_id), "peer removed");
        self.emit(Event::PeerDisconnected {
            network_id: network_id.to_string(),
            user_id,
            name: peer.name(),
            addr: peer.addr.clone(),
        });
    }

    async fn run_peer(self, peer: Arc<Peer>, mut reader: crate::noise::SecureReader<TcpStream>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = peer.cancel.cancelled() => break,
                result = reader.read_record() => {
                    let bytes = match result {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            debug!(peer = %transport::short(&peer.network_id), error = %e, "read failed");
                            break;
                        }
                    };
                    match serde_json::from_slice::<Envelope>(&bytes) {
                        Ok(env) => self.handle_envelope(&peer, env).await,
                        Err(e) => {
                            debug!(peer = %transport::short(&peer.network_id), error = %e, "bad envelope");
                            break;
                        }
                    }
                }
            }
        }
        self.remove_peer(&peer.network_id);
    }

    // ------------------------------------------------------------------
    // Envelope dispatch
    // ------------------------------------------------------------------

    async fn handle_envelope(&self, peer: &Arc<Peer>, env: Envelope) {
        match env.msg_type {
            MessageType::PeerList => {
                let Ok(list) = env.parse_payload::<PeerList>() else {
                    debug!(peer = %transport::short(&peer.network_id), "bad peer list");
                    return;
                };
                for info in list.peers {
                    if info.id == self.inner.identity.network_id() || info.addr.is_empty() {
                        continue;
                    }
                    if self.has_peer(&info.id) {
                        continue;
                    }
                    debug!(id = %transport::short(&info.id), addr = %info.addr, "discovery: dialing listed peer");
                    let node = self.clone();
                    tokio::spawn(async move {
                        let _ = node.connect_to(&info.addr).await;
                    });
                }
            }

            MessageType::Gossip => {
                let Ok(gossip) = env.parse_payload::<Gossip>() else {
                    debug!(peer = %transport::short(&peer.network_id), "bad gossip payload");
                    return;
                };
                if self.inner.seen.seen(&gossip.id) {
                    trace!(id = %gossip.id, "gossip suppressed");
                    return;
                }
                // At most one delivery per id; app-queue overflow drops.
                let _ = self.inner.incoming_tx.try_send(env.clone());
                self.relay(&peer.network_id, env);
            }

            MessageType::Identify => {
                let Ok(ident) = env.parse_payload::<Identify>() else {
                    debug!(peer = %transport::short(&peer.network_id), "bad identify");
                    return;
                };
                peer.set_identify(&ident.name, &ident.user_pub);
                let user_id = peer.user_id();
                if !user_id.is_empty() {
                    self.inner
                        .peers_by_user
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(user_id.clone(), peer.network_id.clone());
                    self.inner.dht.on_peer_seen(&user_id, &peer.addr, &ident.name);
                }
            }

            MessageType::Dht => {
                let Ok(wire) = env.parse_payload::<crate::messages::DhtWire>() else {
                    // Malformed DHT payloads are dropped without replying.
                    debug!(peer = %transport::short(&peer.network_id), "bad dht payload");
                    return;
                };
                let user_id = peer.user_id();
                if user_id.is_empty() {
                    return;
                }
                let contact = PeerContact {
                    peer_id: user_id,
                    addr: peer.addr.clone(),
                    name: peer.name(),
                };
                Box::pin(self.inner.dht.handle_wire(self, &contact, wire)).await;
            }

            MessageType::NatRegister => self.handle_nat_register(peer, &env),
            MessageType::NatRelay => self.handle_nat_relay(peer, env),

            MessageType::Hello | MessageType::Unknown => {
                let _ = self.inner.incoming_tx.try_send(env);
            }
        }
    }

    fn has_peer(&self, network_id: &str) -> bool {
        self.inner
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(network_id)
    }

    fn has_peer_addr(&self, addr: &str) -> bool {
        let peers = self.inner.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .any(|p| p.addr == addr || p.observed_addr == addr)
    }

    fn connected_to_user(&self, user_id: &str) -> bool {
        self.inner
            .peers_by_user
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(user_id)
    }

    // ------------------------------------------------------------------
    // Gossip
    // ------------------------------------------------------------------

    /// Flood a gossip payload to every connected peer. The own id is
    /// recorded as seen so echoes are never re-delivered locally.
    pub fn broadcast(&self, gossip: &Gossip) -> Result<()> {
        self.inner.seen.seen(&gossip.id);
        let env = Envelope::new(
            MessageType::Gossip,
            self.inner.identity.network_id(),
            gossip,
        )?;
        self.relay(self.inner.identity.network_id(), env);
        Ok(())
    }

    /// Re-send `env` to every connected peer except the origin of this
    /// hop. The peer slice is snapshotted first so no lock is held while
    /// enqueueing.
    fn relay(&self, origin_network_id: &str, env: Envelope) {
        let peers: Vec<Arc<Peer>> = {
            let peers = self.inner.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.values().cloned().collect()
        };
        for p in peers {
            if p.network_id == origin_network_id {
                continue;
            }
            p.send(env.clone(), SendPolicy::Disconnect);
        }
    }

    // ------------------------------------------------------------------
    // Post-install sends
    // ------------------------------------------------------------------

    fn send_peer_list(&self, peer: &Arc<Peer>) {
        let peers: Vec<PeerInfo> = {
            let peers = self.inner.peers.read().unwrap_or_else(|e| e.into_inner());
            peers
                .values()
                .map(|p| PeerInfo {
                    id: p.network_id.clone(),
                    name: p.name(),
                    addr: p.addr.clone(),
                    public_addr: if self.inner.cfg.is_seed {
                        p.observed_addr.clone()
                    } else {
                        String::new()
                    },
                })
                .collect()
        };
        if let Ok(env) = Envelope::new(
            MessageType::PeerList,
            self.inner.identity.network_id(),
            &PeerList { peers },
        ) {
            peer.send(env, SendPolicy::Disconnect);
        }
    }

    fn send_identify(&self, peer: &Arc<Peer>) {
        if let Ok(env) = Envelope::new(
            MessageType::Identify,
            self.inner.identity.network_id(),
            &Identify {
                name: self.inner.cfg.name.clone(),
                user_pub: self.inner.identity.signing_public().to_vec(),
            },
        ) {
            peer.send(env, SendPolicy::Disconnect);
        }
    }

    fn send_nat_register(&self, peer: &Arc<Peer>) {
        if let Ok(env) = Envelope::new(
            MessageType::NatRegister,
            self.inner.identity.network_id(),
            &NatRegister {
                user_id: self.inner.identity.user_id().to_string(),
                name: self.inner.cfg.name.clone(),
            },
        ) {
            peer.send(env, SendPolicy::Disconnect);
        }
    }

    // ------------------------------------------------------------------
    // Seed registry and relay
    // ------------------------------------------------------------------

    fn handle_nat_register(&self, peer: &Arc<Peer>, env: &Envelope) {
        if !self.inner.cfg.is_seed {
            return;
        }
        let Ok(reg) = env.parse_payload::<NatRegister>() else {
            debug!(peer = %transport::short(&peer.network_id), "bad nat register");
            return;
        };
        if reg.user_id.is_empty() {
            debug!(peer = %transport::short(&peer.network_id), "nat register missing user_id");
            return;
        }
        self.inner
            .nat_registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(reg.user_id.clone(), peer.network_id.clone());
        peer.set_name_if_empty(&reg.name);
        debug!(user = %transport::short(&reg.user_id), peer = %transport::short(&peer.network_id), "nat registered");
    }

    fn handle_nat_relay(&self, peer: &Arc<Peer>, env: Envelope) {
        let Ok(relay) = env.parse_payload::<NatRelay>() else {
            debug!(peer = %transport::short(&peer.network_id), "bad nat relay");
            return;
        };

        if !self.inner.cfg.is_seed {
            // Addressed to us; the application decides what it means.
            let _ = self.inner.incoming_tx.try_send(env);
            return;
        }

        if relay.to_user_id.is_empty() {
            return;
        }
        let target_network = {
            let registry = self
                .inner
                .nat_registry
                .read()
                .unwrap_or_else(|e| e.into_inner());
            registry.get(&relay.to_user_id).cloned()
        };
        let Some(target_network) = target_network else {
            debug!(user = %transport::short(&relay.to_user_id), "nat relay: target not registered");
            return;
        };
        let target = {
            let peers = self.inner.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.get(&target_network).cloned()
        };
        let Some(target) = target else { return };

        // Forward the same payload; from_id becomes the original sender's
        // NetworkID so the target can tell who is calling.
        let forwarded = Envelope {
            msg_type: MessageType::NatRelay,
            from_id: peer.network_id.clone(),
            payload: env.payload,
        };
        target.send(forwarded, SendPolicy::Disconnect);
    }

    /// Send an envelope to a connected peer addressed by UserID.
    pub fn send_to_user(&self, user_id: &str, env: Envelope) -> Result<()> {
        let network_id = self
            .inner
            .peers_by_user
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned()
            .with_context(|| format!("unknown user {}", transport::short(user_id)))?;
        let peer = self
            .inner
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&network_id)
            .cloned()
            .with_context(|| format!("unknown peer {}", transport::short(&network_id)))?;
        peer.send(env, SendPolicy::Disconnect);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Discovery loops
    // ------------------------------------------------------------------

    async fn discovery_loop(self) {
        for addr in self.inner.cfg.bootstraps.clone() {
            debug!(addr = %addr, "bootstrap: dialing");
            let _ = self.connect_to(&addr).await;
        }

        let mut tick = tokio::time::interval(DISCOVERY_INTERVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = tick.tick() => {
                    for addr in self.inner.cfg.bootstraps.clone() {
                        if addr.is_empty() || self.has_peer_addr(&addr) {
                            continue;
                        }
                        debug!(addr = %addr, "discovery: re-dialing bootstrap");
                        let _ = self.connect_to(&addr).await;
                    }
                }
            }
        }
    }

    /// While the mesh is small, look up random targets and dial whatever
    /// the lookups surface.
    async fn dht_bootstrap_loop(self) {
        let mut tick = tokio::time::interval(DHT_BOOTSTRAP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = tick.tick() => {
                    let count = self.peer_count();
                    if count == 0 || count >= DHT_BOOTSTRAP_MIN_PEERS {
                        continue;
                    }

                    for _ in 0..DHT_BOOTSTRAP_LOOKUPS_PER_TICK {
                        let target = NodeId::random().to_hex();
                        let nodes = match self
                            .inner
                            .dht
                            .iterative_find_node(&self, &target, LookupConfig::default())
                            .await
                        {
                            Ok(nodes) => nodes,
                            Err(e) => {
                                trace!(error = %e, "bootstrap lookup failed");
                                continue;
                            }
                        };

                        for nd in nodes {
                            if nd.addr.is_empty()
                                || nd.node_id == self.inner.identity.node_id().to_hex()
                            {
                                continue;
                            }
                            if self.connected_to_user(&nd.peer_id) || self.has_peer_addr(&nd.addr) {
                                continue;
                            }
                            debug!(addr = %nd.addr, "dht bootstrap: dialing learned peer");
                            let _ = self.connect_to(&nd.addr).await;
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // DHT front door
    // ------------------------------------------------------------------

    /// Liveness-check a connected peer by UserID.
    pub async fn dht_ping(&self, user_id: &str) -> Result<()> {
        self.inner.dht.query_ping(self, user_id, PING_TIMEOUT).await?;
        Ok(())
    }

    /// Iterative FIND_NODE toward a hex target.
    pub async fn dht_find_node(&self, target_hex: &str) -> Result<Vec<DhtNodeEntry>> {
        Ok(self
            .inner
            .dht
            .iterative_find_node(self, target_hex, LookupConfig::default())
            .await?)
    }

    /// Publish an immutable record; returns its key.
    pub async fn dht_put_immutable(
        &self,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<[u8; 32]> {
        self.inner.dht.put_immutable(self, value, ttl).await
    }

    /// Sign and publish a mutable record under this node's identity.
    pub async fn dht_put_mutable(
        &self,
        name: &str,
        value: Vec<u8>,
        seq: u64,
        ttl: Option<Duration>,
    ) -> Result<[u8; 32]> {
        self.inner
            .dht
            .put_mutable(self, &self.inner.identity, name, value, seq, ttl)
            .await
    }

    /// Iterative FIND_VALUE.
    pub async fn dht_get(&self, key: [u8; 32]) -> Result<Option<DhtRecord>> {
        Ok(self
            .inner
            .dht
            .get_value(self, key, LookupConfig::default())
            .await?)
    }
}

impl Node {
    /// NetworkID accessor (hex of the Noise static key).
    pub fn network_id(&self) -> &str {
        self.inner.identity.network_id()
    }
}

#[async_trait]
impl Sender for Node {
    fn network_id(&self) -> &str {
        self.inner.identity.network_id()
    }

    async fn send_to_peer(&self, peer_id: &str, env: Envelope) -> Result<()> {
        let network_id = self
            .inner
            .peers_by_user
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .cloned()
            .with_context(|| format!("unknown peer {}", transport::short(peer_id)))?;
        let peer = self
            .inner
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&network_id)
            .cloned()
            .with_context(|| format!("peer {} not connected", transport::short(&network_id)))?;
        peer.send(env, SendPolicy::Disconnect);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::new_msg_id;
    use crate::transport::test_peer;

    fn test_gossip(id: &str) -> Gossip {
        Gossip {
            id: id.to_string(),
            channel: "global".into(),
            body: serde_json::json!({"text": "hi"}),
        }
    }

    async fn quiet_node(is_seed: bool) -> Node {
        Node::start(NodeConfig {
            is_seed,
            ..Default::default()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn backpressure_removes_slow_peer_and_node_survives() {
        let node = quiet_node(false).await;
        let mut events = node.events().unwrap();

        // A peer whose queue is never drained, and a healthy peer that is.
        let (stalled, stalled_rx) = test_peer(&"11".repeat(32), &"aa".repeat(32), "10.0.0.1:1");
        let (healthy, mut healthy_rx) = test_peer(&"22".repeat(32), &"bb".repeat(32), "10.0.0.2:1");
        assert!(node.install_peer(&stalled));
        assert!(node.install_peer(&healthy));

        // Mirror the session supervisor: removal follows cancellation.
        {
            let node = node.clone();
            let stalled = stalled.clone();
            tokio::spawn(async move {
                stalled.cancel.cancelled().await;
                node.remove_peer(&stalled.network_id);
            });
        }
        {
            let node = node.clone();
            let healthy = healthy.clone();
            tokio::spawn(async move {
                healthy.cancel.cancelled().await;
                node.remove_peer(&healthy.network_id);
            });
        }
        // Drain the healthy peer's queue continuously.
        tokio::spawn(async move { while healthy_rx.recv().await.is_some() {} });

        // The stalled queue fills; the disconnect policy evicts the peer.
        for i in 0..200 {
            node.broadcast(&test_gossip(&format!("g-{i}"))).unwrap();
            tokio::task::yield_now().await;
        }
        drop(stalled_rx);

        let event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Some(Event::PeerDisconnected { network_id, .. }) => break network_id,
                    Some(_) => continue,
                    None => panic!("event stream ended"),
                }
            }
        })
        .await
        .expect("expected a disconnect event");
        assert_eq!(event, "11".repeat(32));

        // The node keeps serving the healthy peer.
        assert_eq!(node.peer_count(), 1);
        node.broadcast(&test_gossip("after")).unwrap();
        node.shutdown().await;
    }

    #[tokio::test]
    async fn relay_skips_origin_and_dedups() {
        let node = quiet_node(false).await;
        let mut incoming = node.incoming().unwrap();

        let (origin, mut origin_rx) = test_peer(&"11".repeat(32), &"aa".repeat(32), "10.0.0.1:1");
        let (other, mut other_rx) = test_peer(&"22".repeat(32), &"bb".repeat(32), "10.0.0.2:1");
        assert!(node.install_peer(&origin));
        assert!(node.install_peer(&other));

        let env = Envelope::new(
            MessageType::Gossip,
            &origin.network_id,
            &test_gossip("fixed-id"),
        )
        .unwrap();
        node.handle_envelope(&origin, env.clone()).await;

        // Delivered to the app exactly once, relayed only to the other peer.
        let delivered = incoming.try_recv().unwrap();
        assert_eq!(delivered.msg_type, MessageType::Gossip);
        assert!(incoming.try_recv().is_err());
        assert!(other_rx.try_recv().is_ok());
        assert!(origin_rx.try_recv().is_err());

        // A second hop of the same id is suppressed entirely.
        node.handle_envelope(&other, env).await;
        assert!(incoming.try_recv().is_err());
        assert!(other_rx.try_recv().is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn own_broadcast_is_not_redelivered_on_echo() {
        let node = quiet_node(false).await;
        let mut incoming = node.incoming().unwrap();

        let (peer, mut peer_rx) = test_peer(&"11".repeat(32), &"aa".repeat(32), "10.0.0.1:1");
        assert!(node.install_peer(&peer));

        let gossip = test_gossip(&new_msg_id());
        node.broadcast(&gossip).unwrap();
        assert!(peer_rx.try_recv().is_ok(), "broadcast reaches the peer");

        // The peer echoes our own gossip back.
        let echo = Envelope::new(MessageType::Gossip, &peer.network_id, &gossip).unwrap();
        node.handle_envelope(&peer, echo).await;
        assert!(incoming.try_recv().is_err(), "echo must not reach the app");
        node.shutdown().await;
    }

    #[tokio::test]
    async fn seed_forwards_nat_relay_with_sender_network_id() {
        let seed = quiet_node(true).await;

        let (registered, mut registered_rx) =
            test_peer(&"11".repeat(32), &"aa".repeat(32), "10.0.0.1:1");
        let (caller, _caller_rx) = test_peer(&"22".repeat(32), &"bb".repeat(32), "10.0.0.2:1");
        assert!(seed.install_peer(&registered));
        assert!(seed.install_peer(&caller));

        let reg = Envelope::new(
            MessageType::NatRegister,
            &registered.network_id,
            &NatRegister {
                user_id: "aa".repeat(32),
                name: "reg".into(),
            },
        )
        .unwrap();
        seed.handle_envelope(&registered, reg).await;

        let relay = Envelope::new(
            MessageType::NatRelay,
            &caller.network_id,
            &NatRelay {
                to_user_id: "aa".repeat(32),
                payload: serde_json::json!({"hello": true}),
            },
        )
        .unwrap();
        seed.handle_envelope(&caller, relay).await;

        let forwarded = registered_rx.try_recv().expect("relay must be forwarded");
        assert_eq!(forwarded.msg_type, MessageType::NatRelay);
        assert_eq!(forwarded.from_id, caller.network_id);
        seed.shutdown().await;
    }

    #[tokio::test]
    async fn non_seed_delivers_nat_relay_to_app() {
        let node = quiet_node(false).await;
        let mut incoming = node.incoming().unwrap();

        let (peer, _rx) = test_peer(&"11".repeat(32), &"aa".repeat(32), "10.0.0.1:1");
        assert!(node.install_peer(&peer));

        let relay = Envelope::new(
            MessageType::NatRelay,
            &peer.network_id,
            &NatRelay {
                to_user_id: node.user_id().to_string(),
                payload: serde_json::json!({"n": 1}),
            },
        )
        .unwrap();
        node.handle_envelope(&peer, relay).await;

        let delivered = incoming.try_recv().unwrap();
        assert_eq!(delivered.msg_type, MessageType::NatRelay);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_peer_install_rejected() {
        let node = quiet_node(false).await;
        let (first, _rx1) = test_peer(&"11".repeat(32), &"aa".repeat(32), "10.0.0.1:1");
        let (second, _rx2) = test_peer(&"11".repeat(32), &"cc".repeat(32), "10.0.0.3:1");
        assert!(node.install_peer(&first));
        assert!(!node.install_peer(&second), "same NetworkID must lose");
        assert_eq!(node.peer_count(), 1);
        node.shutdown().await;
    }
}
