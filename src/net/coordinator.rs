//! Coordinator: ownership, timers, and connection lifecycle
//!
//! Owns the transport, the managers, and the dispatcher; runs the accept
//! loop, the outbound dial loop, the feeler cadence, the maintenance
//! sweep, and the INV flush. Each connection gets one task that serializes
//! its reads and writes, so per-connection state is only ever touched from
//! one logical execution context at a time.

use super::addrman::AddrBook;
use super::anchors;
use super::connman::{ConnLimits, ConnectionError, ConnectionManager};
use super::dispatcher::{DispatchOutcome, Dispatcher, NetError, PeerGate};
use super::handlers;
use super::message::Message;
use super::orphans::OrphanPool;
use super::peer::{Peer, PeerInfo, SendQueue, SendQueueDrain};
use super::relay::RelayManager;
use super::sync::SyncManager;
use super::timedata::TimeData;
use super::transport::{Connection, Transport};
use super::types::{
    AddrKey, Direction, NetAddress, Permissions, DEFAULT_RECV_FLOOD_SIZE, DIAL_INTERVAL_SECS,
    FEELER_INTERVAL_SECS, HANDSHAKE_TIMEOUT_SECS, INACTIVITY_TIMEOUT_SECS,
    INV_FLUSH_INTERVAL_SECS, MAINTENANCE_INTERVAL_SECS, MAX_DIAL_ATTEMPTS_PER_CYCLE,
    NODE_HEADERS, PeerState,
};
use super::wire::{Codec, FrameEvent};
use crate::chain::ChainStore;
use crate::types::now;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Outcome of a connection request, as surfaced to addnode and callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionResult {
    Success,
    NotRunning,
    AddressBanned,
    AddressDiscouraged,
    AlreadyConnected,
    NoSlotsAvailable,
    TransportFailed,
    PeerCreationFailed,
    PeerManagerFailed,
}

impl From<ConnectionError> for ConnectionResult {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::AddressBanned => ConnectionResult::AddressBanned,
            ConnectionError::AddressDiscouraged => ConnectionResult::AddressDiscouraged,
            ConnectionError::NoSlotsAvailable => ConnectionResult::NoSlotsAvailable,
            ConnectionError::AlreadyConnected => ConnectionResult::AlreadyConnected,
        }
    }
}

/// Node network configuration. Magic and port carry no defaults: a node
/// must know which network it is on.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub magic: u32,
    pub port: u16,
    pub datadir: PathBuf,
    pub limits: ConnLimits,
    pub services: u64,
    /// Accept non-routable addresses in the address book (test networks).
    pub allow_unroutable: bool,
}

impl NetConfig {
    pub fn new(magic: u32, port: u16, datadir: PathBuf) -> Self {
        Self {
            magic,
            port,
            datadir,
            limits: ConnLimits::default(),
            services: NODE_HEADERS,
            allow_unroutable: false,
        }
    }

    fn anchors_path(&self) -> PathBuf {
        self.datadir.join("anchors.json")
    }

    fn banlist_path(&self) -> PathBuf {
        self.datadir.join("banlist.json")
    }

    fn peers_path(&self) -> PathBuf {
        self.datadir.join("peers.json")
    }
}

/// Shared state reachable from every handler.
pub struct NodeState {
    pub config: NetConfig,
    pub chain: Arc<dyn ChainStore>,
    pub connman: Arc<ConnectionManager>,
    pub addrbook: Arc<Mutex<AddrBook>>,
    pub sync: Arc<SyncManager>,
    pub relay: Arc<RelayManager>,
    pub orphans: Arc<Mutex<OrphanPool>>,
    pub timedata: Arc<TimeData>,
    pub running: AtomicBool,
    /// Our own advertised address (unspecified IP until discovered).
    pub local_address: NetAddress,
}

impl NodeState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

pub struct Coordinator {
    state: Arc<NodeState>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher<NodeState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Coordinator {
    pub fn new(
        config: NetConfig,
        chain: Arc<dyn ChainStore>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let connman = Arc::new(ConnectionManager::new(config.limits));
        connman.load_bans(config.banlist_path());

        let addrbook = Arc::new(Mutex::new(AddrBook::load(
            config.peers_path(),
            config.allow_unroutable,
        )));

        let local_address = NetAddress::new(
            std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            config.port,
            config.services,
        );

        let state = Arc::new(NodeState {
            config,
            chain,
            connman,
            addrbook,
            sync: Arc::new(SyncManager::new()),
            relay: Arc::new(RelayManager::new()),
            orphans: Arc::new(Mutex::new(OrphanPool::new())),
            timedata: Arc::new(TimeData::new()),
            running: AtomicBool::new(false),
            local_address,
        });

        let mut dispatcher = Dispatcher::new();
        handlers::register_all(&mut dispatcher);

        Arc::new(Self {
            state,
            transport,
            dispatcher: Arc::new(dispatcher),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    // ---- lifecycle ------------------------------------------------------

    pub async fn start(self: &Arc<Self>) -> Result<(), NetError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(NetError::Policy("coordinator already started"));
        }
        self.state.running.store(true, Ordering::Release);
        info!("starting network on port {}", self.state.config.port);

        // Relay subscribes to block-connected notifications. Weak upgrade:
        // the chain store may outlive this coordinator in tests.
        {
            let weak = Arc::downgrade(&self.state);
            self.state
                .chain
                .subscribe_block_connected(Box::new(move |_header, entry| {
                    if let Some(state) = weak.upgrade() {
                        if state.is_running() {
                            state
                                .relay
                                .on_block_connected(&state.connman, &*state.chain, entry);
                        }
                    }
                }));
        }

        // Sync and orphan state must drop per-peer data on disconnect.
        {
            let sync = self.state.sync.clone();
            let orphans = self.state.orphans.clone();
            self.state.connman.subscribe_disconnect(Box::new(move |id| {
                sync.note_disconnect(id);
                orphans.lock().expect("orphan lock poisoned").remove_peer(id);
            }));
        }

        // Re-dial persisted anchors exactly once each.
        let anchor_list = anchors::load_and_delete_anchors(self.state.config.anchors_path());
        for anchor in anchor_list {
            let this = self.clone();
            self.spawn(async move {
                let result = this
                    .connect_to(anchor.socket_addr(), Direction::Outbound)
                    .await;
                debug!("anchor dial {} -> {result:?}", anchor.socket_addr());
            });
        }

        if self.transport.local_addr().is_some() {
            let this = self.clone();
            self.spawn(async move { this.accept_loop().await });
        }

        let this = self.clone();
        self.spawn(async move { this.dial_loop().await });
        let this = self.clone();
        self.spawn(async move { this.maintenance_loop().await });
        let this = self.clone();
        self.spawn(async move { this.feeler_loop().await });
        let this = self.clone();
        self.spawn(async move { this.flush_loop().await });

        Ok(())
    }

    /// Orderly shutdown: flip the running flag, cancel timers, persist
    /// state, then drain peers. Persistence errors are logged, never
    /// propagated; everything that logs runs before the caller tears the
    /// logger down.
    pub fn stop(&self) -> Result<(), NetError> {
        if !self.state.running.swap(false, Ordering::AcqRel) {
            return Err(NetError::Policy("coordinator not running"));
        }
        info!("stopping network");

        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }

        if let Err(err) =
            anchors::save_anchors(self.state.config.anchors_path(), &self.select_anchors())
        {
            warn!("failed to save anchors: {err}");
        }
        if let Err(err) = self.state.connman.save_bans(self.state.config.banlist_path()) {
            warn!("failed to save ban list: {err}");
        }
        if let Err(err) = self
            .state
            .addrbook
            .lock()
            .expect("addrbook lock poisoned")
            .save(self.state.config.peers_path())
        {
            warn!("failed to save address book: {err}");
        }

        self.state.connman.shutdown();
        Ok(())
    }

    /// The ≤2 most-recently-active handshaked outbound peers.
    fn select_anchors(&self) -> Vec<NetAddress> {
        let mut candidates: Vec<PeerInfo> = self
            .state
            .connman
            .peer_infos()
            .into_iter()
            .filter(|info| {
                matches!(info.direction, Direction::Outbound | Direction::Manual)
                    && info.successfully_connected
            })
            .collect();
        candidates.sort_by(|a, b| b.last_recv.cmp(&a.last_recv));
        candidates
            .into_iter()
            .take(anchors::MAX_ANCHORS)
            .map(|info| NetAddress::from_socket_addr(info.addr, info.services))
            .collect()
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .lock()
            .expect("task lock poisoned")
            .push(tokio::spawn(future));
    }

    // ---- outbound -------------------------------------------------------

    /// Dial `addr` and enroll the peer. The peer-id is allocated before
    /// the connect is issued so a synchronously-completing connect (e.g.
    /// loopback) still has a stable identity to report against.
    pub async fn connect_to(
        self: &Arc<Self>,
        addr: SocketAddr,
        direction: Direction,
    ) -> ConnectionResult {
        if !self.state.is_running() {
            return ConnectionResult::NotRunning;
        }
        let key = AddrKey::from_socket_addr(addr);
        if self.state.connman.find_by_addr(&key).is_some() {
            return ConnectionResult::AlreadyConnected;
        }
        let ip = addr.ip();
        let whitelisted = self.state.connman.is_whitelisted(ip);
        if !whitelisted {
            if self.state.connman.is_banned(ip) {
                return ConnectionResult::AddressBanned;
            }
            if self.state.connman.is_discouraged(ip) {
                return ConnectionResult::AddressDiscouraged;
            }
        }
        if direction == Direction::Outbound && !self.state.connman.needs_more_outbound() {
            return ConnectionResult::NoSlotsAvailable;
        }

        let id = self.state.connman.allocate_peer_id();
        self.state
            .addrbook
            .lock()
            .expect("addrbook lock poisoned")
            .mark_attempt(&key);

        let conn = match self.transport.connect(addr).await {
            Ok(conn) => conn,
            Err(err) => {
                debug!("connect to {addr} failed: {err}");
                self.state
                    .addrbook
                    .lock()
                    .expect("addrbook lock poisoned")
                    .mark_failed(&key);
                return ConnectionResult::TransportFailed;
            }
        };

        let permissions = if whitelisted {
            Permissions::NO_BAN
        } else {
            Permissions::empty()
        };
        let (queue, drain) = SendQueue::new();
        let nonce: u64 = rand::thread_rng().r#gen();
        let peer = Peer::new(id, addr, direction, permissions, nonce, queue);

        let entry = match self.state.connman.add_peer_with_id(id, peer) {
            Ok(entry) => entry,
            Err(err) => {
                debug!("enrolling peer {id} failed: {err}");
                return err.into();
            }
        };

        // TCP is up: outbound speaks first.
        {
            let mut peer = entry.lock().expect("peer lock poisoned");
            peer.state = PeerState::Connected;
            let version = handlers::build_version(&self.state, &addr, nonce);
            if peer.send(Message::Version(version)).is_err() {
                drop(peer);
                self.state.connman.remove_peer(id);
                return ConnectionResult::PeerCreationFailed;
            }
            peer.state = PeerState::VersionSent;
        }

        self.spawn_connection_task(id, conn, drain);
        ConnectionResult::Success
    }

    async fn dial_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(DIAL_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if !self.state.is_running() {
                break;
            }
            let mut attempts = 0usize;
            while self.state.connman.needs_more_outbound()
                && attempts < MAX_DIAL_ATTEMPTS_PER_CYCLE
                && self.state.is_running()
            {
                attempts += 1;
                let candidate = {
                    let book = self.state.addrbook.lock().expect("addrbook lock poisoned");
                    book.select()
                };
                let Some(addr) = candidate else {
                    break;
                };
                let key = addr.key();
                {
                    let book = self.state.addrbook.lock().expect("addrbook lock poisoned");
                    if book.is_in_backoff(&key) {
                        continue;
                    }
                }
                if self.state.connman.find_by_addr(&key).is_some() {
                    continue;
                }

                match self.connect_to(addr.socket_addr(), Direction::Outbound).await {
                    ConnectionResult::AddressBanned | ConnectionResult::AddressDiscouraged => {
                        // Policy refusals count as failures so the address
                        // backs off out of the rotation.
                        self.state
                            .addrbook
                            .lock()
                            .expect("addrbook lock poisoned")
                            .mark_failed(&key);
                    }
                    ConnectionResult::NoSlotsAvailable | ConnectionResult::AlreadyConnected => {}
                    _ => {}
                }
            }
        }
    }

    async fn feeler_loop(self: Arc<Self>) {
        loop {
            // Randomized cadence around the configured mean.
            let jitter = rand::thread_rng().gen_range(0..=FEELER_INTERVAL_SECS);
            let wait = FEELER_INTERVAL_SECS / 2 + jitter;
            tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
            if !self.state.is_running() {
                break;
            }
            let candidate = {
                let book = self.state.addrbook.lock().expect("addrbook lock poisoned");
                book.select_feeler()
            };
            if let Some(addr) = candidate {
                debug!("feeler to {}", addr.socket_addr());
                let _ = self.connect_to(addr.socket_addr(), Direction::Feeler).await;
            }
        }
    }

    async fn flush_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(INV_FLUSH_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if !self.state.is_running() {
                break;
            }
            self.state.relay.flush(&self.state.connman);
            self.state
                .sync
                .maybe_start_sync(&self.state.connman, &*self.state.chain);
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if !self.state.is_running() {
                break;
            }
            self.state.connman.expire_bans();
            self.state
                .orphans
                .lock()
                .expect("orphan lock poisoned")
                .expire();
            self.state.relay.expire();
            self.state
                .addrbook
                .lock()
                .expect("addrbook lock poisoned")
                .cleanup_stale();
            self.state.sync.check_stall(&self.state.connman);
            self.state
                .relay
                .reannounce_tip(&self.state.connman, &*self.state.chain);
            self.sweep_peer_timers();
        }
    }

    /// Handshake, inactivity, ping, and send-flood timers for every peer.
    fn sweep_peer_timers(&self) {
        let current = now();
        for id in self.state.connman.peer_ids() {
            let Some(entry) = self.state.connman.get_peer(id) else {
                continue;
            };
            let mut remove = false;
            {
                let mut peer = entry.lock().expect("peer lock poisoned");
                if !peer.successfully_connected
                    && current.saturating_sub(peer.connected_at) > HANDSHAKE_TIMEOUT_SECS
                {
                    debug!("peer {id} handshake timed out");
                    remove = true;
                } else if current.saturating_sub(peer.last_recv) > INACTIVITY_TIMEOUT_SECS {
                    debug!("peer {id} inactive too long");
                    remove = true;
                } else if peer.send_queue.is_overflowed()
                    || peer.send_queue.queued_bytes() > DEFAULT_RECV_FLOOD_SIZE
                {
                    warn!("peer {id} send queue exceeded flood limit");
                    remove = true;
                } else if peer.needs_ping() {
                    let nonce = peer.start_ping();
                    let _ = peer.send(Message::Ping(nonce));
                } else if peer.ping_nonce.is_some()
                    && current.saturating_sub(peer.last_ping_time) > INACTIVITY_TIMEOUT_SECS
                {
                    debug!("peer {id} never answered ping");
                    remove = true;
                }
            }
            if remove {
                self.state.connman.remove_peer(id);
            }
        }
    }

    // ---- inbound --------------------------------------------------------

    async fn accept_loop(self: Arc<Self>) {
        while self.state.is_running() {
            let conn = match self.transport.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    if !self.state.is_running() {
                        break;
                    }
                    debug!("accept failed: {err}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };
            // Re-check after the suspension point.
            if !self.state.is_running() {
                break;
            }
            self.admit_inbound(conn);
        }
    }

    fn admit_inbound(self: &Arc<Self>, conn: Connection) {
        let remote = conn.remote;
        let ip = remote.ip();

        if !self.state.connman.can_accept_inbound_from(ip) {
            debug!("refusing inbound from {remote}");
            return;
        }
        if self.state.connman.inbound_full() && self.state.connman.evict_inbound_peer().is_none() {
            debug!("inbound full and nothing evictable; refusing {remote}");
            return;
        }

        let id = self.state.connman.allocate_peer_id();
        let permissions = if self.state.connman.is_whitelisted(ip) {
            Permissions::NO_BAN
        } else {
            Permissions::empty()
        };
        let (queue, drain) = SendQueue::new();
        let nonce: u64 = rand::thread_rng().r#gen();
        let peer = Peer::new(id, remote, Direction::Inbound, permissions, nonce, queue);

        match self.state.connman.add_peer_with_id(id, peer) {
            Ok(_) => {
                debug!("accepted inbound peer {id} from {remote}");
                self.spawn_connection_task(id, conn, drain);
            }
            Err(err) => debug!("inbound {remote} refused: {err}"),
        }
    }

    // ---- per-connection task --------------------------------------------

    /// One task per connection serializes reads, writes, and dispatch.
    /// Encoded buffers live inside the framed sink until each write
    /// completes.
    fn spawn_connection_task(self: &Arc<Self>, id: i32, conn: Connection, mut drain: SendQueueDrain) {
        let state = self.state.clone();
        let dispatcher = self.dispatcher.clone();
        let magic = state.config.magic;

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        if let Some(entry) = state.connman.get_peer(id) {
            entry.lock().expect("peer lock poisoned").shutdown = Some(shutdown_tx);
        } else {
            return;
        }

        let task = tokio::spawn(async move {
            let mut framed = Framed::new(conn.stream, Codec::new(magic));
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,

                    outgoing = drain.recv() => {
                        let Some(msg) = outgoing else { break };
                        if let Err(err) = framed.send(msg).await {
                            debug!("write to peer {id} failed: {err}");
                            break;
                        }
                    }

                    incoming = framed.next() => {
                        match incoming {
                            None => {
                                debug!("peer {id} closed the connection");
                                break;
                            }
                            Some(Err(err)) => {
                                debug!("fatal wire error from peer {id}: {err}");
                                break;
                            }
                            Some(Ok(FrameEvent::Ignored { .. })) => {
                                if let Some(entry) = state.connman.get_peer(id) {
                                    entry.lock().expect("peer lock poisoned").on_message_recv(0);
                                } else {
                                    break;
                                }
                            }
                            Some(Ok(FrameEvent::Message(msg))) => {
                                // Parse-buffer flood guard: a frame larger
                                // than the flood limit never gets this far,
                                // but residual buffered bytes are bounded
                                // here as well.
                                if framed.read_buffer().len() > DEFAULT_RECV_FLOOD_SIZE {
                                    warn!("peer {id} flooded the receive buffer");
                                    break;
                                }
                                let gate = {
                                    let Some(entry) = state.connman.get_peer(id) else { break };
                                    let mut peer = entry.lock().expect("peer lock poisoned");
                                    peer.on_message_recv(msg.approx_size());
                                    PeerGate {
                                        version_received: peer.version_received,
                                        successfully_connected: peer.successfully_connected,
                                    }
                                };
                                match dispatcher.dispatch(&state, id, gate, msg).await {
                                    DispatchOutcome::Handled | DispatchOutcome::Ignored => {}
                                    DispatchOutcome::ProtocolViolation
                                    | DispatchOutcome::HandlerFailed => break,
                                }
                            }
                        }
                    }
                }
            }
            state.connman.remove_peer(id);
        });

        self.tasks.lock().expect("task lock poisoned").push(task);
    }

    // ---- operator surface -----------------------------------------------

    /// `addnode onetry` / `addnode add`: dial a specific peer now.
    pub async fn add_node(self: &Arc<Self>, addr: SocketAddr) -> ConnectionResult {
        self.connect_to(addr, Direction::Manual).await
    }

    /// `addnode remove` / `disconnectnode`.
    pub fn disconnect_node(&self, addr: SocketAddr) -> bool {
        let key = AddrKey::from_socket_addr(addr);
        match self.state.connman.find_by_addr(&key) {
            Some(id) => {
                self.state.connman.remove_peer(id);
                true
            }
            None => false,
        }
    }

    pub fn peer_info(&self) -> Vec<PeerInfo> {
        self.state.connman.peer_infos()
    }

    pub fn set_ban(&self, ip: std::net::IpAddr, duration_secs: u64) {
        self.state.connman.ban(ip, duration_secs);
    }

    pub fn remove_ban(&self, ip: std::net::IpAddr) -> bool {
        self.state.connman.unban(ip)
    }

    pub fn list_banned(&self) -> Vec<(String, super::connman::BanEntry)> {
        self.state.connman.list_banned()
    }

    pub fn clear_banned(&self) {
        self.state.connman.clear_banned();
    }

    /// Seed the address book directly (bootstrap, tests).
    pub fn add_addresses(&self, addrs: &[SocketAddr]) {
        let mut book = self.state.addrbook.lock().expect("addrbook lock poisoned");
        for addr in addrs {
            book.add(
                NetAddress::from_socket_addr(*addr, NODE_HEADERS),
                now() as u32,
                None,
            );
        }
    }
}
