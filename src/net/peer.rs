//! Per-connection peer state
//!
//! A `Peer` is owned by the connection manager; sync, relay, and the
//! dispatcher reach it through the manager and must revalidate the id on
//! every use. Everything here is plain state plus small transitions; the
//! connection task in the coordinator drives the actual protocol.

use super::message::Message;
use super::types::{
    Direction, NetAddress, PeerState, Permissions, DEFAULT_RECV_FLOOD_SIZE, PING_INTERVAL_SECS,
};
use crate::types::{now, Hash};
use indexmap::IndexSet;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Cap on the per-peer set of hashes of headers that failed validation.
/// Small: it only needs to dedup re-sends of the same bad header.
const MAX_INVALID_HEADER_HASHES: usize = 64;

/// Error from [`SendQueue::send`].
#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// Queued bytes crossed the flood limit; disconnect the peer.
    FloodLimit,
    /// The writer task is gone.
    Closed,
}

/// Outbound message queue with byte accounting.
///
/// Messages are handed to the per-connection writer task, which owns each
/// encoded buffer until its write completes. `queued_bytes` tracks an
/// estimate of not-yet-flushed bytes; crossing [`DEFAULT_RECV_FLOOD_SIZE`]
/// fails the send so the caller disconnects the peer instead of buffering
/// without bound.
#[derive(Clone, Debug)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<Message>,
    queued_bytes: Arc<AtomicUsize>,
    overflowed: Arc<std::sync::atomic::AtomicBool>,
}

impl SendQueue {
    pub fn new() -> (Self, SendQueueDrain) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued_bytes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                queued_bytes: queued_bytes.clone(),
                overflowed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            },
            SendQueueDrain { rx, queued_bytes },
        )
    }

    pub fn send(&self, msg: Message) -> Result<(), SendError> {
        let size = msg.approx_size();
        let queued = self.queued_bytes.fetch_add(size, Ordering::AcqRel) + size;
        if queued > DEFAULT_RECV_FLOOD_SIZE {
            self.queued_bytes.fetch_sub(size, Ordering::AcqRel);
            // Latch the overflow; the maintenance sweep disconnects peers
            // that cannot keep up with their queue.
            self.overflowed
                .store(true, std::sync::atomic::Ordering::Release);
            return Err(SendError::FloodLimit);
        }
        self.tx.send(msg).map_err(|_| {
            self.queued_bytes.fetch_sub(size, Ordering::AcqRel);
            SendError::Closed
        })
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }

    /// Whether a send ever hit the flood limit on this connection.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// Writer-task end of a [`SendQueue`].
pub struct SendQueueDrain {
    rx: mpsc::UnboundedReceiver<Message>,
    queued_bytes: Arc<AtomicUsize>,
}

impl SendQueueDrain {
    pub async fn recv(&mut self) -> Option<Message> {
        let msg = self.rx.recv().await?;
        self.queued_bytes
            .fetch_sub(msg.approx_size(), Ordering::AcqRel);
        Some(msg)
    }

    /// Non-blocking variant, for tests inspecting queued traffic.
    pub fn try_recv_now(&mut self) -> Option<Message> {
        let msg = self.rx.try_recv().ok()?;
        self.queued_bytes
            .fetch_sub(msg.approx_size(), Ordering::AcqRel);
        Some(msg)
    }
}

/// A connected (or connecting) peer.
#[derive(Debug)]
pub struct Peer {
    // Identity
    pub id: i32,
    pub addr: SocketAddr,
    pub direction: Direction,
    pub permissions: Permissions,

    // Negotiation
    /// Nonce we sent in our VERSION on this connection.
    pub local_nonce: u64,
    /// Nonce the peer sent in its VERSION.
    pub peer_nonce: u64,
    pub version: u32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,

    // Protocol state
    pub state: PeerState,
    /// Latches once both sides have exchanged VERACK; never cleared.
    pub successfully_connected: bool,
    /// Whether a VERSION has been received; a second one is ignored.
    pub version_received: bool,

    // Counters
    pub connected_at: u64,
    pub last_recv: u64,
    pub last_send: u64,
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub messages_recv: u64,
    pub messages_sent: u64,
    pub misbehavior: u32,
    pub unconnecting_headers: u32,
    invalid_headers: HashSet<Hash>,
    pub last_ping_time: u64,
    pub ping_nonce: Option<u64>,

    // Announcement state
    /// Ordered, deduplicated block hashes awaiting INV relay.
    pub blocks_for_inv_relay: IndexSet<Hash>,
    /// Whether this peer has ever been the designated sync peer on this
    /// connection. Cleared only by disconnection.
    pub sync_started: bool,
    /// Wall-clock of the last HEADERS received (stall detection).
    pub last_headers_time: u64,
    /// Last periodic tip re-announce toward this peer.
    pub last_tip_announce: u64,
    /// One GETADDR per connection.
    pub sent_getaddr: bool,

    // Send path
    pub send_queue: SendQueue,

    /// Signals the connection task to stop. Consumed by `remove_peer`.
    pub shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Peer {
    pub fn new(
        id: i32,
        addr: SocketAddr,
        direction: Direction,
        permissions: Permissions,
        local_nonce: u64,
        send_queue: SendQueue,
    ) -> Self {
        let created = now();
        Self {
            id,
            addr,
            direction,
            permissions,
            local_nonce,
            peer_nonce: 0,
            version: 0,
            services: 0,
            user_agent: String::new(),
            start_height: 0,
            state: if direction == Direction::Inbound {
                PeerState::Connected
            } else {
                PeerState::Connecting
            },
            successfully_connected: false,
            version_received: false,
            connected_at: created,
            last_recv: created,
            last_send: created,
            bytes_recv: 0,
            bytes_sent: 0,
            messages_recv: 0,
            messages_sent: 0,
            misbehavior: 0,
            unconnecting_headers: 0,
            invalid_headers: HashSet::new(),
            last_ping_time: 0,
            ping_nonce: None,
            blocks_for_inv_relay: IndexSet::new(),
            sync_started: false,
            last_headers_time: 0,
            last_tip_announce: 0,
            sent_getaddr: false,
            send_queue,
            shutdown: None,
        }
    }

    /// Ask the connection task to tear the socket down.
    pub fn trigger_disconnect(&mut self) {
        self.state = PeerState::Disconnected;
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Store the peer's VERSION fields. Only the first VERSION applies.
    pub fn apply_version(&mut self, version: &super::message::VersionPayload) {
        if self.version_received {
            return;
        }
        self.version_received = true;
        self.peer_nonce = version.nonce;
        self.version = version.version;
        self.services = version.services;
        self.user_agent = version.user_agent.clone();
        self.start_height = version.start_height;
    }

    /// VERACK received: latch the handshake.
    pub fn latch_ready(&mut self) {
        self.state = PeerState::Ready;
        self.successfully_connected = true;
    }

    pub fn is_ready(&self) -> bool {
        self.state == PeerState::Ready
    }

    pub fn is_outbound(&self) -> bool {
        self.direction.is_outbound()
    }

    pub fn on_message_recv(&mut self, size: usize) {
        self.last_recv = now();
        self.bytes_recv += size as u64;
        self.messages_recv += 1;
    }

    pub fn on_message_sent(&mut self, size: usize) {
        self.last_send = now();
        self.bytes_sent += size as u64;
        self.messages_sent += 1;
    }

    /// Remember a header hash this peer sent that failed validation.
    /// Returns false when it was already recorded.
    pub fn record_invalid_header(&mut self, hash: Hash) -> bool {
        if self.invalid_headers.contains(&hash) {
            return false;
        }
        if self.invalid_headers.len() >= MAX_INVALID_HEADER_HASHES {
            self.invalid_headers.clear();
        }
        self.invalid_headers.insert(hash)
    }

    pub fn has_sent_invalid_header(&self, hash: &Hash) -> bool {
        self.invalid_headers.contains(hash)
    }

    // ---- ping -----------------------------------------------------------

    pub fn needs_ping(&self) -> bool {
        self.is_ready()
            && self.ping_nonce.is_none()
            && now().saturating_sub(self.last_send) > PING_INTERVAL_SECS
    }

    pub fn start_ping(&mut self) -> u64 {
        let nonce: u64 = rand::random();
        self.ping_nonce = Some(nonce);
        self.last_ping_time = now();
        nonce
    }

    /// Returns true when the pong matched the outstanding nonce.
    pub fn complete_ping(&mut self, nonce: u64) -> bool {
        if self.ping_nonce == Some(nonce) {
            self.ping_nonce = None;
            true
        } else {
            false
        }
    }

    // ---- announcements --------------------------------------------------

    /// Queue a block hash for INV relay; ordered and deduplicated.
    pub fn queue_block_announcement(&mut self, hash: Hash) {
        self.blocks_for_inv_relay.insert(hash);
    }

    /// Remove a hash from the pending queue (it was relayed directly).
    pub fn remove_pending_announcement(&mut self, hash: &Hash) {
        self.blocks_for_inv_relay.shift_remove(hash);
    }

    /// Drain up to `limit` queued announcements, oldest first.
    pub fn take_announcements(&mut self, limit: usize) -> Vec<Hash> {
        let take = limit.min(self.blocks_for_inv_relay.len());
        let mut drained = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(hash) = self.blocks_for_inv_relay.shift_remove_index(0) {
                drained.push(hash);
            }
        }
        drained
    }

    /// Enqueue a message toward this peer.
    pub fn send(&mut self, msg: Message) -> Result<(), SendError> {
        let size = msg.approx_size();
        self.send_queue.send(msg)?;
        self.on_message_sent(size);
        Ok(())
    }
}

/// Snapshot for `getpeerinfo`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: i32,
    pub addr: SocketAddr,
    pub direction: Direction,
    pub permissions: Permissions,
    pub state: PeerState,
    pub successfully_connected: bool,
    pub version: u32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub connected_at: u64,
    pub last_recv: u64,
    pub last_send: u64,
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub misbehavior: u32,
    pub sync_started: bool,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id,
            addr: peer.addr,
            direction: peer.direction,
            permissions: peer.permissions,
            state: peer.state,
            successfully_connected: peer.successfully_connected,
            version: peer.version,
            services: peer.services,
            user_agent: peer.user_agent.clone(),
            start_height: peer.start_height,
            connected_at: peer.connected_at,
            last_recv: peer.last_recv,
            last_send: peer.last_send,
            bytes_recv: peer.bytes_recv,
            bytes_sent: peer.bytes_sent,
            misbehavior: peer.misbehavior,
            sync_started: peer.sync_started,
        }
    }
}

/// Advertised address of a peer, for the address book and anchors.
pub fn peer_net_address(peer: &Peer) -> NetAddress {
    NetAddress::from_socket_addr(peer.addr, peer.services)
}
