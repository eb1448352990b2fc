// Palisade Network Layer — Constants and Types
// Copyright (c) 2024-2026 The Palisade developers
// Distributed under the MIT software license.

//! Network constants and shared types for the Palisade P2P protocol.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every collection and message has an
//!    explicit size limit; a peer cannot exhaust memory by sending large
//!    or many messages.
//!
//! 2. **DoS resistance** — misbehavior scoring, bans, discouragement, and
//!    connection caps bound what any single address can cost us.
//!
//! 3. **Eclipse resistance** — anchor persistence and tried/new address
//!    separation keep an attacker from monopolizing our outbound slots
//!    across restarts.

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher24;
use std::hash::BuildHasher;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Protocol version number. Increment on breaking wire format changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire frame header length: magic(4) + command(12) + length(4) + checksum(4).
pub const FRAME_HEADER_SIZE: usize = 24;

/// Command field width in the frame header, zero-padded ASCII.
pub const COMMAND_SIZE: usize = 12;

/// Hard limit on any message payload (32 MiB). Exceeding it is an immediate
/// disconnect, before the payload is buffered.
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 32 * 1024 * 1024;

// =============================================================================
// CONNECTION LIMITS
// =============================================================================

/// Outbound connections we dial. We choose these peers, so they anchor
/// consensus-critical data like header sync.
pub const DEFAULT_MAX_OUTBOUND: usize = 8;

/// Inbound connections from others. Untrusted; may be Sybils.
pub const DEFAULT_MAX_INBOUND: usize = 125;

/// Max inbound connections from one IP. Two allows NAT users while keeping
/// a single address from filling the inbound table.
pub const MAX_INBOUND_PER_IP: usize = 2;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// From TCP establish to VERACK. Expiry disconnects.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 60;

/// Interval between outbound pings once the handshake is complete.
pub const PING_INTERVAL_SECS: u64 = 120;

/// No message of any kind for this long disconnects the peer (20 minutes).
pub const INACTIVITY_TIMEOUT_SECS: u64 = 20 * 60;

/// No HEADERS from the sync peer for this long disconnects it.
pub const HEADERS_STALL_TIMEOUT_SECS: u64 = 120;

// =============================================================================
// MESSAGE-LEVEL LIMITS
// =============================================================================
// These are checked by handlers, not by the frame codec, so the oversize
// penalty can be applied without tearing the connection down on the spot.

/// Maximum items in one INV message.
pub const MAX_INV_SIZE: usize = 50_000;

/// Maximum addresses in one ADDR message.
pub const MAX_ADDR_SIZE: usize = 1_000;

/// Maximum headers in one HEADERS message.
pub const MAX_HEADERS_RESULTS: usize = 2_000;

/// Maximum user-agent length in a VERSION message.
pub const MAX_USER_AGENT_LEN: usize = 256;

/// Outbound send queue high-water mark; exceeding it disconnects the peer.
/// The same limit bounds the receive parse buffer.
pub const DEFAULT_RECV_FLOOD_SIZE: usize = 5 * 1024 * 1024;

// =============================================================================
// SYNC AND RELAY
// =============================================================================

/// Unconnecting HEADERS messages tolerated before the full penalty.
pub const MAX_UNCONNECTING_HEADERS: u32 = 10;

/// Headers accepted from a non-sync peer while in initial block download.
pub const MAX_UNSOLICITED_ANNOUNCEMENT: usize = 2;

/// A block is eligible for immediate relay only this long after we first
/// learn it (seconds).
pub const MAX_BLOCK_RELAY_AGE_SECS: u64 = 10;

/// Per-peer TTL for the periodic tip re-announce (10 minutes).
pub const TIP_REANNOUNCE_INTERVAL_SECS: u64 = 10 * 60;

// =============================================================================
// ORPHAN POOL
// =============================================================================

/// Global orphan-header cap.
pub const MAX_ORPHAN_HEADERS: usize = 1_000;

/// Orphan headers tolerated per source peer.
pub const MAX_ORPHAN_HEADERS_PER_PEER: usize = 50;

/// Orphans older than this are expired (seconds).
pub const ORPHAN_HEADER_EXPIRE_SECS: u64 = 600;

// =============================================================================
// MISBEHAVIOR
// =============================================================================

/// Score at which a peer is discouraged and disconnected.
pub const DISCOURAGEMENT_THRESHOLD: u32 = 100;

/// Capacity of the in-memory discouragement set.
pub const MAX_DISCOURAGED: usize = 50_000;

/// Penalty points per violation class. Applied by message handlers.
pub mod penalty {
    pub const INVALID_POW: u32 = 100;
    pub const INVALID_HEADER: u32 = 100;
    pub const TOO_MANY_ORPHANS: u32 = 100;
    pub const UNCONNECTING_HEADERS: u32 = 100;
    pub const OVERSIZED_MESSAGE: u32 = 20;
    pub const NON_CONTINUOUS_HEADERS: u32 = 20;
    pub const LOW_WORK_HEADERS: u32 = 10;
}

// =============================================================================
// COORDINATOR TIMERS
// =============================================================================

/// Outbound dial loop cadence (seconds).
pub const DIAL_INTERVAL_SECS: u64 = 5;

/// Maintenance sweep cadence (seconds).
pub const MAINTENANCE_INTERVAL_SECS: u64 = 30;

/// Mean feeler cadence (seconds); actual interval is randomized.
pub const FEELER_INTERVAL_SECS: u64 = 120;

/// INV flush cadence (seconds).
pub const INV_FLUSH_INTERVAL_SECS: u64 = 1;

/// Dial attempts per outbound cycle before yielding.
pub const MAX_DIAL_ATTEMPTS_PER_CYCLE: usize = 100;

// =============================================================================
// SERVICE FLAGS
// =============================================================================

/// NODE_HEADERS: serves the full header chain.
pub const NODE_HEADERS: u64 = 1 << 0;

// =============================================================================
// PEER STATE
// =============================================================================

/// Per-connection protocol state.
///
/// ```text
/// outbound: Connecting ── tcp up ──► Connected ── send VERSION ──► VersionSent
/// inbound:               Connected ── recv VERSION, reply ───────► VersionSent
/// VersionSent ── recv VERACK ──► Ready
/// any ── close / timeout / violation ──► Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    VersionSent,
    Ready,
    Disconnected,
}

/// How the connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    /// Short-lived address-verification dial; never becomes the sync peer.
    Feeler,
    /// Operator-requested via addnode.
    Manual,
}

impl Direction {
    /// Outbound in the slot-accounting sense.
    pub fn is_outbound(&self) -> bool {
        !matches!(self, Direction::Inbound)
    }
}

bitflags::bitflags! {
    /// Permission set assigned at admission.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        /// Never discouraged or disconnected for misbehavior.
        const NO_BAN = 1 << 0;
    }
}

// =============================================================================
// NETWORK ADDRESS
// =============================================================================

/// Network address: 16-byte IP (IPv4 stored as `::ffff:a.b.c.d`), port, and
/// advertised service flags.
///
/// Equality and hashing cover IP and port only; two addresses differing only
/// in services are the same endpoint. The address book's bucketing key
/// additionally folds in services.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl PartialEq for NetAddress {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for NetAddress {}

impl std::hash::Hash for NetAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16, services: u64) -> Self {
        Self {
            services,
            ip: encode_ip(ip),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: u64) -> Self {
        Self::new(addr.ip(), addr.port(), services)
    }

    /// The IP, unmapped back to IPv4 when it is an IPv4-mapped address.
    pub fn ip_addr(&self) -> IpAddr {
        decode_ip(&self.ip)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr(), self.port)
    }

    /// 18-byte `{ip[16], port}` map key.
    pub fn key(&self) -> AddrKey {
        let mut key = [0u8; 18];
        key[..16].copy_from_slice(&self.ip);
        key[16..].copy_from_slice(&self.port.to_be_bytes());
        AddrKey(key)
    }

    pub fn is_ipv4_mapped(&self) -> bool {
        self.ip[..10] == [0u8; 10] && self.ip[10] == 0xff && self.ip[11] == 0xff
    }

    /// Globally routable per relay policy. Filters private, loopback,
    /// link-local, documentation, broadcast, and unspecified ranges so the
    /// address tables cannot be polluted with unusable entries.
    pub fn is_routable(&self) -> bool {
        match self.ip_addr() {
            IpAddr::V4(ip) => {
                !ip.is_private()
                    && !ip.is_loopback()
                    && !ip.is_link_local()
                    && !ip.is_broadcast()
                    && !ip.is_documentation()
                    && !ip.is_unspecified()
            }
            // Only IPv4 and IPv4-mapped addresses participate in this
            // network; bare IPv6 is not relayed.
            IpAddr::V6(_) => false,
        }
    }
}

/// Encode an IP into the 16-byte wire form; IPv4 becomes `::ffff:a.b.c.d`.
pub fn encode_ip(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Decode a 16-byte wire IP, unmapping IPv4-mapped addresses.
pub fn decode_ip(bytes: &[u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(*bytes);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

/// Key an IP alone (port-independent), for per-IP caps and ban entries.
pub fn ip_key(ip: IpAddr) -> [u8; 16] {
    encode_ip(ip)
}

/// Address plus last-seen timestamp, as carried in ADDR messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedAddress {
    pub timestamp: u32,
    pub address: NetAddress,
}

// =============================================================================
// ADDRESS KEYING
// =============================================================================

/// 18-byte binary `{ip[16], port}` tuple. Cache maps are keyed on this
/// rather than a formatted string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddrKey(pub [u8; 18]);

impl AddrKey {
    pub fn ip_bytes(&self) -> [u8; 16] {
        self.0[..16].try_into().expect("key holds 16 ip bytes")
    }

    pub fn port(&self) -> u16 {
        u16::from_be_bytes([self.0[16], self.0[17]])
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(decode_ip(&self.ip_bytes()), self.port())
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        NetAddress::from_socket_addr(addr, 0).key()
    }
}

impl std::fmt::Display for AddrKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Keyed SipHash build-hasher for address maps. Keys are drawn once per map
/// from the thread-local RNG, so bucket layout is not attacker-predictable.
#[derive(Debug, Clone)]
pub struct SipState {
    k0: u64,
    k1: u64,
}

impl Default for SipState {
    fn default() -> Self {
        Self {
            k0: rand::random(),
            k1: rand::random(),
        }
    }
}

impl BuildHasher for SipState {
    type Hasher = SipHasher24;

    fn build_hasher(&self) -> SipHasher24 {
        SipHasher24::new_with_keys(self.k0, self.k1)
    }
}

/// Address-keyed hash map with keyed SipHash.
pub type AddrMap<V> = std::collections::HashMap<AddrKey, V, SipState>;

/// Parse a bare IP string into the 16-byte form, for ban-list keys.
pub fn parse_ip16(s: &str) -> Option<[u8; 16]> {
    s.parse::<IpAddr>().ok().map(encode_ip)
}

/// Render a 16-byte IP for ban-list keys; IPv4-mapped prints dotted quad.
pub fn format_ip16(ip: &[u8; 16]) -> String {
    decode_ip(ip).to_string()
}

/// A loopback IPv4 address with the given port, for tests and defaults.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}
