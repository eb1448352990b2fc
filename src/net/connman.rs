//! Connection management: slots, bans, discouragement, eviction
//!
//! The manager owns every [`Peer`] and is the only component that removes
//! one. Sync, relay, and the orphan pool subscribe to `on_disconnect` and
//! prune their per-peer state when it fires; it fires exactly once per
//! peer, after the peer has left both indexes.

use super::peer::{Peer, PeerInfo};
use super::types::{
    format_ip16, AddrKey, AddrMap, Direction, Permissions, DEFAULT_MAX_INBOUND,
    DEFAULT_MAX_OUTBOUND, DISCOURAGEMENT_THRESHOLD, MAX_DISCOURAGED, MAX_INBOUND_PER_IP,
};
use crate::types::now;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a peer could not be enrolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("address is banned")]
    AddressBanned,
    #[error("address is discouraged")]
    AddressDiscouraged,
    #[error("no connection slots available")]
    NoSlotsAvailable,
    #[error("already connected to address")]
    AlreadyConnected,
}

// =============================================================================
// BAN LIST
// =============================================================================

/// One persisted ban. `ban_until == 0` means permanent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEntry {
    pub version: u32,
    pub create_time: u64,
    pub ban_until: u64,
}

const BAN_ENTRY_VERSION: u32 = 1;

impl BanEntry {
    pub fn new(duration_secs: u64) -> Self {
        let created = now();
        Self {
            version: BAN_ENTRY_VERSION,
            create_time: created,
            ban_until: if duration_secs == 0 {
                0
            } else {
                created.saturating_add(duration_secs)
            },
        }
    }

    pub fn is_expired(&self) -> bool {
        self.ban_until != 0 && now() >= self.ban_until
    }
}

/// Persisted ban list, keyed by 16-byte IP in memory and by IP string in
/// the JSON file.
#[derive(Debug, Default)]
pub struct BanList {
    bans: HashMap<[u8; 16], BanEntry>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a flat JSON object. A missing file is an empty list; a
    /// corrupt file is logged and treated as empty.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Self::new(),
            Err(err) => {
                warn!("failed to read ban list: {err}");
                return Self::new();
            }
        };
        let parsed: HashMap<String, BanEntry> = match serde_json::from_slice(&data) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("failed to parse ban list, starting empty: {err}");
                return Self::new();
            }
        };
        let mut bans = HashMap::with_capacity(parsed.len());
        for (ip_str, entry) in parsed {
            match super::types::parse_ip16(&ip_str) {
                Some(ip) => {
                    bans.insert(ip, entry);
                }
                None => debug!("skipping unparseable ban entry {ip_str:?}"),
            }
        }
        Self { bans }
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let as_strings: HashMap<String, &BanEntry> = self
            .bans
            .iter()
            .map(|(ip, entry)| (format_ip16(ip), entry))
            .collect();
        let data = serde_json::to_vec_pretty(&as_strings)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        atomic_write(path.as_ref(), &data)
    }

    pub fn ban(&mut self, ip: [u8; 16], duration_secs: u64) {
        info!("banning {} for {}s", format_ip16(&ip), duration_secs);
        self.bans.insert(ip, BanEntry::new(duration_secs));
    }

    pub fn is_banned(&self, ip: &[u8; 16]) -> bool {
        self.bans.get(ip).is_some_and(|entry| !entry.is_expired())
    }

    pub fn unban(&mut self, ip: &[u8; 16]) -> bool {
        self.bans.remove(ip).is_some()
    }

    pub fn expire(&mut self) {
        self.bans.retain(|ip, entry| {
            let keep = !entry.is_expired();
            if !keep {
                debug!("ban expired for {}", format_ip16(ip));
            }
            keep
        });
    }

    pub fn entries(&self) -> Vec<(String, BanEntry)> {
        self.bans
            .iter()
            .map(|(ip, entry)| (format_ip16(ip), entry.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.bans.clear();
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}

/// Write `data` to `path` via a temp file and rename, so readers never see
/// a torn file.
pub fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

// =============================================================================
// DISCOURAGEMENT
// =============================================================================

/// Bounded in-memory set of discouraged IPs. Insertion-ordered; when full,
/// the oldest insertion is evicted. Not persisted.
#[derive(Debug)]
pub struct DiscouragedSet {
    set: HashSet<[u8; 16]>,
    order: VecDeque<[u8; 16]>,
    capacity: usize,
}

impl DiscouragedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn insert(&mut self, ip: [u8; 16]) {
        if self.set.contains(&ip) {
            return;
        }
        while self.set.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            } else {
                break;
            }
        }
        self.set.insert(ip);
        self.order.push_back(ip);
    }

    pub fn contains(&self, ip: &[u8; 16]) -> bool {
        self.set.contains(ip)
    }

    pub fn remove(&mut self, ip: &[u8; 16]) {
        if self.set.remove(ip) {
            self.order.retain(|entry| entry != ip);
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

// =============================================================================
// CONNECTION MANAGER
// =============================================================================

/// Slot limits, overridable per node.
#[derive(Debug, Clone, Copy)]
pub struct ConnLimits {
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub max_inbound_per_ip: usize,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            max_outbound: DEFAULT_MAX_OUTBOUND,
            max_inbound: DEFAULT_MAX_INBOUND,
            max_inbound_per_ip: MAX_INBOUND_PER_IP,
        }
    }
}

type DisconnectSubscriber = Box<dyn Fn(i32) + Send + Sync>;

pub struct ConnectionManager {
    limits: ConnLimits,
    /// Peer ids are handed out before the connection exists, so completion
    /// callbacks always have a stable identity. Never reused.
    next_peer_id: AtomicI32,
    peers: Mutex<HashMap<i32, Arc<Mutex<Peer>>>>,
    by_addr: Mutex<AddrMap<i32>>,
    whitelist: Mutex<HashSet<[u8; 16]>>,
    bans: Mutex<BanList>,
    discouraged: Mutex<DiscouragedSet>,
    on_disconnect: Mutex<Vec<DisconnectSubscriber>>,
    /// Cleared first during shutdown so subscribers stop firing while the
    /// peer table drains.
    callbacks_enabled: AtomicBool,
}

impl ConnectionManager {
    pub fn new(limits: ConnLimits) -> Self {
        Self {
            limits,
            next_peer_id: AtomicI32::new(0),
            peers: Mutex::new(HashMap::new()),
            by_addr: Mutex::new(AddrMap::default()),
            whitelist: Mutex::new(HashSet::new()),
            bans: Mutex::new(BanList::new()),
            discouraged: Mutex::new(DiscouragedSet::new(MAX_DISCOURAGED)),
            on_disconnect: Mutex::new(Vec::new()),
            callbacks_enabled: AtomicBool::new(true),
        }
    }

    pub fn limits(&self) -> ConnLimits {
        self.limits
    }

    /// Monotonic peer-id allocation; callable before the connection object
    /// exists (see the async-connect race note in the coordinator).
    pub fn allocate_peer_id(&self) -> i32 {
        self.next_peer_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribe to peer removal. Fires once per removed peer.
    pub fn subscribe_disconnect(&self, subscriber: DisconnectSubscriber) {
        self.on_disconnect
            .lock()
            .expect("subscriber lock poisoned")
            .push(subscriber);
    }

    // ---- admission ------------------------------------------------------

    /// Enroll a peer under its pre-allocated id.
    pub fn add_peer_with_id(
        &self,
        id: i32,
        peer: Peer,
    ) -> Result<Arc<Mutex<Peer>>, ConnectionError> {
        let ip = super::types::ip_key(peer.addr.ip());
        let whitelisted = self.is_whitelisted_ip(&ip);
        if !whitelisted {
            if self.bans.lock().expect("ban lock poisoned").is_banned(&ip) {
                return Err(ConnectionError::AddressBanned);
            }
            if self
                .discouraged
                .lock()
                .expect("discouraged lock poisoned")
                .contains(&ip)
            {
                return Err(ConnectionError::AddressDiscouraged);
            }
        }

        let key = AddrKey::from_socket_addr(peer.addr);
        let direction = peer.direction;

        let mut peers = self.peers.lock().expect("peer table lock poisoned");
        let mut by_addr = self.by_addr.lock().expect("addr index lock poisoned");

        if by_addr.contains_key(&key) {
            return Err(ConnectionError::AlreadyConnected);
        }

        let (outbound, inbound) = count_directions(&peers);
        match direction {
            Direction::Inbound => {
                if inbound >= self.limits.max_inbound {
                    return Err(ConnectionError::NoSlotsAvailable);
                }
                if !whitelisted {
                    let same_ip = peers
                        .values()
                        .filter(|p| {
                            let p = p.lock().expect("peer lock poisoned");
                            p.direction == Direction::Inbound
                                && super::types::ip_key(p.addr.ip()) == ip
                        })
                        .count();
                    if same_ip >= self.limits.max_inbound_per_ip {
                        return Err(ConnectionError::NoSlotsAvailable);
                    }
                }
            }
            Direction::Outbound | Direction::Manual => {
                if outbound >= self.limits.max_outbound {
                    return Err(ConnectionError::NoSlotsAvailable);
                }
            }
            // Feelers live outside the outbound budget; the coordinator
            // runs at most one at a time.
            Direction::Feeler => {}
        }

        let entry = Arc::new(Mutex::new(peer));
        peers.insert(id, entry.clone());
        by_addr.insert(key, id);
        debug!("enrolled peer {id} ({})", key);
        Ok(entry)
    }

    /// Admission pre-check for the accept loop.
    pub fn can_accept_inbound_from(&self, ip: IpAddr) -> bool {
        let ip = super::types::ip_key(ip);
        if self.is_whitelisted_ip(&ip) {
            return true;
        }
        if self.bans.lock().expect("ban lock poisoned").is_banned(&ip) {
            return false;
        }
        if self
            .discouraged
            .lock()
            .expect("discouraged lock poisoned")
            .contains(&ip)
        {
            return false;
        }
        let peers = self.peers.lock().expect("peer table lock poisoned");
        let same_ip = peers
            .values()
            .filter(|p| {
                let p = p.lock().expect("peer lock poisoned");
                p.direction == Direction::Inbound && super::types::ip_key(p.addr.ip()) == ip
            })
            .count();
        same_ip < self.limits.max_inbound_per_ip
    }

    pub fn needs_more_outbound(&self) -> bool {
        let peers = self.peers.lock().expect("peer table lock poisoned");
        let (outbound, _) = count_directions(&peers);
        outbound < self.limits.max_outbound
    }

    pub fn inbound_full(&self) -> bool {
        let peers = self.peers.lock().expect("peer table lock poisoned");
        let (_, inbound) = count_directions(&peers);
        inbound >= self.limits.max_inbound
    }

    // ---- lookup ---------------------------------------------------------

    pub fn get_peer(&self, id: i32) -> Option<Arc<Mutex<Peer>>> {
        self.peers
            .lock()
            .expect("peer table lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn find_by_addr(&self, key: &AddrKey) -> Option<i32> {
        self.by_addr
            .lock()
            .expect("addr index lock poisoned")
            .get(key)
            .copied()
    }

    pub fn peer_ids(&self) -> Vec<i32> {
        self.peers
            .lock()
            .expect("peer table lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Snapshot of all peers, for `getpeerinfo` and eviction scoring.
    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        let peers = self.peers.lock().expect("peer table lock poisoned");
        peers
            .values()
            .map(|p| PeerInfo::from(&*p.lock().expect("peer lock poisoned")))
            .collect()
    }

    /// Local nonces of outbound connections, for self-connection checks.
    pub fn outbound_nonces(&self) -> Vec<u64> {
        let peers = self.peers.lock().expect("peer table lock poisoned");
        peers
            .values()
            .filter_map(|p| {
                let p = p.lock().expect("peer lock poisoned");
                p.is_outbound().then_some(p.local_nonce)
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.peers.lock().expect("peer table lock poisoned").len()
    }

    // ---- removal and eviction -------------------------------------------

    /// Remove a peer: close its connection, drop it from both indexes, and
    /// notify subscribers. The only sanctioned teardown path.
    pub fn remove_peer(&self, id: i32) {
        let removed = {
            let mut peers = self.peers.lock().expect("peer table lock poisoned");
            let Some(entry) = peers.remove(&id) else {
                return;
            };
            let mut by_addr = self.by_addr.lock().expect("addr index lock poisoned");
            let mut peer = entry.lock().expect("peer lock poisoned");
            by_addr.remove(&AddrKey::from_socket_addr(peer.addr));
            peer.trigger_disconnect();
            true
        };

        if removed && self.callbacks_enabled.load(Ordering::Acquire) {
            let subscribers = self.on_disconnect.lock().expect("subscriber lock poisoned");
            for subscriber in subscribers.iter() {
                subscriber(id);
            }
        }
    }

    /// Pick and remove an inbound victim so a new inbound can be admitted.
    /// Preference order: peers without a completed handshake, then oldest
    /// `connected_at`, then lowest peer-id. NoBan peers are never evicted.
    pub fn evict_inbound_peer(&self) -> Option<i32> {
        let victim = {
            let peers = self.peers.lock().expect("peer table lock poisoned");
            let mut candidates: Vec<(bool, u64, i32)> = peers
                .values()
                .filter_map(|p| {
                    let p = p.lock().expect("peer lock poisoned");
                    (p.direction == Direction::Inbound
                        && !p.permissions.contains(Permissions::NO_BAN))
                    .then_some((p.successfully_connected, p.connected_at, p.id))
                })
                .collect();
            candidates.sort();
            candidates.first().map(|&(_, _, id)| id)
        };
        if let Some(id) = victim {
            info!("evicting inbound peer {id}");
            self.remove_peer(id);
        }
        victim
    }

    // ---- misbehavior ----------------------------------------------------

    /// Apply a penalty. When the score crosses the threshold and the peer
    /// lacks NoBan, the address is discouraged and the peer removed.
    /// Returns true when the peer was disconnected.
    pub fn penalize(&self, id: i32, points: u32, reason: &str) -> bool {
        let Some(entry) = self.get_peer(id) else {
            return false;
        };
        let (score, addr, noban) = {
            let mut peer = entry.lock().expect("peer lock poisoned");
            peer.misbehavior = peer.misbehavior.saturating_add(points);
            (
                peer.misbehavior,
                peer.addr,
                peer.permissions.contains(Permissions::NO_BAN),
            )
        };
        warn!("peer {id} misbehaving (+{points}): {reason} (total {score})");

        if score >= DISCOURAGEMENT_THRESHOLD {
            if noban {
                debug!("peer {id} crossed threshold but has noban");
                return false;
            }
            self.discourage(addr.ip());
            self.remove_peer(id);
            return true;
        }
        false
    }

    pub fn discourage(&self, ip: IpAddr) {
        info!("discouraging {ip}");
        self.discouraged
            .lock()
            .expect("discouraged lock poisoned")
            .insert(super::types::ip_key(ip));
    }

    pub fn is_discouraged(&self, ip: IpAddr) -> bool {
        self.discouraged
            .lock()
            .expect("discouraged lock poisoned")
            .contains(&super::types::ip_key(ip))
    }

    // ---- bans and whitelist ---------------------------------------------

    pub fn ban(&self, ip: IpAddr, duration_secs: u64) {
        self.bans
            .lock()
            .expect("ban lock poisoned")
            .ban(super::types::ip_key(ip), duration_secs);
    }

    pub fn unban(&self, ip: IpAddr) -> bool {
        self.bans
            .lock()
            .expect("ban lock poisoned")
            .unban(&super::types::ip_key(ip))
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.bans
            .lock()
            .expect("ban lock poisoned")
            .is_banned(&super::types::ip_key(ip))
    }

    pub fn list_banned(&self) -> Vec<(String, BanEntry)> {
        self.bans.lock().expect("ban lock poisoned").entries()
    }

    pub fn clear_banned(&self) {
        self.bans.lock().expect("ban lock poisoned").clear();
    }

    pub fn expire_bans(&self) {
        self.bans.lock().expect("ban lock poisoned").expire();
    }

    /// Whitelist an address: clears any ban or discouragement and exempts
    /// the address from admission-time rejection. A later ban is recorded
    /// but does not affect admission while the whitelist entry stands.
    pub fn whitelist(&self, ip: IpAddr) {
        let key = super::types::ip_key(ip);
        self.bans.lock().expect("ban lock poisoned").unban(&key);
        self.discouraged
            .lock()
            .expect("discouraged lock poisoned")
            .remove(&key);
        self.whitelist
            .lock()
            .expect("whitelist lock poisoned")
            .insert(key);
    }

    pub fn is_whitelisted(&self, ip: IpAddr) -> bool {
        self.is_whitelisted_ip(&super::types::ip_key(ip))
    }

    fn is_whitelisted_ip(&self, ip: &[u8; 16]) -> bool {
        self.whitelist
            .lock()
            .expect("whitelist lock poisoned")
            .contains(ip)
    }

    // ---- persistence ----------------------------------------------------

    pub fn load_bans<P: AsRef<Path>>(&self, path: P) {
        *self.bans.lock().expect("ban lock poisoned") = BanList::load(path);
    }

    pub fn save_bans<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        self.bans.lock().expect("ban lock poisoned").save(path)
    }

    // ---- shutdown -------------------------------------------------------

    /// Disable subscriber callbacks, then remove every peer. Callbacks are
    /// disabled first so components already shutting down are not
    /// re-entered.
    pub fn shutdown(&self) {
        self.callbacks_enabled.store(false, Ordering::Release);
        for id in self.peer_ids() {
            self.remove_peer(id);
        }
    }
}

fn count_directions(peers: &HashMap<i32, Arc<Mutex<Peer>>>) -> (usize, usize) {
    let mut outbound = 0;
    let mut inbound = 0;
    for peer in peers.values() {
        let peer = peer.lock().expect("peer lock poisoned");
        match peer.direction {
            Direction::Inbound => inbound += 1,
            Direction::Outbound | Direction::Manual => outbound += 1,
            Direction::Feeler => {}
        }
    }
    (outbound, inbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::peer::SendQueue;
    use crate::net::types::loopback;
    use std::net::SocketAddr;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ConnLimits::default())
    }

    fn make_peer(cm: &ConnectionManager, addr: SocketAddr, direction: Direction) -> i32 {
        let id = cm.allocate_peer_id();
        let (queue, _drain) = SendQueue::new();
        let peer = Peer::new(id, addr, direction, Permissions::empty(), rand::random(), queue);
        cm.add_peer_with_id(id, peer).unwrap();
        id
    }

    #[test]
    fn peer_ids_are_monotonic_and_unique() {
        let cm = manager();
        let ids: Vec<i32> = (0..100).map(|_| cm.allocate_peer_id()).collect();
        for window in ids.windows(2) {
            assert!(window[1] > window[0]);
        }
    }

    #[test]
    fn duplicate_address_rejected() {
        let cm = manager();
        let addr: SocketAddr = "5.6.7.8:8444".parse().unwrap();
        make_peer(&cm, addr, Direction::Outbound);

        let id = cm.allocate_peer_id();
        let (queue, _drain) = SendQueue::new();
        let peer = Peer::new(id, addr, Direction::Outbound, Permissions::empty(), 1, queue);
        assert_eq!(
            cm.add_peer_with_id(id, peer).unwrap_err(),
            ConnectionError::AlreadyConnected
        );
    }

    #[test]
    fn outbound_slots_are_capped() {
        let cm = ConnectionManager::new(ConnLimits {
            max_outbound: 2,
            ..Default::default()
        });
        make_peer(&cm, "1.0.0.1:1".parse().unwrap(), Direction::Outbound);
        make_peer(&cm, "1.0.0.2:1".parse().unwrap(), Direction::Outbound);
        assert!(!cm.needs_more_outbound());

        let id = cm.allocate_peer_id();
        let (queue, _drain) = SendQueue::new();
        let peer = Peer::new(
            id,
            "1.0.0.3:1".parse().unwrap(),
            Direction::Outbound,
            Permissions::empty(),
            1,
            queue,
        );
        assert_eq!(
            cm.add_peer_with_id(id, peer).unwrap_err(),
            ConnectionError::NoSlotsAvailable
        );
    }

    #[test]
    fn per_ip_inbound_cap() {
        let cm = manager();
        make_peer(&cm, "9.9.9.9:1000".parse().unwrap(), Direction::Inbound);
        make_peer(&cm, "9.9.9.9:1001".parse().unwrap(), Direction::Inbound);
        assert!(!cm.can_accept_inbound_from("9.9.9.9".parse().unwrap()));
        assert!(cm.can_accept_inbound_from("9.9.9.8".parse().unwrap()));
    }

    #[test]
    fn banned_address_refused_until_whitelisted() {
        let cm = manager();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        cm.ban(ip, 0);
        assert!(!cm.can_accept_inbound_from(ip));

        let id = cm.allocate_peer_id();
        let (queue, _drain) = SendQueue::new();
        let peer = Peer::new(
            id,
            "10.0.0.1:5000".parse().unwrap(),
            Direction::Inbound,
            Permissions::empty(),
            1,
            queue,
        );
        assert_eq!(
            cm.add_peer_with_id(id, peer).unwrap_err(),
            ConnectionError::AddressBanned
        );

        cm.whitelist(ip);
        assert!(cm.can_accept_inbound_from(ip));
        // A later ban is recorded but admission stays open.
        cm.ban(ip, 0);
        assert!(cm.is_banned(ip));
        assert!(cm.can_accept_inbound_from(ip));
    }

    #[test]
    fn whitelist_clears_discouragement() {
        let cm = manager();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        cm.discourage(ip);
        assert!(!cm.can_accept_inbound_from(ip));
        cm.whitelist(ip);
        assert!(!cm.is_discouraged(ip));
        assert!(cm.can_accept_inbound_from(ip));
    }

    #[test]
    fn penalty_threshold_discourages_and_removes() {
        let cm = manager();
        let id = make_peer(&cm, "7.7.7.7:1234".parse().unwrap(), Direction::Inbound);

        assert!(!cm.penalize(id, 20, "oversized message"));
        assert!(cm.get_peer(id).is_some());

        for _ in 0..3 {
            cm.penalize(id, 20, "oversized message");
        }
        assert!(cm.penalize(id, 20, "oversized message"));
        assert!(cm.get_peer(id).is_none());
        assert!(cm.is_discouraged("7.7.7.7".parse().unwrap()));
    }

    #[test]
    fn noban_peer_survives_threshold() {
        let cm = manager();
        let id = cm.allocate_peer_id();
        let (queue, _drain) = SendQueue::new();
        let peer = Peer::new(
            id,
            "7.7.7.8:1234".parse().unwrap(),
            Direction::Inbound,
            Permissions::NO_BAN,
            1,
            queue,
        );
        cm.add_peer_with_id(id, peer).unwrap();

        assert!(!cm.penalize(id, 200, "invalid pow"));
        assert!(cm.get_peer(id).is_some());
        assert!(!cm.is_discouraged("7.7.7.8".parse().unwrap()));
    }

    #[test]
    fn eviction_prefers_unhandshaked_then_oldest_then_lowest_id() {
        let cm = manager();
        let a = make_peer(&cm, "2.0.0.1:1".parse().unwrap(), Direction::Inbound);
        let b = make_peer(&cm, "2.0.0.2:1".parse().unwrap(), Direction::Inbound);
        let c = make_peer(&cm, "2.0.0.3:1".parse().unwrap(), Direction::Inbound);

        // a and c complete handshakes; b does not.
        for id in [a, c] {
            let peer = cm.get_peer(id).unwrap();
            peer.lock().unwrap().latch_ready();
        }
        assert_eq!(cm.evict_inbound_peer(), Some(b));

        // Remaining peers share connected_at; lowest id loses.
        assert_eq!(cm.evict_inbound_peer(), Some(a));
    }

    #[test]
    fn disconnect_subscriber_fires_once_per_removal() {
        let cm = manager();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        cm.subscribe_disconnect(Box::new(move |id| {
            sink.lock().unwrap().push(id);
        }));

        let id = make_peer(&cm, "3.0.0.1:1".parse().unwrap(), Direction::Outbound);
        cm.remove_peer(id);
        cm.remove_peer(id);
        assert_eq!(*fired.lock().unwrap(), vec![id]);
    }

    #[test]
    fn shutdown_disables_callbacks() {
        let cm = manager();
        let fired = Arc::new(Mutex::new(0));
        let sink = fired.clone();
        cm.subscribe_disconnect(Box::new(move |_| {
            *sink.lock().unwrap() += 1;
        }));
        make_peer(&cm, "3.0.0.2:1".parse().unwrap(), Direction::Outbound);
        cm.shutdown();
        assert_eq!(cm.count(), 0);
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[test]
    fn ban_save_load_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banlist.json");

        let mut bans = BanList::new();
        bans.ban(crate::net::types::parse_ip16("10.0.0.1").unwrap(), 0);
        bans.ban(crate::net::types::parse_ip16("10.0.0.2").unwrap(), 3600);
        bans.save(&path).unwrap();

        let loaded = BanList::load(&path);
        assert_eq!(loaded.len(), 2);
        assert!(loaded.is_banned(&crate::net::types::parse_ip16("10.0.0.1").unwrap()));

        // Round-trip again: same set of banned addresses.
        let path2 = dir.path().join("banlist2.json");
        loaded.save(&path2).unwrap();
        let reloaded = BanList::load(&path2);
        let mut lhs: Vec<String> = loaded.entries().into_iter().map(|(ip, _)| ip).collect();
        let mut rhs: Vec<String> = reloaded.entries().into_iter().map(|(ip, _)| ip).collect();
        lhs.sort();
        rhs.sort();
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn missing_ban_file_loads_empty() {
        let loaded = BanList::load("/nonexistent/banlist.json");
        assert!(loaded.is_empty());
    }

    #[test]
    fn discouraged_set_is_bounded_fifo() {
        let mut set = DiscouragedSet::new(3);
        for i in 0..5u8 {
            let mut ip = [0u8; 16];
            ip[15] = i;
            set.insert(ip);
        }
        assert_eq!(set.len(), 3);
        let mut oldest = [0u8; 16];
        oldest[15] = 0;
        assert!(!set.contains(&oldest));
        let mut newest = [0u8; 16];
        newest[15] = 4;
        assert!(newest != oldest && set.contains(&newest));
    }

    #[test]
    fn eviction_skips_noban() {
        let cm = manager();
        let id = cm.allocate_peer_id();
        let (queue, _drain) = SendQueue::new();
        let peer = Peer::new(
            id,
            loopback(1),
            Direction::Inbound,
            Permissions::NO_BAN,
            1,
            queue,
        );
        cm.add_peer_with_id(id, peer).unwrap();
        assert_eq!(cm.evict_inbound_peer(), None);
    }
}
