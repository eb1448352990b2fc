//! Header-sync orchestration
//!
//! One outbound peer at a time drives initial header download. Batches
//! run an ordered acceptance pipeline: unsolicited-sender gating, size,
//! parent-connectivity, continuity, a cheap batch pow pre-filter, the
//! post-IBD anti-DoS work gate, then per-header acceptance with exactly
//! one best-chain activation per batch.

use super::connman::ConnectionManager;
use super::message::{GetHeadersPayload, Message};
use super::orphans::{AdmitResult, OrphanPool};
use super::relay::RelayManager;
use super::types::{
    penalty, Direction, HEADERS_STALL_TIMEOUT_SECS, MAX_HEADERS_RESULTS,
    MAX_UNCONNECTING_HEADERS, MAX_UNSOLICITED_ANNOUNCEMENT, PROTOCOL_VERSION,
};
use crate::chain::{block_proof, BlockHeader, ChainError, ChainStore};
use crate::types::{now, short_hash, ZERO_HASH};
use std::sync::Mutex;
use tracing::{debug, info};

pub struct SyncManager {
    /// The designated sync peer, if any. Cleared only on disconnect.
    sync_peer: Mutex<Option<i32>>,
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncManager {
    pub fn new() -> Self {
        Self {
            sync_peer: Mutex::new(None),
        }
    }

    pub fn sync_peer(&self) -> Option<i32> {
        *self.sync_peer.lock().expect("sync lock poisoned")
    }

    /// Designate a sync peer if none is set. Eligible peers are outbound,
    /// handshaked, and have never been designated on this connection.
    pub fn maybe_start_sync(&self, connman: &ConnectionManager, chain: &dyn ChainStore) {
        let mut sync_peer = self.sync_peer.lock().expect("sync lock poisoned");
        if let Some(id) = *sync_peer {
            if connman.get_peer(id).is_some() {
                return;
            }
            // Stale designation for a peer that vanished.
            *sync_peer = None;
        }

        let mut candidates: Vec<i32> = connman
            .peer_infos()
            .into_iter()
            .filter(|info| {
                matches!(info.direction, Direction::Outbound | Direction::Manual)
                    && info.successfully_connected
                    && !info.sync_started
            })
            .map(|info| info.id)
            .collect();
        candidates.sort_unstable();

        for id in candidates {
            let Some(entry) = connman.get_peer(id) else {
                continue;
            };
            let locator = chain.locator_from_prev();
            let sent = {
                let mut peer = entry.lock().expect("peer lock poisoned");
                peer.sync_started = true;
                peer.last_headers_time = now();
                peer.send(Message::GetHeaders(GetHeadersPayload {
                    version: PROTOCOL_VERSION,
                    locator: locator.hashes.clone(),
                    hash_stop: ZERO_HASH,
                }))
                .is_ok()
            };
            if sent {
                info!("selected peer {id} for header sync");
                *sync_peer = Some(id);
                return;
            }
            // Send failed: the writer is gone and the connection task is
            // already tearing this peer down. Try the next candidate.
        }
    }

    /// Disconnect the sync peer when it has gone quiet past the stall
    /// timeout. Reselection happens on the periodic cadence.
    pub fn check_stall(&self, connman: &ConnectionManager) {
        let Some(id) = self.sync_peer() else {
            return;
        };
        let Some(entry) = connman.get_peer(id) else {
            self.note_disconnect(id);
            return;
        };
        let last = entry.lock().expect("peer lock poisoned").last_headers_time;
        if now().saturating_sub(last) > HEADERS_STALL_TIMEOUT_SECS {
            info!("sync peer {id} stalled, disconnecting");
            connman.remove_peer(id);
        }
    }

    /// Clear the designation when the sync peer disconnects. The peer's
    /// `sync_started` flag dies with the connection; nothing else clears
    /// it.
    pub fn note_disconnect(&self, peer_id: i32) {
        let mut sync_peer = self.sync_peer.lock().expect("sync lock poisoned");
        if *sync_peer == Some(peer_id) {
            *sync_peer = None;
        }
    }

    /// HEADERS receipt pipeline. Returns false when the peer was
    /// disconnected for a violation.
    pub fn handle_headers(
        &self,
        connman: &ConnectionManager,
        chain: &dyn ChainStore,
        orphans: &Mutex<OrphanPool>,
        relay: &RelayManager,
        peer_id: i32,
        headers: Vec<BlockHeader>,
    ) -> bool {
        let is_sync_peer = self.sync_peer() == Some(peer_id);

        // Unsolicited senders get a tiny announcement budget during IBD.
        if chain.is_initial_block_download()
            && !is_sync_peer
            && headers.len() > MAX_UNSOLICITED_ANNOUNCEMENT
        {
            debug!("ignoring {} unsolicited headers from peer {peer_id}", headers.len());
            return true;
        }

        if headers.len() > MAX_HEADERS_RESULTS {
            return !connman.penalize(peer_id, penalty::OVERSIZED_MESSAGE, "oversized headers");
        }

        let Some(entry) = connman.get_peer(peer_id) else {
            return false;
        };

        if headers.is_empty() {
            // An empty batch is a valid "nothing past your locator" reply;
            // the sync designation stays.
            entry.lock().expect("peer lock poisoned").last_headers_time = now();
            return true;
        }

        // Parent connectivity of the first header. Unknown parents are not
        // fatal (the batch may orphan), but a peer that keeps sending
        // unconnecting batches is wasting our time.
        if chain.lookup_block_index(&headers[0].prev).is_none() {
            let strikes = {
                let mut peer = entry.lock().expect("peer lock poisoned");
                peer.unconnecting_headers += 1;
                peer.unconnecting_headers
            };
            debug!(
                "peer {peer_id} sent unconnecting headers ({strikes} strikes), first parent {}",
                short_hash(&headers[0].prev)
            );
            if strikes > MAX_UNCONNECTING_HEADERS
                && connman.penalize(peer_id, penalty::UNCONNECTING_HEADERS, "unconnecting headers")
            {
                return false;
            }
        }

        for window in headers.windows(2) {
            if window[1].prev != window[0].hash() {
                return !connman.penalize(
                    peer_id,
                    penalty::NON_CONTINUOUS_HEADERS,
                    "non-continuous headers",
                );
            }
        }

        // Replaying a header we already rejected from this peer earns the
        // invalid-header penalty without another validation pass.
        {
            let peer = entry.lock().expect("peer lock poisoned");
            if headers
                .iter()
                .any(|h| peer.has_sent_invalid_header(&h.hash()))
            {
                drop(peer);
                return !connman.penalize(peer_id, penalty::INVALID_HEADER, "replayed invalid header");
            }
        }

        if !chain.verify_headers_pow(&headers) {
            return !connman.penalize(peer_id, penalty::INVALID_POW, "invalid header pow");
        }

        // Anti-DoS work gate; a zero threshold (IBD) disables it.
        let threshold = chain.anti_dos_work_threshold();
        if threshold > 0
            && let Some(parent) = chain.lookup_block_index(&headers[0].prev)
        {
            let batch_work: u128 = headers
                .iter()
                .fold(parent.chain_work, |acc, h| {
                    acc.saturating_add(block_proof(h.bits))
                });
            if batch_work < threshold {
                return !connman.penalize(
                    peer_id,
                    penalty::LOW_WORK_HEADERS,
                    "low-work headers batch",
                );
            }
        }

        // Per-header acceptance. Any verdict still activates exactly once.
        enum Verdict {
            Clean,
            TooManyOrphans,
            Invalid,
        }
        let mut verdict = Verdict::Clean;

        for header in &headers {
            match chain.accept_block_header(header, peer_id, true) {
                Ok(entry_node) => {
                    relay.note_block(entry_node.hash, Some(peer_id));
                    let cascaded = orphans
                        .lock()
                        .expect("orphan lock poisoned")
                        .on_header_accepted(entry_node.hash, chain);
                    for hash in cascaded {
                        relay.note_block(hash, Some(peer_id));
                    }
                }
                Err(ChainError::PrevBlockNotFound) => {
                    let admit = orphans
                        .lock()
                        .expect("orphan lock poisoned")
                        .admit(*header, peer_id);
                    if admit == AdmitResult::PeerLimit {
                        verdict = Verdict::TooManyOrphans;
                        break;
                    }
                }
                Err(err) => {
                    debug!("header {} rejected: {err}", short_hash(&header.hash()));
                    entry
                        .lock()
                        .expect("peer lock poisoned")
                        .record_invalid_header(header.hash());
                    verdict = Verdict::Invalid;
                    break;
                }
            }
        }

        chain.activate_best_chain();

        match verdict {
            Verdict::TooManyOrphans => {
                return !connman.penalize(peer_id, penalty::TOO_MANY_ORPHANS, "too many orphans");
            }
            Verdict::Invalid => {
                return !connman.penalize(peer_id, penalty::INVALID_HEADER, "invalid header");
            }
            Verdict::Clean => {}
        }

        {
            let mut peer = entry.lock().expect("peer lock poisoned");
            peer.last_headers_time = now();
            // A connecting batch resets the unconnecting counter.
            if chain.lookup_block_index(&headers[0].prev).is_some() {
                peer.unconnecting_headers = 0;
            }

            // A full batch means the peer has more; pull immediately.
            if headers.len() == MAX_HEADERS_RESULTS {
                let locator = chain.locator();
                let _ = peer.send(Message::GetHeaders(GetHeadersPayload {
                    version: PROTOCOL_VERSION,
                    locator: locator.hashes,
                    hash_stop: ZERO_HASH,
                }));
            }
        }

        true
    }

    /// Serve a GETHEADERS request from the active chain.
    pub fn serve_getheaders(
        &self,
        connman: &ConnectionManager,
        chain: &dyn ChainStore,
        peer_id: i32,
        request: &GetHeadersPayload,
    ) {
        let headers =
            chain.headers_after_locator(&request.locator, &request.hash_stop, MAX_HEADERS_RESULTS);
        debug!("serving {} headers to peer {peer_id}", headers.len());
        if let Some(entry) = connman.get_peer(peer_id) {
            let _ = entry
                .lock()
                .expect("peer lock poisoned")
                .send(Message::Headers(headers));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::{mine_chain, mine_header, MemoryChainStore};
    use crate::chain::REGTEST_BITS;
    use crate::net::connman::ConnLimits;
    use crate::net::peer::{Peer, SendQueue, SendQueueDrain};
    use crate::net::types::Permissions;

    struct Rig {
        connman: ConnectionManager,
        chain: MemoryChainStore,
        orphans: Mutex<OrphanPool>,
        relay: RelayManager,
        sync: SyncManager,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                connman: ConnectionManager::new(ConnLimits::default()),
                chain: MemoryChainStore::new(),
                orphans: Mutex::new(OrphanPool::new()),
                relay: RelayManager::new(),
                sync: SyncManager::new(),
            }
        }

        fn add_ready_peer(&self, direction: Direction, port: u16) -> (i32, SendQueueDrain) {
            let id = self.connman.allocate_peer_id();
            let (queue, drain) = SendQueue::new();
            let mut peer = Peer::new(
                id,
                format!("8.0.0.{}:{port}", (id % 250) + 1).parse().unwrap(),
                direction,
                Permissions::empty(),
                rand::random(),
                queue,
            );
            peer.latch_ready();
            self.connman.add_peer_with_id(id, peer).unwrap();
            (id, drain)
        }

        fn handle(&self, peer_id: i32, headers: Vec<BlockHeader>) -> bool {
            self.sync.handle_headers(
                &self.connman,
                &self.chain,
                &self.orphans,
                &self.relay,
                peer_id,
                headers,
            )
        }
    }

    fn continuous_headers(chain: &MemoryChainStore, count: usize) -> Vec<BlockHeader> {
        let mut prev = chain.tip_hash();
        let mut headers = Vec::with_capacity(count);
        for i in 0..count {
            let header = mine_header(prev, [1; 20], 1_700_000_100 + i as u32, REGTEST_BITS);
            prev = header.hash();
            headers.push(header);
        }
        headers
    }

    #[test]
    fn selects_single_outbound_sync_peer() {
        let rig = Rig::new();
        let (a, _da) = rig.add_ready_peer(Direction::Outbound, 1);
        let (_b, _db) = rig.add_ready_peer(Direction::Outbound, 2);

        rig.sync.maybe_start_sync(&rig.connman, &rig.chain);
        assert_eq!(rig.sync.sync_peer(), Some(a));

        // Second call keeps the designation.
        rig.sync.maybe_start_sync(&rig.connman, &rig.chain);
        assert_eq!(rig.sync.sync_peer(), Some(a));

        let peer = rig.connman.get_peer(a).unwrap();
        assert!(peer.lock().unwrap().sync_started);
    }

    #[test]
    fn inbound_peers_never_selected() {
        let rig = Rig::new();
        rig.add_ready_peer(Direction::Inbound, 1);
        rig.sync.maybe_start_sync(&rig.connman, &rig.chain);
        assert_eq!(rig.sync.sync_peer(), None);
    }

    #[test]
    fn sync_started_survives_empty_batch_but_not_disconnect() {
        let rig = Rig::new();
        let (id, _drain) = rig.add_ready_peer(Direction::Outbound, 1);
        rig.sync.maybe_start_sync(&rig.connman, &rig.chain);

        assert!(rig.handle(id, vec![]));
        assert_eq!(rig.sync.sync_peer(), Some(id));

        rig.connman.remove_peer(id);
        rig.sync.note_disconnect(id);
        assert_eq!(rig.sync.sync_peer(), None);
    }

    #[test]
    fn accepts_continuous_batch_and_activates() {
        let rig = Rig::new();
        let (id, _drain) = rig.add_ready_peer(Direction::Outbound, 1);
        rig.sync.maybe_start_sync(&rig.connman, &rig.chain);

        let headers = continuous_headers(&rig.chain, 20);
        assert!(rig.handle(id, headers.clone()));
        assert_eq!(rig.chain.chain_height(), 20);
        assert_eq!(rig.chain.tip_hash(), headers.last().unwrap().hash());
    }

    #[test]
    fn oversized_batch_penalized_not_disconnected_once() {
        let rig = Rig::new();
        let (id, _drain) = rig.add_ready_peer(Direction::Outbound, 1);
        rig.sync.maybe_start_sync(&rig.connman, &rig.chain);

        let headers = continuous_headers(&rig.chain, MAX_HEADERS_RESULTS + 1);
        assert!(rig.handle(id, headers));

        let peer = rig.connman.get_peer(id).unwrap();
        assert_eq!(peer.lock().unwrap().misbehavior, penalty::OVERSIZED_MESSAGE);
    }

    #[test]
    fn five_oversized_batches_disconnect() {
        let rig = Rig::new();
        let (id, _drain) = rig.add_ready_peer(Direction::Outbound, 1);
        rig.sync.maybe_start_sync(&rig.connman, &rig.chain);

        let headers = continuous_headers(&rig.chain, MAX_HEADERS_RESULTS + 1);
        for round in 0..5 {
            let keep = rig.handle(id, headers.clone());
            if round < 4 {
                assert!(keep, "round {round} should not disconnect");
            } else {
                assert!(!keep, "fifth offense crosses the threshold");
            }
        }
        assert!(rig.connman.get_peer(id).is_none());
    }

    #[test]
    fn non_continuous_batch_penalized() {
        let rig = Rig::new();
        let (id, _drain) = rig.add_ready_peer(Direction::Outbound, 1);
        rig.sync.maybe_start_sync(&rig.connman, &rig.chain);

        let mut headers = continuous_headers(&rig.chain, 5);
        headers[3].prev = [0xEE; 32];
        // Re-mine so the commitment stays valid after mutation.
        headers[3] = mine_header(headers[3].prev, [1; 20], headers[3].time, REGTEST_BITS);
        assert!(rig.handle(id, headers));

        let peer = rig.connman.get_peer(id).unwrap();
        assert_eq!(
            peer.lock().unwrap().misbehavior,
            penalty::NON_CONTINUOUS_HEADERS
        );
    }

    #[test]
    fn invalid_pow_disconnects_immediately() {
        let rig = Rig::new();
        let (id, _drain) = rig.add_ready_peer(Direction::Outbound, 1);
        rig.sync.maybe_start_sync(&rig.connman, &rig.chain);

        // Build a 10-header batch that is internally continuous but whose
        // fourth header carries a broken pow commitment.
        let mut headers = Vec::with_capacity(10);
        let mut prev = rig.chain.tip_hash();
        for i in 0..10u32 {
            let mut header = mine_header(prev, [1; 20], 1_700_000_100 + i, REGTEST_BITS);
            if i == 3 {
                header.pow_hash = [0xFF; 32];
            }
            prev = header.hash();
            headers.push(header);
        }
        assert!(!rig.handle(id, headers));
        assert!(rig.connman.get_peer(id).is_none());
        assert_eq!(rig.chain.chain_height(), 0);
    }

    #[test]
    fn unsolicited_big_batch_ignored_during_ibd() {
        let rig = Rig::new();
        assert!(rig.chain.is_initial_block_download());
        let (sync_id, _ds) = rig.add_ready_peer(Direction::Outbound, 1);
        let (other, _do) = rig.add_ready_peer(Direction::Outbound, 2);
        rig.sync.maybe_start_sync(&rig.connman, &rig.chain);
        assert_eq!(rig.sync.sync_peer(), Some(sync_id));

        let headers = continuous_headers(&rig.chain, 10);
        assert!(rig.handle(other, headers));
        // Ignored wholesale: nothing accepted, no penalty.
        assert_eq!(rig.chain.chain_height(), 0);
        let peer = rig.connman.get_peer(other).unwrap();
        assert_eq!(peer.lock().unwrap().misbehavior, 0);
    }

    #[test]
    fn orphan_batch_goes_to_pool_and_cascades_later() {
        let rig = Rig::new();
        let (id, _drain) = rig.add_ready_peer(Direction::Outbound, 1);
        rig.sync.maybe_start_sync(&rig.connman, &rig.chain);

        let chain_headers = continuous_headers(&rig.chain, 3);

        // Deliver children before the connecting header.
        assert!(rig.handle(id, vec![chain_headers[1], chain_headers[2]]));
        assert_eq!(rig.orphans.lock().unwrap().len(), 2);
        assert_eq!(rig.chain.chain_height(), 0);

        assert!(rig.handle(id, vec![chain_headers[0]]));
        assert!(rig.orphans.lock().unwrap().is_empty());
        assert_eq!(rig.chain.chain_height(), 3);
    }

    #[test]
    fn full_batch_requests_more() {
        let rig = Rig::new();
        let (id, mut drain) = rig.add_ready_peer(Direction::Outbound, 1);
        rig.sync.maybe_start_sync(&rig.connman, &rig.chain);

        let headers = continuous_headers(&rig.chain, MAX_HEADERS_RESULTS);
        assert!(rig.handle(id, headers));

        // First queued message is the initial sync GETHEADERS, second is
        // the follow-up triggered by the full batch.
        let mut getheaders = 0;
        while let Some(msg) = drain.try_recv_now() {
            if matches!(msg, Message::GetHeaders(_)) {
                getheaders += 1;
            }
        }
        assert_eq!(getheaders, 2);
    }

    #[test]
    fn serve_getheaders_respects_locator_and_cap() {
        let rig = Rig::new();
        let mined = mine_chain(&rig.chain, 30, 1_700_000_100);
        let (id, mut drain) = rig.add_ready_peer(Direction::Inbound, 1);

        // Peer claims to be at height 10; it should get the 20 after that.
        let request = GetHeadersPayload {
            version: PROTOCOL_VERSION,
            locator: vec![mined[9].hash()],
            hash_stop: ZERO_HASH,
        };
        rig.sync
            .serve_getheaders(&rig.connman, &rig.chain, id, &request);

        match drain.try_recv_now().expect("headers reply queued") {
            Message::Headers(headers) => {
                assert_eq!(headers.len(), 20);
                assert_eq!(headers[0].hash(), mined[10].hash());
            }
            other => panic!("expected headers, got {other:?}"),
        }
    }
}
