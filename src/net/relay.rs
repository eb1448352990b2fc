//! Block announcement and INV relay
//!
//! Each peer carries an ordered, deduplicated queue of block hashes
//! awaiting announcement. New tips go out immediately to every handshaked
//! peer (minus whoever taught us the block); a periodic re-announce pushes
//! the current tip to peers on a TTL so partitioned nodes re-converge; a
//! one-second flush drains the queues into INV messages chunked to the
//! protocol limit.

use super::connman::ConnectionManager;
use super::message::{GetHeadersPayload, InvItem, InvType, Message};
use super::sync::SyncManager;
use super::types::{
    penalty, MAX_BLOCK_RELAY_AGE_SECS, MAX_INV_SIZE, PROTOCOL_VERSION,
    TIP_REANNOUNCE_INTERVAL_SECS,
};
use crate::chain::{ChainStore, IndexEntry};
use crate::types::{now, short_hash, Hash, ZERO_HASH};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

/// Origin records are dropped after this long; far past relay eligibility.
const ORIGIN_EXPIRE_SECS: u64 = 20 * 60;

struct BlockOrigin {
    first_seen: u64,
    from_peer: Option<i32>,
    announced_to: HashSet<i32>,
}

#[derive(Default)]
pub struct RelayManager {
    origins: Mutex<HashMap<Hash, BlockOrigin>>,
}

impl RelayManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record where and when we first learned a block. First writer wins.
    pub fn note_block(&self, hash: Hash, from_peer: Option<i32>) {
        self.origins
            .lock()
            .expect("relay lock poisoned")
            .entry(hash)
            .or_insert_with(|| BlockOrigin {
                first_seen: now(),
                from_peer,
                announced_to: HashSet::new(),
            });
    }

    /// Immediate relay on block connect. Skipped during initial block
    /// download and for blocks we first learned too long ago (a reorg
    /// replaying old blocks is not news).
    pub fn on_block_connected(
        &self,
        connman: &ConnectionManager,
        chain: &dyn ChainStore,
        entry: &IndexEntry,
    ) {
        if chain.is_initial_block_download() {
            return;
        }

        let hash = entry.hash;
        let mut origins = self.origins.lock().expect("relay lock poisoned");
        let origin = origins.entry(hash).or_insert_with(|| BlockOrigin {
            first_seen: now(),
            from_peer: None,
            announced_to: HashSet::new(),
        });
        if now().saturating_sub(origin.first_seen) > MAX_BLOCK_RELAY_AGE_SECS {
            return;
        }
        let source = origin.from_peer;

        for id in connman.peer_ids() {
            if Some(id) == source || origin.announced_to.contains(&id) {
                continue;
            }
            let Some(peer_entry) = connman.get_peer(id) else {
                continue;
            };
            let mut peer = peer_entry.lock().expect("peer lock poisoned");
            if !peer.is_ready() {
                continue;
            }
            // Prune from the pending queue so the flusher cannot send a
            // second copy of what we relay directly here.
            peer.remove_pending_announcement(&hash);
            if peer.send(Message::Inv(vec![InvItem::block(hash)])).is_ok() {
                origin.announced_to.insert(id);
            }
        }
        debug!("announced block {} to peers", short_hash(&hash));
    }

    /// Periodic tip re-announce: enqueue the current tip for every
    /// handshaked peer whose TTL has lapsed. Ignores the age filter.
    pub fn reannounce_tip(&self, connman: &ConnectionManager, chain: &dyn ChainStore) {
        if chain.is_initial_block_download() {
            return;
        }
        let tip = chain.tip_hash();
        let current = now();
        for id in connman.peer_ids() {
            let Some(entry) = connman.get_peer(id) else {
                continue;
            };
            let mut peer = entry.lock().expect("peer lock poisoned");
            if !peer.is_ready() {
                continue;
            }
            if current.saturating_sub(peer.last_tip_announce) < TIP_REANNOUNCE_INTERVAL_SECS {
                continue;
            }
            peer.last_tip_announce = current;
            peer.queue_block_announcement(tip);
        }
    }

    /// Drain every peer's announcement queue into INV messages, chunked to
    /// the protocol limit.
    pub fn flush(&self, connman: &ConnectionManager) {
        for id in connman.peer_ids() {
            let Some(entry) = connman.get_peer(id) else {
                continue;
            };
            let mut peer = entry.lock().expect("peer lock poisoned");
            if !peer.is_ready() {
                continue;
            }
            while !peer.blocks_for_inv_relay.is_empty() {
                let chunk = peer.take_announcements(MAX_INV_SIZE);
                let items: Vec<InvItem> = chunk.into_iter().map(InvItem::block).collect();
                if peer.send(Message::Inv(items)).is_err() {
                    break;
                }
            }
        }
    }

    /// INV receipt: decide at most once per message whether to chase the
    /// announced blocks, and issue at most one GETHEADERS for the whole
    /// message. Returns false when the peer was disconnected.
    pub fn handle_inv(
        &self,
        connman: &ConnectionManager,
        chain: &dyn ChainStore,
        sync: &SyncManager,
        peer_id: i32,
        items: &[InvItem],
    ) -> bool {
        if items.len() > MAX_INV_SIZE {
            return !connman.penalize(peer_id, penalty::OVERSIZED_MESSAGE, "oversized inv");
        }

        let unknown_block = items.iter().any(|item| {
            item.inv_type == InvType::Block && chain.lookup_block_index(&item.hash).is_none()
        });
        if !unknown_block {
            return true;
        }

        if chain.is_initial_block_download() && sync.sync_peer() != Some(peer_id) {
            debug!("ignoring block inv from non-sync peer {peer_id} during ibd");
            return true;
        }

        if let Some(entry) = connman.get_peer(peer_id) {
            let locator = chain.locator();
            let _ = entry
                .lock()
                .expect("peer lock poisoned")
                .send(Message::GetHeaders(GetHeadersPayload {
                    version: PROTOCOL_VERSION,
                    locator: locator.hashes,
                    hash_stop: ZERO_HASH,
                }));
        }
        true
    }

    /// Drop stale origin records.
    pub fn expire(&self) {
        let cutoff = now().saturating_sub(ORIGIN_EXPIRE_SECS);
        self.origins
            .lock()
            .expect("relay lock poisoned")
            .retain(|_, origin| origin.first_seen >= cutoff);
    }
}
