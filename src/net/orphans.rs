//! Orphan-header pool
//!
//! Headers whose parent we have not indexed yet wait here. The pool is
//! bounded globally and per source peer; when a parent is accepted, its
//! waiting children are re-submitted through the chain store, cascading
//! for arbitrarily deep chains delivered in reverse order.

use super::types::{MAX_ORPHAN_HEADERS, MAX_ORPHAN_HEADERS_PER_PEER, ORPHAN_HEADER_EXPIRE_SECS};
use crate::chain::{BlockHeader, ChainError, ChainStore};
use crate::types::{now, short_hash, Hash};
use std::collections::HashMap;
use tracing::debug;

/// Outcome of [`OrphanPool::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitResult {
    Stored,
    Duplicate,
    /// The source crossed its per-peer cap; caller applies the penalty.
    PeerLimit,
}

struct OrphanRecord {
    header: BlockHeader,
    from_peer: i32,
    received_at: u64,
}

#[derive(Default)]
pub struct OrphanPool {
    /// All orphans by their own hash.
    orphans: HashMap<Hash, OrphanRecord>,
    /// Children waiting on each parent hash.
    by_prev: HashMap<Hash, Vec<Hash>>,
    /// Per-source counts for cap enforcement.
    per_peer: HashMap<i32, usize>,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an orphan header from `peer_id`, evicting expired entries
    /// first and then the oldest if the global cap is hit.
    pub fn admit(&mut self, header: BlockHeader, peer_id: i32) -> AdmitResult {
        let hash = header.hash();
        if self.orphans.contains_key(&hash) {
            return AdmitResult::Duplicate;
        }
        if self.per_peer.get(&peer_id).copied().unwrap_or(0) >= MAX_ORPHAN_HEADERS_PER_PEER {
            return AdmitResult::PeerLimit;
        }

        if self.orphans.len() >= MAX_ORPHAN_HEADERS {
            self.expire();
        }
        while self.orphans.len() >= MAX_ORPHAN_HEADERS {
            self.evict_oldest();
        }

        debug!(
            "orphan header {} (parent {}) from peer {peer_id}",
            short_hash(&hash),
            short_hash(&header.prev)
        );
        self.by_prev.entry(header.prev).or_default().push(hash);
        self.orphans.insert(
            hash,
            OrphanRecord {
                header,
                from_peer: peer_id,
                received_at: now(),
            },
        );
        *self.per_peer.entry(peer_id).or_insert(0) += 1;
        AdmitResult::Stored
    }

    /// A parent was accepted: re-submit its waiting children through the
    /// chain store, recursing for each child that connects. Returns the
    /// hashes that were accepted.
    pub fn on_header_accepted(&mut self, parent_hash: Hash, chain: &dyn ChainStore) -> Vec<Hash> {
        let mut accepted = Vec::new();
        // Iterative cascade: reverse-order delivery can nest arbitrarily
        // deep, so no recursion.
        let mut work = vec![parent_hash];
        while let Some(parent) = work.pop() {
            let Some(children) = self.by_prev.remove(&parent) else {
                continue;
            };
            for child_hash in children {
                let Some(record) = self.orphans.remove(&child_hash) else {
                    continue;
                };
                self.decrement_peer(record.from_peer);
                match chain.accept_block_header(&record.header, record.from_peer, true) {
                    Ok(_) => {
                        accepted.push(child_hash);
                        work.push(child_hash);
                    }
                    Err(ChainError::PrevBlockNotFound) => {
                        // Parent vanished between admit and cascade; rare,
                        // drop the child rather than loop.
                        debug!("cascaded orphan {} still unconnected", short_hash(&child_hash));
                    }
                    Err(err) => {
                        debug!("cascaded orphan {} rejected: {err}", short_hash(&child_hash));
                    }
                }
            }
        }
        accepted
    }

    /// Drop orphans sourced from a disconnecting peer.
    pub fn remove_peer(&mut self, peer_id: i32) {
        let doomed: Vec<Hash> = self
            .orphans
            .iter()
            .filter(|(_, record)| record.from_peer == peer_id)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in doomed {
            self.remove(&hash);
        }
        self.per_peer.remove(&peer_id);
    }

    /// Drop expired orphans.
    pub fn expire(&mut self) {
        let cutoff = now().saturating_sub(ORPHAN_HEADER_EXPIRE_SECS);
        let expired: Vec<Hash> = self
            .orphans
            .iter()
            .filter(|(_, record)| record.received_at < cutoff)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            self.remove(&hash);
        }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.orphans.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn peer_count(&self, peer_id: i32) -> usize {
        self.per_peer.get(&peer_id).copied().unwrap_or(0)
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .orphans
            .iter()
            .min_by_key(|(_, record)| record.received_at)
            .map(|(hash, _)| *hash)
        {
            self.remove(&oldest);
        }
    }

    fn remove(&mut self, hash: &Hash) {
        if let Some(record) = self.orphans.remove(hash) {
            self.decrement_peer(record.from_peer);
            if let Some(siblings) = self.by_prev.get_mut(&record.header.prev) {
                siblings.retain(|sibling| sibling != hash);
                if siblings.is_empty() {
                    self.by_prev.remove(&record.header.prev);
                }
            }
        }
    }

    fn decrement_peer(&mut self, peer_id: i32) {
        if let Some(count) = self.per_peer.get_mut(&peer_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_peer.remove(&peer_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::{mine_header, MemoryChainStore};
    use crate::chain::REGTEST_BITS;

    fn orphan_with_parent(parent: Hash, salt: u32) -> BlockHeader {
        mine_header(parent, [salt as u8; 20], 1_700_000_000 + salt, REGTEST_BITS)
    }

    #[test]
    fn admit_rejects_duplicates() {
        let mut pool = OrphanPool::new();
        let header = orphan_with_parent([1; 32], 0);
        assert_eq!(pool.admit(header, 1), AdmitResult::Stored);
        assert_eq!(pool.admit(header, 1), AdmitResult::Duplicate);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn per_peer_cap_enforced() {
        let mut pool = OrphanPool::new();
        for i in 0..MAX_ORPHAN_HEADERS_PER_PEER as u32 {
            assert_eq!(
                pool.admit(orphan_with_parent([9; 32], i), 7),
                AdmitResult::Stored
            );
        }
        assert_eq!(
            pool.admit(orphan_with_parent([9; 32], 10_000), 7),
            AdmitResult::PeerLimit
        );
        // Another peer still has room.
        assert_eq!(
            pool.admit(orphan_with_parent([9; 32], 20_000), 8),
            AdmitResult::Stored
        );
    }

    #[test]
    fn global_cap_evicts_oldest() {
        let mut pool = OrphanPool::new();
        // Spread across many peer ids to dodge the per-peer cap.
        for i in 0..MAX_ORPHAN_HEADERS as u32 {
            let peer = (i / MAX_ORPHAN_HEADERS_PER_PEER as u32) as i32;
            pool.admit(orphan_with_parent([3; 32], i), peer);
        }
        assert_eq!(pool.len(), MAX_ORPHAN_HEADERS);
        pool.admit(orphan_with_parent([3; 32], 999_999), 999);
        assert!(pool.len() <= MAX_ORPHAN_HEADERS);
    }

    #[test]
    fn cascade_processes_reverse_order_chain() {
        let store = MemoryChainStore::new();
        let genesis = store.tip_hash();

        // Chain genesis -> a -> b -> c, delivered c, b first.
        let a = orphan_with_parent(genesis, 1);
        let b = orphan_with_parent(a.hash(), 2);
        let c = orphan_with_parent(b.hash(), 3);

        let mut pool = OrphanPool::new();
        pool.admit(c, 5);
        pool.admit(b, 5);
        assert_eq!(pool.len(), 2);

        // a arrives and connects; the cascade should pull in b then c.
        store.accept_block_header(&a, 5, true).unwrap();
        let accepted = pool.on_header_accepted(a.hash(), &store);
        assert_eq!(accepted, vec![b.hash(), c.hash()]);
        assert!(pool.is_empty());
        assert!(store.lookup_block_index(&c.hash()).is_some());

        store.activate_best_chain();
        assert_eq!(store.chain_height(), 3);
    }

    #[test]
    fn remove_peer_drops_its_orphans() {
        let mut pool = OrphanPool::new();
        pool.admit(orphan_with_parent([4; 32], 1), 1);
        pool.admit(orphan_with_parent([4; 32], 2), 2);
        pool.remove_peer(1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.peer_count(1), 0);
        assert_eq!(pool.peer_count(2), 1);
    }
}
