//! In-memory reference chain store
//!
//! Header tree with cumulative-work best-chain selection. This backs the
//! test binary and the integration suite; it implements the same
//! [`ChainStore`] contract a persistent store would.

use super::{
    block_proof, hash_meets_target, BlockConnectedCallback, BlockHeader, BlockStatus, ChainError,
    ChainStore, IndexEntry, Locator,
};
use crate::types::{now, short_hash, Hash};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Minimum-difficulty compact bits used by the test network.
pub const REGTEST_BITS: u32 = 0x207f_ffff;

/// Maximum tip age before the node considers itself in initial block
/// download (24 hours).
const MAX_TIP_AGE_SECS: u64 = 24 * 60 * 60;

/// Tolerated future drift on header timestamps (2 hours).
const MAX_FUTURE_HEADER_TIME: u64 = 2 * 60 * 60;

/// Depth of the anti-DoS work buffer behind the tip, in blocks.
const ANTI_DOS_DEPTH: u128 = 144;

/// Parameters fixing the genesis header.
#[derive(Debug, Clone, Copy)]
pub struct GenesisParams {
    pub version: i32,
    pub time: u32,
    pub bits: u32,
}

impl Default for GenesisParams {
    fn default() -> Self {
        Self {
            version: 1,
            time: 1_700_000_000,
            bits: REGTEST_BITS,
        }
    }
}

struct IndexedHeader {
    header: BlockHeader,
    entry: IndexEntry,
}

struct ChainInner {
    index: HashMap<Hash, IndexedHeader>,
    /// Active chain by height; `active[0]` is genesis.
    active: Vec<Hash>,
    /// Most-work valid tip candidate, activated lazily.
    best: Hash,
}

pub struct MemoryChainStore {
    inner: Mutex<ChainInner>,
    callbacks: Mutex<Vec<BlockConnectedCallback>>,
    genesis_hash: Hash,
    /// Latches true once the tip has been recent; never re-enters IBD.
    ibd_done: AtomicBool,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::with_genesis(GenesisParams::default())
    }

    pub fn with_genesis(params: GenesisParams) -> Self {
        let mut genesis = BlockHeader {
            version: params.version,
            prev: crate::types::ZERO_HASH,
            miner_address: [0u8; 20],
            time: params.time,
            bits: params.bits,
            nonce: 0,
            pow_hash: crate::types::ZERO_HASH,
        };
        genesis.pow_hash = genesis.pow_commitment();
        let genesis_hash = genesis.hash();

        let entry = IndexEntry {
            hash: genesis_hash,
            height: 0,
            chain_work: block_proof(params.bits),
            prev: crate::types::ZERO_HASH,
            status: BlockStatus::Valid,
        };

        let mut index = HashMap::new();
        index.insert(
            genesis_hash,
            IndexedHeader {
                header: genesis,
                entry,
            },
        );

        Self {
            inner: Mutex::new(ChainInner {
                index,
                active: vec![genesis_hash],
                best: genesis_hash,
            }),
            callbacks: Mutex::new(Vec::new()),
            genesis_hash,
            ibd_done: AtomicBool::new(false),
        }
    }

    fn tip_entry(inner: &ChainInner) -> &IndexEntry {
        let tip = inner.active.last().expect("active chain is never empty");
        &inner.index[tip].entry
    }

    fn locator_from(&self, start_height: u32) -> Locator {
        let inner = self.inner.lock().expect("chain lock poisoned");
        let mut hashes = Vec::new();
        let mut step = 1u32;
        let mut height = start_height.min(Self::tip_entry(&inner).height);
        loop {
            hashes.push(inner.active[height as usize]);
            if height == 0 {
                break;
            }
            // Exponential back-off after the first ten entries.
            if hashes.len() >= 10 {
                step = step.saturating_mul(2);
            }
            height = height.saturating_sub(step);
        }
        Locator { hashes }
    }
}

impl Default for MemoryChainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore for MemoryChainStore {
    fn accept_block_header(
        &self,
        header: &BlockHeader,
        peer_id: i32,
        _min_pow_checked: bool,
    ) -> Result<IndexEntry, ChainError> {
        let mut inner = self.inner.lock().expect("chain lock poisoned");
        let hash = header.hash();

        if let Some(existing) = inner.index.get(&hash) {
            if existing.entry.status == BlockStatus::Invalid {
                return Err(ChainError::CachedInvalid);
            }
            return Ok(existing.entry.clone());
        }

        // Full pow verification is cheap here, so it runs regardless of the
        // caller's batch pre-filter.
        if !header.commitment_valid() || !hash_meets_target(&header.pow_hash, header.bits) {
            return Err(ChainError::InvalidPow);
        }

        if (header.time as u64) > now().saturating_add(MAX_FUTURE_HEADER_TIME) {
            return Err(ChainError::Invalid("time-too-new"));
        }

        let parent = inner
            .index
            .get(&header.prev)
            .ok_or(ChainError::PrevBlockNotFound)?;
        if parent.entry.status == BlockStatus::Invalid {
            return Err(ChainError::Invalid("bad-prevblk"));
        }

        let entry = IndexEntry {
            hash,
            height: parent.entry.height + 1,
            chain_work: parent.entry.chain_work.saturating_add(block_proof(header.bits)),
            prev: header.prev,
            status: BlockStatus::Valid,
        };
        debug!(
            "indexed header {} height={} from peer {}",
            short_hash(&hash),
            entry.height,
            peer_id
        );

        let best_work = inner.index[&inner.best].entry.chain_work;
        if entry.chain_work > best_work {
            inner.best = hash;
        }
        inner.index.insert(
            hash,
            IndexedHeader {
                header: *header,
                entry: entry.clone(),
            },
        );
        Ok(entry)
    }

    fn activate_best_chain(&self) {
        let connected: Vec<(BlockHeader, IndexEntry)> = {
            let mut inner = self.inner.lock().expect("chain lock poisoned");
            let best = inner.best;
            if inner.active.last() == Some(&best) {
                return;
            }

            // Walk back from the new tip to the fork point with the current
            // active chain.
            let mut path = Vec::new();
            let mut cursor = best;
            let fork_height = loop {
                let node = &inner.index[&cursor];
                let height = node.entry.height as usize;
                if inner.active.get(height) == Some(&cursor) {
                    break height;
                }
                path.push(cursor);
                if height == 0 {
                    break 0;
                }
                cursor = node.entry.prev;
            };
            path.reverse();

            inner.active.truncate(fork_height + 1);
            for hash in &path {
                inner.active.push(*hash);
            }

            path.iter()
                .map(|h| {
                    let node = &inner.index[h];
                    (node.header, node.entry.clone())
                })
                .collect()
        };

        // Fire outside the chain lock; subscribers may re-enter.
        if !connected.is_empty() {
            let callbacks = self.callbacks.lock().expect("callback lock poisoned");
            for (header, entry) in &connected {
                for callback in callbacks.iter() {
                    callback(header, entry);
                }
            }
        }
    }

    fn chain_height(&self) -> u32 {
        let inner = self.inner.lock().expect("chain lock poisoned");
        Self::tip_entry(&inner).height
    }

    fn tip_hash(&self) -> Hash {
        let inner = self.inner.lock().expect("chain lock poisoned");
        Self::tip_entry(&inner).hash
    }

    fn tip_time(&self) -> u32 {
        let inner = self.inner.lock().expect("chain lock poisoned");
        let tip = inner.active.last().expect("active chain is never empty");
        inner.index[tip].header.time
    }

    fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }

    fn is_initial_block_download(&self) -> bool {
        if self.ibd_done.load(Ordering::Acquire) {
            return false;
        }
        let tip_time = self.tip_time() as u64;
        if now().saturating_sub(tip_time) < MAX_TIP_AGE_SECS {
            self.ibd_done.store(true, Ordering::Release);
            return false;
        }
        true
    }

    fn locator(&self) -> Locator {
        let height = self.chain_height();
        self.locator_from(height)
    }

    fn locator_from_prev(&self) -> Locator {
        let height = self.chain_height();
        self.locator_from(height.saturating_sub(1))
    }

    fn anti_dos_work_threshold(&self) -> u128 {
        if self.is_initial_block_download() {
            return 0;
        }
        let inner = self.inner.lock().expect("chain lock poisoned");
        let tip = Self::tip_entry(&inner);
        let tip_header = &inner.index[&tip.hash].header;
        tip.chain_work
            .saturating_sub(ANTI_DOS_DEPTH.saturating_mul(block_proof(tip_header.bits)))
    }

    fn verify_headers_pow(&self, headers: &[BlockHeader]) -> bool {
        headers.iter().all(BlockHeader::commitment_valid)
    }

    fn lookup_block_index(&self, hash: &Hash) -> Option<IndexEntry> {
        let inner = self.inner.lock().expect("chain lock poisoned");
        inner.index.get(hash).map(|node| node.entry.clone())
    }

    fn headers_after_locator(
        &self,
        locator: &[Hash],
        hash_stop: &Hash,
        max: usize,
    ) -> Vec<BlockHeader> {
        let inner = self.inner.lock().expect("chain lock poisoned");

        // First locator entry found on the active chain wins; genesis when
        // nothing matches.
        let mut start = 1usize;
        for hash in locator {
            if let Some(node) = inner.index.get(hash)
                && inner.active.get(node.entry.height as usize) == Some(hash)
            {
                start = node.entry.height as usize + 1;
                break;
            }
        }

        let mut result = Vec::new();
        for hash in inner.active.iter().skip(start) {
            if result.len() >= max {
                break;
            }
            result.push(inner.index[hash].header);
            if hash == hash_stop {
                break;
            }
        }
        result
    }

    fn subscribe_block_connected(&self, callback: BlockConnectedCallback) {
        self.callbacks
            .lock()
            .expect("callback lock poisoned")
            .push(callback);
    }
}

/// Grind a nonce until the pow commitment meets the target in `bits`.
/// Test-network difficulty makes this a handful of iterations.
pub fn mine_header(
    prev: Hash,
    miner_address: [u8; 20],
    time: u32,
    bits: u32,
) -> BlockHeader {
    let mut header = BlockHeader {
        version: 1,
        prev,
        miner_address,
        time,
        bits,
        nonce: 0,
        pow_hash: crate::types::ZERO_HASH,
    };
    loop {
        let commitment = header.pow_commitment();
        if hash_meets_target(&commitment, bits) {
            header.pow_hash = commitment;
            return header;
        }
        header.nonce = header.nonce.wrapping_add(1);
    }
}

/// Extend the store's active tip by `count` mined headers. Returns the new
/// tip entries in order. Test helper shared with the integration suite.
pub fn mine_chain(store: &MemoryChainStore, count: usize, start_time: u32) -> Vec<BlockHeader> {
    let mut prev = store.tip_hash();
    let mut headers = Vec::with_capacity(count);
    for i in 0..count {
        let header = mine_header(
            prev,
            [0xAA; 20],
            start_time.wrapping_add(i as u32 * 10),
            REGTEST_BITS,
        );
        prev = header.hash();
        store
            .accept_block_header(&header, -1, true)
            .expect("mined header accepted");
        headers.push(header);
    }
    store.activate_best_chain();
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn genesis_is_active_tip() {
        let store = MemoryChainStore::new();
        assert_eq!(store.chain_height(), 0);
        assert_eq!(store.tip_hash(), store.genesis_hash());
    }

    #[test]
    fn accept_and_activate_extends_chain() {
        let store = MemoryChainStore::new();
        let headers = mine_chain(&store, 5, 1_700_000_100);
        assert_eq!(store.chain_height(), 5);
        assert_eq!(store.tip_hash(), headers.last().unwrap().hash());
    }

    #[test]
    fn orphan_header_reports_prev_not_found() {
        let store = MemoryChainStore::new();
        let orphan = mine_header([7u8; 32], [0; 20], 1_700_000_100, REGTEST_BITS);
        assert_eq!(
            store.accept_block_header(&orphan, 1, true),
            Err(ChainError::PrevBlockNotFound)
        );
    }

    #[test]
    fn broken_commitment_is_invalid_pow() {
        let store = MemoryChainStore::new();
        let mut header = mine_header(store.tip_hash(), [0; 20], 1_700_000_100, REGTEST_BITS);
        header.pow_hash = [0xFF; 32];
        assert_eq!(
            store.accept_block_header(&header, 1, true),
            Err(ChainError::InvalidPow)
        );
    }

    #[test]
    fn reorg_to_more_work_chain() {
        let store = MemoryChainStore::new();
        let genesis = store.tip_hash();
        mine_chain(&store, 3, 1_700_000_100);
        let short_tip = store.tip_hash();

        // Competing branch from genesis with more blocks wins.
        let mut prev = genesis;
        for i in 0..5 {
            let header = mine_header(prev, [0xBB; 20], 1_700_000_500 + i * 10, REGTEST_BITS);
            prev = header.hash();
            store.accept_block_header(&header, 2, true).unwrap();
        }
        store.activate_best_chain();

        assert_eq!(store.chain_height(), 5);
        assert_ne!(store.tip_hash(), short_tip);
        assert_eq!(store.tip_hash(), prev);
    }

    #[test]
    fn block_connected_fires_per_activated_block() {
        let store = MemoryChainStore::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        store.subscribe_block_connected(Box::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        mine_chain(&store, 4, 1_700_000_100);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn locator_from_prev_skips_tip() {
        let store = MemoryChainStore::new();
        mine_chain(&store, 6, 1_700_000_100);
        let tip = store.tip_hash();
        let locator = store.locator_from_prev();
        assert_ne!(locator.hashes[0], tip);
        assert_eq!(*locator.hashes.last().unwrap(), store.genesis_hash());
    }

    #[test]
    fn serves_headers_after_locator_match() {
        let store = MemoryChainStore::new();
        let headers = mine_chain(&store, 10, 1_700_000_100);
        let locator = vec![headers[4].hash()];
        let served =
            store.headers_after_locator(&locator, &crate::types::ZERO_HASH, 2000);
        assert_eq!(served.len(), 5);
        assert_eq!(served[0].hash(), headers[5].hash());
    }

    #[test]
    fn unknown_locator_serves_from_genesis() {
        let store = MemoryChainStore::new();
        let headers = mine_chain(&store, 3, 1_700_000_100);
        let served =
            store.headers_after_locator(&[[9u8; 32]], &crate::types::ZERO_HASH, 2000);
        assert_eq!(served.len(), 3);
        assert_eq!(served[0].hash(), headers[0].hash());
    }

    #[test]
    fn old_genesis_means_ibd() {
        let store = MemoryChainStore::new();
        assert!(store.is_initial_block_download());
        // A recent tip latches IBD off permanently.
        mine_chain(&store, 1, now() as u32);
        assert!(!store.is_initial_block_download());
        assert!(!store.is_initial_block_download());
    }
}
