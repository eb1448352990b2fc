//! Address book with keyed bucket placement
//!
//! Two tables: **new** holds addresses we have only heard about, **tried**
//! holds addresses we have connected to. Placement is keyed SipHash over
//! netgroups so an attacker cannot aim addresses at chosen buckets, and
//! the key is persisted so placement survives restarts.

use super::types::{AddrKey, NetAddress};
use crate::types::now;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher24;
use std::collections::HashMap;
use std::hash::Hasher;
use std::path::Path;
use tracing::{debug, warn};

// Bucket configuration
const NEW_BUCKET_COUNT: usize = 1024;
const TRIED_BUCKET_COUNT: usize = 256;
const BUCKET_SIZE: usize = 64;

/// Entries older than this are purged from the new table.
const HORIZON_DAYS: u64 = 30;

/// Future-dated addresses beyond this skew are rejected outright.
const MAX_FUTURE_SKEW_SECS: u64 = 600;

/// Selection cooldown: an address tried this recently is not selected...
const SELECT_COOLDOWN_SECS: u64 = 600;

/// ...unless it has failed at least this many times, which bypasses the
/// cooldown so a mostly-dead address book cannot starve the dial loop.
const COOLDOWN_BYPASS_FAILURES: u32 = 10;

/// Exponential backoff base for failed addresses (seconds).
const RETRY_BASE_SECS: u64 = 10;

/// Backoff cap (1 hour).
const RETRY_MAX_SECS: u64 = 3600;

/// Where an entry currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    New,
    Tried,
}

/// One address book entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressInfo {
    pub addr: NetAddress,
    /// Last-seen timestamp carried in ADDR messages (self-reported).
    pub timestamp: u32,
    /// Who told us about this address (their 16-byte IP), for bucket
    /// source diversity.
    pub source: Option<[u8; 16]>,
    pub last_success: u64,
    pub last_try: u64,
    pub attempts: u32,
    pub placement: Placement,
}

impl AddressInfo {
    fn new(addr: NetAddress, timestamp: u32, source: Option<[u8; 16]>) -> Self {
        Self {
            addr,
            timestamp,
            source,
            last_success: 0,
            last_try: 0,
            attempts: 0,
            placement: Placement::New,
        }
    }

    /// Deprioritized outright: future-dated, long-stale never-successful,
    /// or hammered recently.
    fn is_terrible(&self, current: u64) -> bool {
        if (self.timestamp as u64) > current.saturating_add(MAX_FUTURE_SKEW_SECS) {
            return true;
        }
        if self.last_try > 0 && self.last_try > current.saturating_sub(60) && self.attempts >= 3 {
            return true;
        }
        if self.last_success == 0 && self.attempts >= 3 {
            return true;
        }
        if (self.timestamp as u64) < current.saturating_sub(HORIZON_DAYS * 24 * 60 * 60) {
            return true;
        }
        false
    }

    /// Selection weight in [0, 1]: failures and very recent attempts
    /// shrink the chance this entry is picked.
    fn chance(&self, current: u64) -> f64 {
        let mut chance = 1.0f64;
        if self.last_try > current.saturating_sub(600) {
            chance *= 0.01;
        }
        chance * 0.66f64.powi(self.attempts.min(8) as i32)
    }

    /// Exponential backoff window after repeated failures.
    fn retry_delay(&self) -> u64 {
        let shift = self.attempts.min(8);
        (RETRY_BASE_SECS << shift).min(RETRY_MAX_SECS)
    }
}

/// Serialized form of the whole book.
#[derive(Serialize, Deserialize)]
struct AddrBookFile {
    version: u32,
    key: String,
    entries: Vec<AddressInfo>,
}

const ADDR_FILE_VERSION: u32 = 1;

/// The address book.
pub struct AddrBook {
    /// Placement key; persisted so buckets are stable across restarts.
    key: [u8; 32],
    new_table: Vec<Option<usize>>,
    tried_table: Vec<Option<usize>>,
    entries: HashMap<usize, AddressInfo>,
    index: HashMap<AddrKey, usize>,
    next_idx: usize,
    new_count: usize,
    tried_count: usize,
    /// Accept non-routable addresses (test networks on loopback).
    allow_unroutable: bool,
}

impl AddrBook {
    pub fn new(allow_unroutable: bool) -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill(&mut key);
        Self::with_key(key, allow_unroutable)
    }

    fn with_key(key: [u8; 32], allow_unroutable: bool) -> Self {
        Self {
            key,
            new_table: vec![None; NEW_BUCKET_COUNT * BUCKET_SIZE],
            tried_table: vec![None; TRIED_BUCKET_COUNT * BUCKET_SIZE],
            entries: HashMap::new(),
            index: HashMap::new(),
            next_idx: 0,
            new_count: 0,
            tried_count: 0,
            allow_unroutable,
        }
    }

    // ---- mutation -------------------------------------------------------

    /// Insert a heard-about address. Returns true when stored.
    pub fn add(&mut self, addr: NetAddress, timestamp: u32, source: Option<[u8; 16]>) -> bool {
        let key = addr.key();
        if self.index.contains_key(&key) {
            return false;
        }
        if !self.allow_unroutable && !addr.is_routable() {
            return false;
        }
        let current = now();
        if (timestamp as u64) > current.saturating_add(MAX_FUTURE_SKEW_SECS) {
            return false;
        }

        let bucket = self.new_bucket(&addr, source.as_ref());
        let pos = self.bucket_position(&addr, bucket, true);
        let slot = bucket * BUCKET_SIZE + pos;

        if let Some(existing_idx) = self.new_table[slot] {
            if let Some(existing) = self.entries.get(&existing_idx)
                && !existing.is_terrible(current)
            {
                return false;
            }
            self.remove_from_new(existing_idx);
            if let Some(stale) = self.entries.remove(&existing_idx) {
                self.index.remove(&stale.addr.key());
            }
        }

        let idx = self.next_idx;
        self.next_idx += 1;
        self.entries
            .insert(idx, AddressInfo::new(addr, timestamp, source));
        self.index.insert(key, idx);
        self.new_table[slot] = Some(idx);
        self.new_count += 1;
        true
    }

    /// Batch insert from an ADDR message. Returns how many were stored.
    pub fn add_multiple(
        &mut self,
        addrs: &[(NetAddress, u32)],
        source: Option<[u8; 16]>,
    ) -> usize {
        addrs
            .iter()
            .filter(|(addr, timestamp)| self.add(*addr, *timestamp, source))
            .count()
    }

    /// A dial is starting: stamp the attempt time (cooldown input).
    pub fn mark_attempt(&mut self, key: &AddrKey) {
        if let Some(&idx) = self.index.get(key)
            && let Some(info) = self.entries.get_mut(&idx)
        {
            info.last_try = now();
        }
    }

    /// A connection attempt failed. Counts against selection chance and
    /// grows the backoff; never removes a tried entry.
    pub fn mark_failed(&mut self, key: &AddrKey) {
        if let Some(&idx) = self.index.get(key)
            && let Some(info) = self.entries.get_mut(&idx)
        {
            info.last_try = now();
            info.attempts = info.attempts.saturating_add(1);
        }
    }

    /// A connection succeeded: reset failure state and promote new → tried.
    pub fn mark_good(&mut self, key: &AddrKey) {
        let Some(&idx) = self.index.get(key) else {
            return;
        };
        let addr = {
            let Some(info) = self.entries.get_mut(&idx) else {
                return;
            };
            info.last_success = now();
            info.last_try = now();
            info.attempts = 0;
            info.timestamp = now() as u32;
            if info.placement == Placement::Tried {
                return;
            }
            info.addr
        };

        self.remove_from_new(idx);

        let bucket = self.tried_bucket(&addr);
        let pos = self.bucket_position(&addr, bucket, false);
        let slot = bucket * BUCKET_SIZE + pos;

        // A collision demotes the sitting entry back to new.
        if let Some(evicted_idx) = self.tried_table[slot] {
            self.tried_table[slot] = None;
            self.tried_count = self.tried_count.saturating_sub(1);
            self.reinsert_into_new(evicted_idx);
        }

        self.tried_table[slot] = Some(idx);
        self.tried_count += 1;
        if let Some(info) = self.entries.get_mut(&idx) {
            info.placement = Placement::Tried;
        }
    }

    /// Purge stale never-successful entries. New table only; tried entries
    /// are kept regardless of age.
    pub fn cleanup_stale(&mut self) {
        let current = now();
        let horizon = current.saturating_sub(HORIZON_DAYS * 24 * 60 * 60);
        let stale: Vec<(usize, AddrKey)> = self
            .entries
            .iter()
            .filter(|(_, info)| {
                info.placement == Placement::New
                    && info.last_success == 0
                    && (info.timestamp as u64) < horizon
            })
            .map(|(&idx, info)| (idx, info.addr.key()))
            .collect();
        for (idx, key) in stale {
            self.remove_from_new(idx);
            self.entries.remove(&idx);
            self.index.remove(&key);
        }
    }

    // ---- selection ------------------------------------------------------

    /// Pick an address to dial: 50/50 between tried and new when both are
    /// populated, weighted toward fresh low-failure entries, honoring the
    /// per-address cooldown.
    pub fn select(&self) -> Option<NetAddress> {
        let mut rng = ChaCha20Rng::from_entropy();
        let use_tried = match (self.tried_count, self.new_count) {
            (0, 0) => return None,
            (0, _) => false,
            (_, 0) => true,
            _ => rng.gen_bool(0.5),
        };
        self.select_from(use_tried, &mut rng, true)
    }

    /// Pick a feeler candidate from the new side.
    pub fn select_feeler(&self) -> Option<NetAddress> {
        if self.new_count == 0 {
            return None;
        }
        let mut rng = ChaCha20Rng::from_entropy();
        self.select_from(false, &mut rng, true)
    }

    fn select_from(
        &self,
        tried: bool,
        rng: &mut ChaCha20Rng,
        honor_cooldown: bool,
    ) -> Option<NetAddress> {
        let (table, bucket_count, populated) = if tried {
            (&self.tried_table, TRIED_BUCKET_COUNT, self.tried_count)
        } else {
            (&self.new_table, NEW_BUCKET_COUNT, self.new_count)
        };
        if populated == 0 {
            return None;
        }
        let current = now();

        // Sparse tables: scan directly, random probing would mostly miss.
        if populated <= 16 {
            let mut candidates: Vec<&AddressInfo> = table
                .iter()
                .flatten()
                .filter_map(|idx| self.entries.get(idx))
                .filter(|info| self.selectable(info, current, honor_cooldown))
                .collect();
            if candidates.is_empty() {
                return None;
            }
            let pick = rng.gen_range(0..candidates.len());
            return Some(candidates.swap_remove(pick).addr);
        }

        for _ in 0..5000 {
            let bucket = rng.gen_range(0..bucket_count);
            let pos = rng.gen_range(0..BUCKET_SIZE);
            if let Some(idx) = table[bucket * BUCKET_SIZE + pos]
                && let Some(info) = self.entries.get(&idx)
            {
                if !self.selectable(info, current, honor_cooldown) {
                    continue;
                }
                if rng.r#gen::<f64>() < info.chance(current) {
                    return Some(info.addr);
                }
            }
        }
        None
    }

    fn selectable(&self, info: &AddressInfo, current: u64, honor_cooldown: bool) -> bool {
        if info.is_terrible(current) {
            return false;
        }
        if honor_cooldown
            && info.attempts < COOLDOWN_BYPASS_FAILURES
            && info.last_try > 0
            && current.saturating_sub(info.last_try) < SELECT_COOLDOWN_SECS
        {
            return false;
        }
        true
    }

    /// Whether the dial loop should skip this address for now because of
    /// failure backoff.
    pub fn is_in_backoff(&self, key: &AddrKey) -> bool {
        let Some(&idx) = self.index.get(key) else {
            return false;
        };
        let Some(info) = self.entries.get(&idx) else {
            return false;
        };
        if info.attempts == 0 || info.last_try == 0 {
            return false;
        }
        now().saturating_sub(info.last_try) < info.retry_delay()
    }

    /// Up to `cap` shuffled addresses for a GETADDR reply. Non-routable
    /// and terrible entries are excluded.
    pub fn get_addresses(&self, cap: usize) -> Vec<(NetAddress, u32)> {
        let current = now();
        let mut result: Vec<(NetAddress, u32)> = self
            .entries
            .values()
            .filter(|info| !info.is_terrible(current))
            .filter(|info| self.allow_unroutable || info.addr.is_routable())
            .map(|info| (info.addr, info.timestamp))
            .collect();

        let mut rng = ChaCha20Rng::from_entropy();
        for i in (1..result.len()).rev() {
            let j = rng.gen_range(0..=i);
            result.swap(i, j);
        }
        result.truncate(cap);
        result
    }

    // ---- queries --------------------------------------------------------

    pub fn contains(&self, key: &AddrKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &AddrKey) -> Option<&AddressInfo> {
        self.index.get(key).and_then(|idx| self.entries.get(idx))
    }

    /// (new, tried) counts.
    pub fn size(&self) -> (usize, usize) {
        (self.new_count, self.tried_count)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ---- persistence ----------------------------------------------------

    /// Save as JSON, atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let file = AddrBookFile {
            version: ADDR_FILE_VERSION,
            key: hex::encode(self.key),
            entries: self.entries.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&file)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        super::connman::atomic_write(path.as_ref(), &data)
    }

    /// Load from JSON. A missing file yields an empty book; a corrupt file
    /// is logged and yields an empty book.
    pub fn load<P: AsRef<Path>>(path: P, allow_unroutable: bool) -> Self {
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Self::new(allow_unroutable);
            }
            Err(err) => {
                warn!("failed to read address book: {err}");
                return Self::new(allow_unroutable);
            }
        };
        let file: AddrBookFile = match serde_json::from_slice(&data) {
            Ok(file) => file,
            Err(err) => {
                warn!("failed to parse address book, starting empty: {err}");
                return Self::new(allow_unroutable);
            }
        };
        let key: [u8; 32] = match hex::decode(&file.key)
            .ok()
            .and_then(|k| k.try_into().ok())
        {
            Some(key) => key,
            None => {
                warn!("address book key malformed, starting empty");
                return Self::new(allow_unroutable);
            }
        };

        let mut book = Self::with_key(key, allow_unroutable);
        for info in file.entries {
            book.restore(info);
        }
        debug!(
            "loaded address book: {} new, {} tried",
            book.new_count, book.tried_count
        );
        book
    }

    /// Re-place one persisted entry into its table.
    fn restore(&mut self, info: AddressInfo) {
        let key = info.addr.key();
        if self.index.contains_key(&key) {
            return;
        }
        let idx = self.next_idx;
        self.next_idx += 1;

        match info.placement {
            Placement::New => {
                let bucket = self.new_bucket(&info.addr, info.source.as_ref());
                let pos = self.bucket_position(&info.addr, bucket, true);
                let slot = bucket * BUCKET_SIZE + pos;
                if self.new_table[slot].is_some() {
                    return;
                }
                self.new_table[slot] = Some(idx);
                self.new_count += 1;
            }
            Placement::Tried => {
                let bucket = self.tried_bucket(&info.addr);
                let pos = self.bucket_position(&info.addr, bucket, false);
                let slot = bucket * BUCKET_SIZE + pos;
                if self.tried_table[slot].is_some() {
                    return;
                }
                self.tried_table[slot] = Some(idx);
                self.tried_count += 1;
            }
        }
        self.index.insert(key, idx);
        self.entries.insert(idx, info);
    }

    // ---- internals ------------------------------------------------------

    fn sip(&self, lower_half: bool) -> SipHasher24 {
        let range = if lower_half { &self.key[..16] } else { &self.key[16..] };
        let k0 = u64::from_le_bytes(range[..8].try_into().expect("key half"));
        let k1 = u64::from_le_bytes(range[8..].try_into().expect("key half"));
        SipHasher24::new_with_keys(k0, k1)
    }

    /// New-table bucket: keyed hash of our netgroup view of the address
    /// and of its source, plus the advertised services.
    fn new_bucket(&self, addr: &NetAddress, source: Option<&[u8; 16]>) -> usize {
        let mut hasher = self.sip(true);
        hasher.write(&netgroup(&addr.ip));
        hasher.write(&addr.services.to_le_bytes());
        if let Some(source_ip) = source {
            hasher.write(&netgroup(source_ip));
        }
        (hasher.finish() as usize) % NEW_BUCKET_COUNT
    }

    fn tried_bucket(&self, addr: &NetAddress) -> usize {
        let mut hasher = self.sip(true);
        hasher.write(&addr.key().0);
        hasher.write(&addr.services.to_le_bytes());
        hasher.write(&netgroup(&addr.ip));
        (hasher.finish() as usize) % TRIED_BUCKET_COUNT
    }

    fn bucket_position(&self, addr: &NetAddress, bucket: usize, is_new: bool) -> usize {
        let mut hasher = self.sip(false);
        hasher.write(&addr.key().0);
        hasher.write(&bucket.to_le_bytes());
        hasher.write(&[u8::from(is_new)]);
        (hasher.finish() as usize) % BUCKET_SIZE
    }

    fn remove_from_new(&mut self, idx: usize) {
        for slot in self.new_table.iter_mut() {
            if *slot == Some(idx) {
                *slot = None;
                self.new_count = self.new_count.saturating_sub(1);
                return;
            }
        }
    }

    fn reinsert_into_new(&mut self, idx: usize) {
        let Some(info) = self.entries.get(&idx) else {
            return;
        };
        let bucket = self.new_bucket(&info.addr, info.source.as_ref());
        let pos = self.bucket_position(&info.addr, bucket, true);
        let slot = bucket * BUCKET_SIZE + pos;
        if self.new_table[slot].is_none() {
            self.new_table[slot] = Some(idx);
            self.new_count += 1;
            if let Some(info) = self.entries.get_mut(&idx) {
                info.placement = Placement::New;
            }
        } else {
            // Slot occupied: the demoted entry is dropped entirely.
            if let Some(info) = self.entries.remove(&idx) {
                self.index.remove(&info.addr.key());
            }
        }
    }
}

fn netgroup(ip: &[u8; 16]) -> [u8; 4] {
    // /16 for IPv4-mapped addresses, top 32 bits otherwise.
    if ip[..10] == [0u8; 10] && ip[10] == 0xff && ip[11] == 0xff {
        [ip[12], ip[13], 0, 0]
    } else {
        [ip[0], ip[1], ip[2], ip[3]]
    }
}
