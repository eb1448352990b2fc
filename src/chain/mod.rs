//! Chain-state boundary
//!
//! The networking core never owns chain state. It consults a [`ChainStore`]
//! for header acceptance, best-chain activation, and locator construction,
//! and subscribes to block-connected notifications for relay. The reference
//! [`MemoryChainStore`] lives in this module for the binary and the test
//! suite; a production node substitutes its own storage behind the same
//! trait.

pub mod header;
pub mod memory;

pub use header::{BlockHeader, HEADER_SIZE, MINER_ADDRESS_SIZE};
pub use memory::{mine_header, GenesisParams, MemoryChainStore, REGTEST_BITS};

use crate::types::Hash;
use thiserror::Error;

/// Validity status of an indexed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Valid,
    Invalid,
}

/// A node in the header index, as seen by the networking core. The core
/// treats these as immutable snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub hash: Hash,
    pub height: u32,
    pub chain_work: u128,
    pub prev: Hash,
    pub status: BlockStatus,
}

/// Exponentially-sparse list of ancestor hashes, used by GETHEADERS to
/// negotiate a common ancestor. Always terminates with the genesis hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locator {
    pub hashes: Vec<Hash>,
}

/// Errors surfaced by a [`ChainStore`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    /// The header's parent is unknown; route the header to the orphan pool.
    #[error("prev-blk-not-found")]
    PrevBlockNotFound,
    /// The pow commitment is broken or the hash does not meet the target.
    #[error("high-hash")]
    InvalidPow,
    /// The header was previously indexed and marked invalid.
    #[error("duplicate-invalid")]
    CachedInvalid,
    /// Structural rejection with a short reason code.
    #[error("invalid header: {0}")]
    Invalid(&'static str),
}

/// Callback invoked for every block connected to the active chain.
pub type BlockConnectedCallback = Box<dyn Fn(&BlockHeader, &IndexEntry) + Send + Sync>;

/// Interface to chain state consumed by the networking core.
pub trait ChainStore: Send + Sync {
    /// Validate and index one header. `min_pow_checked` records that the
    /// caller already ran the cheap commitment pre-filter over the batch.
    /// Returns [`ChainError::PrevBlockNotFound`] when the parent is
    /// unknown; the caller decides whether to orphan the header.
    fn accept_block_header(
        &self,
        header: &BlockHeader,
        peer_id: i32,
        min_pow_checked: bool,
    ) -> Result<IndexEntry, ChainError>;

    /// Re-evaluate the best chain and fire block-connected notifications
    /// for newly activated headers. Called exactly once per HEADERS batch.
    fn activate_best_chain(&self);

    fn chain_height(&self) -> u32;
    fn tip_hash(&self) -> Hash;
    fn tip_time(&self) -> u32;
    fn genesis_hash(&self) -> Hash;

    /// True while the node is catching up to the network tip. Latches to
    /// false once the tip is recent.
    fn is_initial_block_download(&self) -> bool;

    /// Locator starting from the active tip.
    fn locator(&self) -> Locator;

    /// Locator starting from the *parent* of the active tip. Used for sync
    /// requests so a peer at our exact tip still responds with one header.
    fn locator_from_prev(&self) -> Locator;

    /// Minimum cumulative work a headers batch must reach to be processed.
    /// Zero during initial block download.
    fn anti_dos_work_threshold(&self) -> u128;

    /// Cheap batch pre-filter: every header's pow commitment must verify.
    fn verify_headers_pow(&self, headers: &[BlockHeader]) -> bool;

    fn lookup_block_index(&self, hash: &Hash) -> Option<IndexEntry>;

    /// Serve a GETHEADERS request: find the first locator hash on the
    /// active chain (genesis when none match) and return up to `max`
    /// contiguous active-chain headers after it, stopping after
    /// `hash_stop` when it is non-zero.
    fn headers_after_locator(&self, locator: &[Hash], hash_stop: &Hash, max: usize)
        -> Vec<BlockHeader>;

    /// Register a block-connected subscriber. Fires for every connected
    /// block; subscribers apply their own IBD/age filtering.
    fn subscribe_block_connected(&self, callback: BlockConnectedCallback);
}

/// Decode a compact difficulty encoding into `(mantissa, exponent)`.
pub fn decode_compact(bits: u32) -> (u32, u8) {
    ((bits & 0x007f_ffff), (bits >> 24) as u8)
}

/// Expand compact bits into a 32-byte big-endian target.
pub fn compact_to_target(bits: u32) -> [u8; 32] {
    let (mantissa, exponent) = decode_compact(bits);
    let mut target = [0u8; 32];
    let mantissa_bytes = mantissa.to_be_bytes();
    // The mantissa occupies the top three bytes of a number that is
    // `exponent` bytes wide.
    for i in 0..3usize {
        let Some(pos) = (exponent as usize).checked_sub(i + 1) else {
            continue;
        };
        if pos < 32 {
            target[31 - pos] = mantissa_bytes[i + 1];
        }
    }
    target
}

/// True when `hash`, interpreted as a big-endian 256-bit integer, is at or
/// below the target encoded by `bits`.
pub fn hash_meets_target(hash: &Hash, bits: u32) -> bool {
    let target = compact_to_target(bits);
    for i in 0..32 {
        match hash[i].cmp(&target[i]) {
            std::cmp::Ordering::Less => return true,
            std::cmp::Ordering::Greater => return false,
            std::cmp::Ordering::Equal => {}
        }
    }
    true
}

/// Per-header proof contribution, as a saturating `u128`.
///
/// proof = 2^256 / (target + 1) ≈ 2^(280 - 8·exponent) / (mantissa + 1),
/// which is monotone in difficulty and avoids 256-bit arithmetic.
pub fn block_proof(bits: u32) -> u128 {
    let (mantissa, exponent) = decode_compact(bits);
    if mantissa == 0 {
        return 0;
    }
    let divisor = mantissa as u128 + 1;
    let shift = 280usize.saturating_sub(8 * exponent as usize);
    if shift >= 128 {
        u128::MAX / divisor
    } else {
        ((1u128 << shift) / divisor).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn easy_target_accepts_most_hashes() {
        // Exponent 0x20, mantissa 0x7fffff: target has its top byte at 0x7f.
        let bits = 0x207f_ffff;
        assert!(hash_meets_target(&[0u8; 32], bits));
        let mut low = [0u8; 32];
        low[0] = 0x7f;
        assert!(hash_meets_target(&low, bits));
        let mut high = [0u8; 32];
        high[0] = 0x80;
        assert!(!hash_meets_target(&high, bits));
    }

    #[test]
    fn harder_bits_mean_more_proof() {
        // Smaller exponent => smaller target => more work per block.
        assert!(block_proof(0x1f7f_ffff) > block_proof(0x207f_ffff));
        assert!(block_proof(0x1d00_ffff) > block_proof(0x1f7f_ffff));
    }

    #[test]
    fn proof_is_positive_for_valid_bits() {
        assert!(block_proof(0x207f_ffff) >= 1);
    }
}
