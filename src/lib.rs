pub mod chain;
pub mod net;
pub mod types;

pub use chain::{BlockHeader, ChainError, ChainStore, IndexEntry, Locator, MemoryChainStore};
pub use net::{ConnectionResult, Coordinator, NetConfig};
pub use types::{double_sha3, now, Hash, ZERO_HASH};
