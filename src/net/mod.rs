//! P2P networking layer

pub mod addrman;
pub mod anchors;
pub mod connman;
pub mod coordinator;
pub mod dispatcher;
pub mod handlers;
pub mod message;
pub mod orphans;
pub mod peer;
pub mod relay;
pub mod sync;
pub mod timedata;
pub mod transport;
pub mod types;
pub mod wire;

// Re-exports
pub use addrman::{AddrBook, AddressInfo, Placement};
pub use anchors::{load_and_delete_anchors, save_anchors, MAX_ANCHORS};
pub use connman::{BanEntry, BanList, ConnLimits, ConnectionError, ConnectionManager};
pub use coordinator::{ConnectionResult, Coordinator, NetConfig, NodeState};
pub use dispatcher::{DispatchOutcome, Dispatcher, NetError, PeerGate};
pub use message::{GetHeadersPayload, InvItem, InvType, Message, VersionPayload};
pub use orphans::{AdmitResult, OrphanPool};
pub use peer::{Peer, PeerInfo, SendError, SendQueue};
pub use relay::RelayManager;
pub use sync::SyncManager;
pub use timedata::TimeData;
pub use transport::{Connection, MemoryNetwork, MemoryTransport, TcpTransport, Transport};
pub use types::*;
pub use wire::{Codec, FrameEvent, WireError};
