//! Shared harness for the integration suites: in-memory two-node networks
//! plus a chain-store decorator that counts interface calls.

use palisade::chain::{
    BlockConnectedCallback, BlockHeader, ChainError, ChainStore, IndexEntry, Locator,
    MemoryChainStore,
};
use palisade::net::{loopback, Coordinator, MemoryNetwork, NetConfig};
use palisade::Hash;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const TEST_MAGIC: u32 = 0x50_41_4C_49;

/// Chain-store decorator counting accepts and activations.
pub struct CountingChain {
    inner: Arc<MemoryChainStore>,
    pub accepts: AtomicUsize,
    pub activations: AtomicUsize,
}

impl CountingChain {
    pub fn new(inner: Arc<MemoryChainStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            accepts: AtomicUsize::new(0),
            activations: AtomicUsize::new(0),
        })
    }

    pub fn accept_count(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    pub fn activation_count(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }
}

impl ChainStore for CountingChain {
    fn accept_block_header(
        &self,
        header: &BlockHeader,
        peer_id: i32,
        min_pow_checked: bool,
    ) -> Result<IndexEntry, ChainError> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        self.inner.accept_block_header(header, peer_id, min_pow_checked)
    }

    fn activate_best_chain(&self) {
        self.activations.fetch_add(1, Ordering::SeqCst);
        self.inner.activate_best_chain()
    }

    fn chain_height(&self) -> u32 {
        self.inner.chain_height()
    }

    fn tip_hash(&self) -> Hash {
        self.inner.tip_hash()
    }

    fn tip_time(&self) -> u32 {
        self.inner.tip_time()
    }

    fn genesis_hash(&self) -> Hash {
        self.inner.genesis_hash()
    }

    fn is_initial_block_download(&self) -> bool {
        self.inner.is_initial_block_download()
    }

    fn locator(&self) -> Locator {
        self.inner.locator()
    }

    fn locator_from_prev(&self) -> Locator {
        self.inner.locator_from_prev()
    }

    fn anti_dos_work_threshold(&self) -> u128 {
        self.inner.anti_dos_work_threshold()
    }

    fn verify_headers_pow(&self, headers: &[BlockHeader]) -> bool {
        self.inner.verify_headers_pow(headers)
    }

    fn lookup_block_index(&self, hash: &Hash) -> Option<IndexEntry> {
        self.inner.lookup_block_index(hash)
    }

    fn headers_after_locator(
        &self,
        locator: &[Hash],
        hash_stop: &Hash,
        max: usize,
    ) -> Vec<BlockHeader> {
        self.inner.headers_after_locator(locator, hash_stop, max)
    }

    fn subscribe_block_connected(&self, callback: BlockConnectedCallback) {
        self.inner.subscribe_block_connected(callback)
    }
}

pub struct TestNode {
    pub coordinator: Arc<Coordinator>,
    pub chain: Arc<MemoryChainStore>,
    pub counting: Arc<CountingChain>,
    pub addr: SocketAddr,
    _datadir: Option<TempDir>,
}

/// Spin up a node listening on `port` inside `net`.
pub async fn spawn_node(net: &MemoryNetwork, port: u16) -> TestNode {
    spawn_node_with_chain(net, port, Arc::new(MemoryChainStore::new())).await
}

pub async fn spawn_node_with_chain(
    net: &MemoryNetwork,
    port: u16,
    chain: Arc<MemoryChainStore>,
) -> TestNode {
    let datadir = TempDir::new().expect("tempdir");
    let path = datadir.path().to_path_buf();
    let mut node = spawn_node_in_dir(net, port, chain, path).await;
    node._datadir = Some(datadir);
    node
}

/// Spawn with an explicit datadir, for restart-persistence tests.
pub async fn spawn_node_in_dir(
    net: &MemoryNetwork,
    port: u16,
    chain: Arc<MemoryChainStore>,
    datadir: std::path::PathBuf,
) -> TestNode {
    let addr = loopback(port);
    let transport = Arc::new(net.listen(addr));
    let counting = CountingChain::new(chain.clone());

    let mut config = NetConfig::new(TEST_MAGIC, port, datadir);
    config.allow_unroutable = true;

    let coordinator = Coordinator::new(config, counting.clone(), transport);
    coordinator.start().await.expect("coordinator starts");

    TestNode {
        coordinator,
        chain,
        counting,
        addr,
        _datadir: None,
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}
