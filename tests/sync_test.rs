//! Header-sync integration tests over the in-memory network.
//!
//! Run with: cargo test --test sync_test -- --nocapture

mod common;

use common::{spawn_node, spawn_node_with_chain, wait_for};
use palisade::chain::memory::{mine_chain, mine_header, MemoryChainStore};
use palisade::chain::{ChainStore, REGTEST_BITS};
use palisade::net::{ConnectionResult, MemoryNetwork};
use palisade::now;
use std::sync::Arc;
use std::time::Duration;

/// Node A has 2500 mined headers; node B starts empty, connects, and must
/// reach A's exact tip. The first batch is full (2000), the second partial
/// (500), and each batch activates exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_sync_to_2500() {
    let net = MemoryNetwork::new();
    let node_a = spawn_node(&net, 8444).await;
    let node_b = spawn_node(&net, 8445).await;

    let start = (now() - 25_000) as u32;
    mine_chain(&node_a.chain, 2500, start);
    assert_eq!(node_a.chain.chain_height(), 2500);
    assert!(node_b.counting.is_initial_block_download());

    let result = node_b.coordinator.add_node(node_a.addr).await;
    assert_eq!(result, ConnectionResult::Success);

    assert!(
        wait_for(
            || node_b.chain.chain_height() == 2500,
            Duration::from_secs(30)
        )
        .await,
        "node B should reach height 2500, got {}",
        node_b.chain.chain_height()
    );
    assert_eq!(node_b.chain.tip_hash(), node_a.chain.tip_hash());

    // 2000 + 500, one activation per batch.
    assert_eq!(node_b.counting.activation_count(), 2);
    assert_eq!(node_b.counting.accept_count(), 2500);

    node_b.coordinator.stop().unwrap();
    node_a.coordinator.stop().unwrap();
}

/// Node B restarts mid-sync with its chainstate already at height 1200.
/// After reconnecting it reaches 2500 without re-downloading the headers
/// it already has (beyond locator overlap).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ibd_resume_skips_downloaded_headers() {
    let net = MemoryNetwork::new();
    let node_a = spawn_node(&net, 8444).await;

    let start = (now() - 25_000) as u32;
    let headers = mine_chain(&node_a.chain, 2500, start);

    // Reload: B's chain store already holds the first 1200 headers.
    let chain_b = Arc::new(MemoryChainStore::new());
    for header in &headers[..1200] {
        chain_b.accept_block_header(header, -1, true).unwrap();
    }
    chain_b.activate_best_chain();
    assert_eq!(chain_b.chain_height(), 1200);

    let node_b = spawn_node_with_chain(&net, 8445, chain_b).await;
    let result = node_b.coordinator.add_node(node_a.addr).await;
    assert_eq!(result, ConnectionResult::Success);

    assert!(
        wait_for(
            || node_b.chain.chain_height() == 2500,
            Duration::from_secs(30)
        )
        .await,
        "resumed node should reach 2500, got {}",
        node_b.chain.chain_height()
    );
    assert_eq!(node_b.chain.tip_hash(), node_a.chain.tip_hash());

    // 1300 missing headers plus bounded locator overlap; far below a
    // fresh 2500-header download.
    assert!(
        node_b.counting.accept_count() < 1400,
        "accepted {} headers, expected ~1301",
        node_b.counting.accept_count()
    );

    node_b.coordinator.stop().unwrap();
    node_a.coordinator.stop().unwrap();
}

/// Node A reorgs to a heavier fork and announces its new tip; node B
/// follows the reorg through INV → GETHEADERS → HEADERS.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fork_reorg_propagates_via_inv() {
    let net = MemoryNetwork::new();
    let node_a = spawn_node(&net, 8444).await;
    let node_b = spawn_node(&net, 8445).await;

    // Chain X: 10 recent blocks. Both nodes converge on it.
    let start = (now() - 1000) as u32;
    mine_chain(&node_a.chain, 10, start);
    node_b.coordinator.add_node(node_a.addr).await;
    assert!(
        wait_for(|| node_b.chain.chain_height() == 10, Duration::from_secs(15)).await,
        "node B should sync chain X"
    );
    let x_tip = node_b.chain.tip_hash();

    // Chain Y: 15 blocks from genesis; A switches and announces.
    let genesis = node_a.chain.genesis_hash();
    let mut prev = genesis;
    for i in 0..15u32 {
        let header = mine_header(prev, [0xCC; 20], start + 100 + i, REGTEST_BITS);
        prev = header.hash();
        node_a.chain.accept_block_header(&header, -1, true).unwrap();
    }
    node_a.chain.activate_best_chain();
    assert_eq!(node_a.chain.chain_height(), 15);

    assert!(
        wait_for(
            || node_b.chain.chain_height() == 15 && node_b.chain.tip_hash() == prev,
            Duration::from_secs(15)
        )
        .await,
        "node B should reorg to chain Y, at height {}",
        node_b.chain.chain_height()
    );
    assert_ne!(node_b.chain.tip_hash(), x_tip);

    node_b.coordinator.stop().unwrap();
    node_a.coordinator.stop().unwrap();
}

/// Two fresh nodes handshake; each sees the other as successfully
/// connected, and exactly one sync peer exists on the syncing side.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_latches_both_sides() {
    let net = MemoryNetwork::new();
    let node_a = spawn_node(&net, 8444).await;
    let node_b = spawn_node(&net, 8445).await;

    assert_eq!(
        node_b.coordinator.add_node(node_a.addr).await,
        ConnectionResult::Success
    );

    assert!(
        wait_for(
            || {
                let a_ready = node_a
                    .coordinator
                    .peer_info()
                    .iter()
                    .any(|p| p.successfully_connected);
                let b_ready = node_b
                    .coordinator
                    .peer_info()
                    .iter()
                    .any(|p| p.successfully_connected);
                a_ready && b_ready
            },
            Duration::from_secs(10)
        )
        .await,
        "both sides should latch the handshake"
    );

    // Ready implies successfully_connected on every peer snapshot.
    for info in node_a
        .coordinator
        .peer_info()
        .into_iter()
        .chain(node_b.coordinator.peer_info())
    {
        if info.state == palisade::net::PeerState::Ready {
            assert!(info.successfully_connected);
        }
    }

    // B dialed A, so only B designates a sync peer for this link.
    let sync_flags: Vec<bool> = node_b
        .coordinator
        .peer_info()
        .iter()
        .map(|p| p.sync_started)
        .collect();
    assert_eq!(sync_flags.iter().filter(|f| **f).count(), 1);

    node_b.coordinator.stop().unwrap();
    node_a.coordinator.stop().unwrap();
}

/// A dialing node that connects to itself drops the connection.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn self_connection_detected_and_dropped() {
    let net = MemoryNetwork::new();
    let node = spawn_node(&net, 8444).await;

    let result = node.coordinator.add_node(node.addr).await;
    assert_eq!(result, ConnectionResult::Success);

    // Both ends of the self-dial end up removed once VERSION echoes the
    // local nonce back.
    assert!(
        wait_for(
            || {
                node.coordinator
                    .peer_info()
                    .iter()
                    .all(|p| !p.successfully_connected)
            },
            Duration::from_secs(10)
        )
        .await,
        "self-connection must never complete a handshake"
    );

    node.coordinator.stop().unwrap();
}
