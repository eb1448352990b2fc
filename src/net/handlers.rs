//! Registered message handlers
//!
//! Each protocol command gets one handler, installed into the dispatcher
//! registry at startup. Handlers return `Ok(false)` (or an error) to ask
//! the connection task to disconnect the peer; penalties and removals they
//! perform directly go through the connection manager.

use super::coordinator::NodeState;
use super::dispatcher::{Dispatcher, NetError};
use super::message::{Message, VersionPayload};
use super::peer::peer_net_address;
use super::types::{penalty, Direction, NetAddress, PeerState, TimestampedAddress, MAX_ADDR_SIZE};
use crate::types::now;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

/// Install every protocol handler.
pub fn register_all(dispatcher: &mut Dispatcher<NodeState>) {
    dispatcher.register("version", handle_version);
    dispatcher.register("verack", handle_verack);
    dispatcher.register("ping", handle_ping);
    dispatcher.register("pong", handle_pong);
    dispatcher.register("addr", handle_addr);
    dispatcher.register("getaddr", handle_getaddr);
    dispatcher.register("inv", handle_inv);
    dispatcher.register("getheaders", handle_getheaders);
    dispatcher.register("headers", handle_headers);
}

fn handle_version(
    state: &NodeState,
    peer_id: i32,
    msg: Message,
) -> BoxFuture<'_, Result<bool, NetError>> {
    async move {
        let Message::Version(payload) = msg else {
            return Ok(true);
        };
        let Some(entry) = state.connman.get_peer(peer_id) else {
            return Ok(false);
        };

        {
            let peer = entry.lock().expect("peer lock poisoned");
            // Exactly one VERSION per connection; repeats are ignored
            // without overwriting the negotiated values.
            if peer.version_received {
                debug!("peer {peer_id} sent a second version; ignoring");
                return Ok(true);
            }
        }

        // Self-connection: the nonce is one of our own outstanding
        // outbound nonces, so we dialed ourselves.
        if state
            .connman
            .outbound_nonces()
            .contains(&payload.nonce)
        {
            debug!("peer {peer_id} is a self-connection; dropping");
            state.connman.remove_peer(peer_id);
            return Ok(false);
        }

        let (direction, remote_ip) = {
            let peer = entry.lock().expect("peer lock poisoned");
            (peer.direction, peer.addr.ip())
        };

        // Bidirectional duplicate: we have an outstanding outbound to this
        // same IP that has not completed its handshake. Keep the outbound,
        // drop this inbound.
        if direction == Direction::Inbound {
            let duplicate = state.connman.peer_infos().into_iter().any(|info| {
                info.id != peer_id
                    && info.direction.is_outbound()
                    && !info.successfully_connected
                    && info.addr.ip() == remote_ip
            });
            if duplicate {
                debug!("peer {peer_id} duplicates a pending outbound; dropping inbound");
                state.connman.remove_peer(peer_id);
                return Ok(false);
            }
        }

        let clock_offset = payload.timestamp - now() as i64;

        {
            let mut peer = entry.lock().expect("peer lock poisoned");
            peer.apply_version(&payload);

            match direction {
                Direction::Inbound => {
                    // Inbound: answer with our VERSION, then VERACK.
                    let our_version = build_version(state, &peer.addr, peer.local_nonce);
                    if peer.send(Message::Version(our_version)).is_err()
                        || peer.send(Message::Verack).is_err()
                    {
                        return Ok(false);
                    }
                    peer.state = PeerState::VersionSent;
                }
                _ => {
                    // Outbound: our VERSION went out at connect time.
                    if peer.send(Message::Verack).is_err() {
                        return Ok(false);
                    }
                }
            }
        }

        if direction.is_outbound() {
            state.timedata.add_sample(clock_offset);
        }
        Ok(true)
    }
    .boxed()
}

fn handle_verack(
    state: &NodeState,
    peer_id: i32,
    _msg: Message,
) -> BoxFuture<'_, Result<bool, NetError>> {
    async move {
        let Some(entry) = state.connman.get_peer(peer_id) else {
            return Ok(false);
        };

        let (direction, addr_key) = {
            let mut peer = entry.lock().expect("peer lock poisoned");
            if peer.successfully_connected {
                // A repeated VERACK after the latch is ignored.
                return Ok(true);
            }
            if !peer.version_received {
                return Err(NetError::ProtocolViolation("verack before version"));
            }
            peer.latch_ready();
            (peer.direction, peer_net_address(&peer).key())
        };
        debug!("peer {peer_id} handshake complete");

        if direction.is_outbound() {
            // Post-handshake actions for peers we chose ourselves: the
            // address verified, so promote it; ask for more addresses
            // once; offer our tip.
            state
                .addrbook
                .lock()
                .expect("addrbook lock poisoned")
                .mark_good(&addr_key);

            if direction == Direction::Feeler {
                // Feelers exist only to verify the address.
                state.connman.remove_peer(peer_id);
                return Ok(true);
            }

            let tip = state.chain.tip_hash();
            {
                let mut peer = entry.lock().expect("peer lock poisoned");
                if !peer.sent_getaddr {
                    peer.sent_getaddr = true;
                    let _ = peer.send(Message::GetAddr);
                }
                peer.queue_block_announcement(tip);
            }

            state.sync.maybe_start_sync(&state.connman, &*state.chain);
        }
        Ok(true)
    }
    .boxed()
}

fn handle_ping(
    state: &NodeState,
    peer_id: i32,
    msg: Message,
) -> BoxFuture<'_, Result<bool, NetError>> {
    async move {
        let Message::Ping(nonce) = msg else {
            return Ok(true);
        };
        if let Some(entry) = state.connman.get_peer(peer_id) {
            let _ = entry
                .lock()
                .expect("peer lock poisoned")
                .send(Message::Pong(nonce));
        }
        Ok(true)
    }
    .boxed()
}

fn handle_pong(
    state: &NodeState,
    peer_id: i32,
    msg: Message,
) -> BoxFuture<'_, Result<bool, NetError>> {
    async move {
        let Message::Pong(nonce) = msg else {
            return Ok(true);
        };
        if let Some(entry) = state.connman.get_peer(peer_id) {
            let mut peer = entry.lock().expect("peer lock poisoned");
            if !peer.complete_ping(nonce) {
                debug!("peer {peer_id} sent unsolicited pong");
            }
        }
        Ok(true)
    }
    .boxed()
}

fn handle_addr(
    state: &NodeState,
    peer_id: i32,
    msg: Message,
) -> BoxFuture<'_, Result<bool, NetError>> {
    async move {
        let Message::Addr(entries) = msg else {
            return Ok(true);
        };
        if entries.len() > MAX_ADDR_SIZE {
            return Ok(!state
                .connman
                .penalize(peer_id, penalty::OVERSIZED_MESSAGE, "oversized addr"));
        }

        let source = state
            .connman
            .get_peer(peer_id)
            .map(|entry| super::types::ip_key(entry.lock().expect("peer lock poisoned").addr.ip()));

        let batch: Vec<(NetAddress, u32)> = entries
            .iter()
            .map(|e| (e.address, e.timestamp))
            .collect();
        let added = state
            .addrbook
            .lock()
            .expect("addrbook lock poisoned")
            .add_multiple(&batch, source);
        debug!("peer {peer_id} sent {} addresses, stored {added}", entries.len());
        Ok(true)
    }
    .boxed()
}

fn handle_getaddr(
    state: &NodeState,
    peer_id: i32,
    _msg: Message,
) -> BoxFuture<'_, Result<bool, NetError>> {
    async move {
        let addresses = state
            .addrbook
            .lock()
            .expect("addrbook lock poisoned")
            .get_addresses(MAX_ADDR_SIZE);
        let entries: Vec<TimestampedAddress> = addresses
            .into_iter()
            .map(|(address, timestamp)| TimestampedAddress { timestamp, address })
            .collect();
        if let Some(entry) = state.connman.get_peer(peer_id) {
            let _ = entry
                .lock()
                .expect("peer lock poisoned")
                .send(Message::Addr(entries));
        }
        Ok(true)
    }
    .boxed()
}

fn handle_inv(
    state: &NodeState,
    peer_id: i32,
    msg: Message,
) -> BoxFuture<'_, Result<bool, NetError>> {
    async move {
        let Message::Inv(items) = msg else {
            return Ok(true);
        };
        Ok(state
            .relay
            .handle_inv(&state.connman, &*state.chain, &state.sync, peer_id, &items))
    }
    .boxed()
}

fn handle_getheaders(
    state: &NodeState,
    peer_id: i32,
    msg: Message,
) -> BoxFuture<'_, Result<bool, NetError>> {
    async move {
        let Message::GetHeaders(request) = msg else {
            return Ok(true);
        };
        state
            .sync
            .serve_getheaders(&state.connman, &*state.chain, peer_id, &request);
        Ok(true)
    }
    .boxed()
}

fn handle_headers(
    state: &NodeState,
    peer_id: i32,
    msg: Message,
) -> BoxFuture<'_, Result<bool, NetError>> {
    async move {
        let Message::Headers(headers) = msg else {
            return Ok(true);
        };
        Ok(state.sync.handle_headers(
            &state.connman,
            &*state.chain,
            &state.orphans,
            &state.relay,
            peer_id,
            headers,
        ))
    }
    .boxed()
}

/// Our VERSION payload toward `remote`.
pub fn build_version(
    state: &NodeState,
    remote: &std::net::SocketAddr,
    nonce: u64,
) -> VersionPayload {
    VersionPayload::new(
        state.config.services,
        NetAddress::from_socket_addr(*remote, 0),
        state.local_address,
        nonce,
        state.chain.chain_height() as i32,
    )
}
