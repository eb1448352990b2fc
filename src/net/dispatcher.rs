//! Message dispatch
//!
//! A registry from command string to handler, filled in by the managers at
//! startup. The dispatcher also owns the two order rules every connection
//! obeys: nothing but VERSION before VERSION, and nothing but handshake
//! and liveness traffic before VERACK.

use super::message::Message;
use futures::future::BoxFuture;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors surfaced from message handlers.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("capacity exceeded: {0}")]
    Capacity(&'static str),
    #[error("policy refusal: {0}")]
    Policy(&'static str),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

/// Handler signature: state, peer id, message → keep-connection flag.
pub type Handler<S> = for<'a> fn(&'a S, i32, Message) -> BoxFuture<'a, Result<bool, NetError>>;

/// What `dispatch` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler ran and kept the connection.
    Handled,
    /// Unknown command, or data message gated pre-VERACK. No penalty.
    Ignored,
    /// A non-VERSION message arrived before VERSION; disconnect.
    ProtocolViolation,
    /// Handler asked for a disconnect or failed; disconnect.
    HandlerFailed,
}

/// Handshake facts the dispatcher needs about the sending peer.
#[derive(Debug, Clone, Copy)]
pub struct PeerGate {
    pub version_received: bool,
    pub successfully_connected: bool,
}

pub struct Dispatcher<S> {
    handlers: HashMap<&'static str, Handler<S>>,
}

impl<S> Default for Dispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Dispatcher<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Install a handler for `command`. Later registrations replace
    /// earlier ones.
    pub fn register(&mut self, command: &'static str, handler: Handler<S>) {
        self.handlers.insert(command, handler);
    }

    pub fn is_registered(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Route one message. Handlers run to completion, serially per
    /// connection task; a handler error is caught here and reported as a
    /// failure rather than unwinding into the reactor.
    pub async fn dispatch(
        &self,
        state: &S,
        peer_id: i32,
        gate: PeerGate,
        msg: Message,
    ) -> DispatchOutcome {
        let command = msg.command();

        if !gate.version_received && command != "version" {
            debug!("peer {peer_id} sent {command:?} before version");
            return DispatchOutcome::ProtocolViolation;
        }

        // Defense-in-depth: data messages are dropped, successfully and
        // without penalty, until the handshake latches.
        if !gate.successfully_connected && !Message::allowed_pre_verack(command) {
            debug!("peer {peer_id} gated pre-verack {command:?}");
            return DispatchOutcome::Ignored;
        }

        let Some(handler) = self.handlers.get(command) else {
            return DispatchOutcome::Ignored;
        };

        match handler(state, peer_id, msg).await {
            Ok(true) => DispatchOutcome::Handled,
            Ok(false) => DispatchOutcome::HandlerFailed,
            Err(err) => {
                warn!("handler {command:?} failed for peer {peer_id}: {err}");
                DispatchOutcome::HandlerFailed
            }
        }
    }
}
