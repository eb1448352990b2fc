//! Transport abstraction
//!
//! The connection manager talks to peers through an asynchronous
//! byte-stream [`Transport`]; the production implementation is TCP and the
//! test suite swaps in an in-memory network of duplex pipes. Each
//! [`Connection`] carries its own stream, so per-connection writes are
//! serialized by whichever task owns it, and outgoing buffers live inside
//! that task until the write future completes.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Dial timeout for outbound TCP connects.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of one in-memory pipe direction, matching a small socket buffer.
const MEMORY_PIPE_CAPACITY: usize = 256 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

static NEXT_EPHEMERAL_PORT: AtomicU64 = AtomicU64::new(49152);

fn next_ephemeral_port() -> u16 {
    // Cycle through the dynamic port range.
    let offset = NEXT_EPHEMERAL_PORT.fetch_add(1, Ordering::Relaxed) % 16384;
    (49152 + offset) as u16
}

/// Combined async byte-stream object.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// One established connection: a byte stream plus its remote endpoint.
pub struct Connection {
    pub id: u64,
    pub remote: SocketAddr,
    pub stream: Box<dyn AsyncStream>,
}

impl Connection {
    pub fn new(remote: SocketAddr, stream: Box<dyn AsyncStream>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            stream,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Dial-and-listen interface over some byte-stream network.
pub trait Transport: Send + Sync + 'static {
    /// Dial `addr`. Resolves once the connection is established or failed.
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<Connection>>;

    /// Wait for the next inbound connection. Errors are transient; the
    /// accept loop may retry.
    fn accept(&self) -> BoxFuture<'_, io::Result<Connection>>;

    /// The address we are listening on, if any.
    fn local_addr(&self) -> Option<SocketAddr>;
}

// =============================================================================
// TCP
// =============================================================================

/// Real TCP transport.
pub struct TcpTransport {
    listener: Option<TcpListener>,
}

impl TcpTransport {
    /// Bind a listener on `addr`.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener: Some(listener),
        })
    }

    /// Outbound-only transport (no listener).
    pub fn dial_only() -> Self {
        Self { listener: None }
    }
}

impl Transport for TcpTransport {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<Connection>> {
        async move {
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
            stream.set_nodelay(true)?;
            Ok(Connection::new(addr, Box::new(stream)))
        }
        .boxed()
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<Connection>> {
        async move {
            let Some(listener) = &self.listener else {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "transport has no listener",
                ));
            };
            let (stream, remote) = listener.accept().await?;
            stream.set_nodelay(true)?;
            Ok(Connection::new(remote, Box::new(stream)))
        }
        .boxed()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

type IncomingSender = mpsc::UnboundedSender<Connection>;

/// A simulated network: a registry of listening endpoints connected by
/// duplex pipes. Clone-cheap; all transports created from one network can
/// reach each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<SocketAddr, IncomingSender>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport listening on `addr` within this network.
    pub fn listen(&self, addr: SocketAddr) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints
            .lock()
            .expect("memory network lock poisoned")
            .insert(addr, tx);
        MemoryTransport {
            network: self.clone(),
            local: addr,
            incoming: tokio::sync::Mutex::new(rx),
        }
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>,
}

impl Transport for MemoryTransport {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<Connection>> {
        let network = self.network.clone();
        let local = self.local;
        async move {
            let target = {
                let endpoints = network
                    .endpoints
                    .lock()
                    .expect("memory network lock poisoned");
                endpoints.get(&addr).cloned()
            };
            let Some(target) = target else {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "no listener at address",
                ));
            };

            // Like TCP, the accepting side sees the dialer's IP with an
            // ephemeral source port, not its listening port.
            let source = SocketAddr::new(local.ip(), next_ephemeral_port());
            let (near, far) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
            target
                .send(Connection::new(source, Box::new(far)))
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::ConnectionRefused, "listener shut down")
                })?;
            Ok(Connection::new(addr, Box::new(near)))
        }
        .boxed()
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<Connection>> {
        async move {
            self.incoming
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "network torn down"))
        }
        .boxed()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}
