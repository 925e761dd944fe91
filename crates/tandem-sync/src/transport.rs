//! Byte-stream transports sessions run over.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;

use tandem_core::{TandemError, TandemResult};

const MEMORY_PIPE_BYTES: usize = 256 * 1024;

/// Something that can open a stream to a peer address.
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, addr: &str) -> impl Future<Output = TandemResult<Self::Stream>> + Send;
}

/// Something that yields inbound streams.
pub trait Listener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// The next inbound stream and a label for its remote end.
    fn accept(&mut self) -> impl Future<Output = TandemResult<(Self::Stream, String)>> + Send;
}

// ── TCP ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        TcpTransport { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;

    async fn connect(&self, addr: &str) -> TandemResult<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TandemError::Timeout("connect"))?
            .map_err(|e| TandemError::Transport(format!("connecting to {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        debug!(addr, "connected");
        Ok(stream)
    }
}

impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> TandemResult<(TcpStream, String)> {
        let (stream, remote) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok((stream, remote.to_string()))
    }
}

// ── In-process ────────────────────────────────────────────────────────────

/// In-process transport over `tokio::io::duplex` pipes, addressed by name.
/// Used by simulations and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>>,
}

#[derive(Debug)]
pub struct MemoryListener {
    name: String,
    inbound: mpsc::Receiver<DuplexStream>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections addressed to `name`. A second listener
    /// under the same name replaces the first.
    pub fn listen(&self, name: &str) -> MemoryListener {
        let (tx, inbound) = mpsc::channel(16);
        self.listeners.lock().insert(name.to_string(), tx);
        MemoryListener {
            name: name.to_string(),
            inbound,
        }
    }

    /// Stop routing connections to `name`; later connects fail.
    pub fn unlisten(&self, name: &str) {
        self.listeners.lock().remove(name);
    }
}

impl Transport for MemoryTransport {
    type Stream = DuplexStream;

    async fn connect(&self, addr: &str) -> TandemResult<DuplexStream> {
        let listener = self
            .listeners
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| TandemError::Transport(format!("nothing listening on {addr}")))?;
        let (local, remote) = tokio::io::duplex(MEMORY_PIPE_BYTES);
        listener
            .send(remote)
            .await
            .map_err(|_| TandemError::Transport(format!("listener {addr} is gone")))?;
        Ok(local)
    }
}

impl Listener for MemoryListener {
    type Stream = DuplexStream;

    async fn accept(&mut self) -> TandemResult<(DuplexStream, String)> {
        let stream = self
            .inbound
            .recv()
            .await
            .ok_or_else(|| TandemError::Transport(format!("listener {} closed", self.name)))?;
        Ok((stream, format!("memory:{}", self.name)))
    }
}
