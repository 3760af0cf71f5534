//! Physical connections for the duplex channel.
//!
//! - **TcpConnector**: plain TCP to a volume server
//! - **MemoryConnector**: in-process `tokio::io::duplex` pairs, for embedding
//!   a server in the same process and for tests

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Byte stream usable as the channel's physical connection.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens physical connections. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> io::Result<BoxedStream>;
}

pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        tracing::debug!(addr = %self.addr, "Opening TCP connection");
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Client half of an in-memory transport.
///
/// Every `connect` creates a duplex pair and hands the server end to the
/// matching [`MemoryListener`]. Fails with `ConnectionRefused` once the
/// listener is gone.
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<DuplexStream>,
    max_buf_size: usize,
    attempts: AtomicUsize,
}

/// Server half of an in-memory transport.
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MemoryConnector {
    pub fn pair(max_buf_size: usize) -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers: tx,
            max_buf_size,
            attempts: AtomicUsize::new(0),
        };
        (connector, MemoryListener { peers: rx })
    }

    /// Number of `connect` calls made so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        let (client, server) = tokio::io::duplex(self.max_buf_size);
        self.peers.send(server).map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "memory listener closed")
        })?;
        Ok(Box::new(client))
    }
}

impl MemoryListener {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.peers.recv().await
    }

    /// Take an already-established connection without waiting.
    pub fn try_accept(&mut self) -> Option<DuplexStream> {
        self.peers.try_recv().ok()
    }
}
