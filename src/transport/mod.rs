//! Transport abstraction and implementations.
//!
//! A transport turns a URL into connections that carry whole frames, in
//! order, both ways. The core consumes three narrow traits: an [`Acceptor`]
//! produced by binding, a [`Connector`] produced by parsing a dial URL, and
//! the per-connection [`FrameReader`] / [`FrameWriter`] halves. Everything
//! above this module (pipes, sockets, protocols) is transport-agnostic.
//!
//! Recognized schemes:
//!
//! - `tcp://host:port` (and the family-pinned `tcp4://`, `tcp6://`)
//! - `tls+tcp://host:port` — TLS over TCP, configured via [`TlsConfig`]
//! - `ipc:///path` — Unix domain sockets
//! - `abstract://name` — Linux abstract namespace (name may URI-escape
//!   arbitrary bytes; empty name asks for auto-bind)
//! - `inproc://name` — in-process rendezvous

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::sockaddr::SockAddr;
use crate::tls::TlsConfig;

pub mod inproc;
pub mod ipc;
pub mod tcp;
pub mod tls;

/// Per-attempt transport parameters, assembled from endpoint options.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub tcp_nodelay: bool,
    pub tcp_keepalive: bool,
    /// TLS material for `tls+tcp` endpoints.
    pub tls: Option<TlsConfig>,
}

/// Reads whole frames off a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame. `Ok(None)` reports a frame that exceeded
    /// `max_size` and was discarded; the connection remains usable. Errors
    /// are fatal for the connection.
    async fn recv_frame(&mut self, max_size: usize) -> Result<Option<Vec<u8>>>;
}

/// Writes whole frames onto a connection.
#[async_trait]
pub trait FrameWriter: Send {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Flush and close the write side. Best effort.
    async fn shutdown(&mut self);
}

/// One established, framed, bidirectional connection.
pub struct Connection {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
    pub local_addr: SockAddr,
    pub peer_addr: SockAddr,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// A bound, listening endpoint.
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self, config: &TransportConfig) -> Result<Connection>;

    fn local_addr(&self) -> SockAddr;

    /// Release bound resources early (socket files, registry names).
    /// Dropping the acceptor must have the same effect.
    fn close(&mut self) {}
}

impl std::fmt::Debug for dyn Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

/// A (re)usable connection initiator for a single URL.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &TransportConfig) -> Result<Connection>;
}

impl std::fmt::Debug for dyn Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector").finish_non_exhaustive()
    }
}

/// Split `scheme://rest`, validating the shape.
pub(crate) fn parse_url(url: &str) -> Result<(&str, &str)> {
    let (scheme, rest) = url.split_once("://").ok_or(Error::AddressInvalid)?;
    if scheme.is_empty() {
        return Err(Error::AddressInvalid);
    }
    Ok((scheme, rest))
}

/// Bind a listening endpoint for `url`.
pub(crate) async fn bind(url: &str, config: &TransportConfig) -> Result<Box<dyn Acceptor>> {
    let (scheme, rest) = parse_url(url)?;
    match scheme {
        "tcp" => Ok(Box::new(tcp::TcpAcceptor::bind(rest, tcp::TcpFamily::Any).await?)),
        "tcp4" => Ok(Box::new(tcp::TcpAcceptor::bind(rest, tcp::TcpFamily::V4).await?)),
        "tcp6" => Ok(Box::new(tcp::TcpAcceptor::bind(rest, tcp::TcpFamily::V6).await?)),
        "tls+tcp" => Ok(Box::new(tls::TlsTcpAcceptor::bind(rest, config).await?)),
        "ipc" => Ok(Box::new(ipc::IpcAcceptor::bind(rest).await?)),
        #[cfg(target_os = "linux")]
        "abstract" => Ok(Box::new(ipc::AbstractAcceptor::bind(rest)?)),
        "inproc" => Ok(Box::new(inproc::InprocAcceptor::bind(rest)?)),
        _ => Err(Error::NotSupported),
    }
}

/// Build a connector for `url`. Resolution and connection happen per call
/// to [`Connector::connect`], so a dialer can retry with fresh state.
pub(crate) fn connector(url: &str) -> Result<Box<dyn Connector>> {
    let (scheme, rest) = parse_url(url)?;
    match scheme {
        "tcp" => Ok(Box::new(tcp::TcpConnector::new(rest, tcp::TcpFamily::Any))),
        "tcp4" => Ok(Box::new(tcp::TcpConnector::new(rest, tcp::TcpFamily::V4))),
        "tcp6" => Ok(Box::new(tcp::TcpConnector::new(rest, tcp::TcpFamily::V6))),
        "tls+tcp" => Ok(Box::new(tls::TlsTcpConnector::new(rest))),
        "ipc" => Ok(Box::new(ipc::IpcConnector::new(rest))),
        #[cfg(target_os = "linux")]
        "abstract" => Ok(Box::new(ipc::AbstractConnector::new(rest)?)),
        "inproc" => Ok(Box::new(inproc::InprocConnector::new(rest))),
        _ => Err(Error::NotSupported),
    }
}

/// Length-prefixed frame reader over any byte stream: a little-endian u32
/// length, then the payload.
pub(crate) struct LengthReader<R> {
    io: R,
}

impl<R> LengthReader<R> {
    pub fn new(io: R) -> Self {
        LengthReader { io }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for LengthReader<R> {
    async fn recv_frame(&mut self, max_size: usize) -> Result<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; 4];
        self.io.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if max_size > 0 && len > max_size {
            debug!(len, max_size, "discarding oversized frame");
            discard(&mut self.io, len).await?;
            return Ok(None);
        }

        let mut frame = vec![0u8; len];
        self.io.read_exact(&mut frame).await?;
        Ok(Some(frame))
    }
}

/// Read and throw away `n` bytes, keeping the stream in sync.
async fn discard<R: AsyncRead + Unpin + Send>(io: &mut R, mut n: usize) -> Result<()> {
    let mut sink = [0u8; 8192];
    while n > 0 {
        let take = n.min(sink.len());
        io.read_exact(&mut sink[..take]).await?;
        n -= take;
    }
    Ok(())
}

/// Counterpart of [`LengthReader`].
pub(crate) struct LengthWriter<W> {
    io: W,
}

impl<W> LengthWriter<W> {
    pub fn new(io: W) -> Self {
        LengthWriter { io }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for LengthWriter<W> {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > u32::MAX as usize {
            return Err(Error::MessageTooLarge);
        }
        let len = frame.len() as u32;
        self.io.write_all(&len.to_le_bytes()).await?;
        self.io.write_all(frame).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}
