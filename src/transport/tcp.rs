//! TCP transport (`tcp://`, `tcp4://`, `tcp6://`).

use std::net::SocketAddr as StdSocketAddr;

use async_trait::async_trait;
use socket2::SockRef;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::debug;

use super::{Acceptor, Connection, Connector, LengthReader, LengthWriter, TransportConfig};
use crate::error::{Error, Result};
use crate::sockaddr::SockAddr;

/// Address-family restriction carried by the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpFamily {
    Any,
    V4,
    V6,
}

impl TcpFamily {
    fn admits(self, addr: &StdSocketAddr) -> bool {
        match self {
            TcpFamily::Any => true,
            TcpFamily::V4 => addr.is_ipv4(),
            TcpFamily::V6 => addr.is_ipv6(),
        }
    }
}

async fn resolve(spec: &str, family: TcpFamily) -> Result<Vec<StdSocketAddr>> {
    let addrs: Vec<_> = lookup_host(spec)
        .await
        .map_err(|_| Error::AddressInvalid)?
        .filter(|a| family.admits(a))
        .collect();
    if addrs.is_empty() {
        return Err(Error::AddressInvalid);
    }
    Ok(addrs)
}

fn apply_stream_options(stream: &TcpStream, config: &TransportConfig) -> Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(config.tcp_nodelay)?;
    sock.set_keepalive(config.tcp_keepalive)?;
    Ok(())
}

pub(crate) fn framed(stream: TcpStream) -> Result<Connection> {
    let local_addr = SockAddr::from_std(stream.local_addr()?);
    let peer_addr = SockAddr::from_std(stream.peer_addr()?);
    let (read_half, write_half) = stream.into_split();
    Ok(Connection {
        reader: Box::new(LengthReader::new(read_half)),
        writer: Box::new(LengthWriter::new(write_half)),
        local_addr,
        peer_addr,
    })
}

pub(crate) struct TcpAcceptor {
    listener: TcpListener,
    local: SockAddr,
}

impl TcpAcceptor {
    pub async fn bind(spec: &str, family: TcpFamily) -> Result<Self> {
        let mut last_err = Error::AddressInvalid;
        for addr in resolve(spec, family).await? {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    let local = SockAddr::from_std(listener.local_addr()?);
                    debug!(%local, "tcp listener bound");
                    return Ok(TcpAcceptor { listener, local });
                }
                Err(e) => last_err = e.into(),
            }
        }
        Err(last_err)
    }

    pub(crate) async fn accept_stream(&self, config: &TransportConfig) -> Result<TcpStream> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(peer = %peer, "tcp connection accepted");
        apply_stream_options(&stream, config)?;
        Ok(stream)
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self, config: &TransportConfig) -> Result<Connection> {
        let stream = self.accept_stream(config).await?;
        framed(stream)
    }

    fn local_addr(&self) -> SockAddr {
        self.local.clone()
    }
}

pub(crate) struct TcpConnector {
    target: String,
    family: TcpFamily,
}

impl TcpConnector {
    pub fn new(spec: &str, family: TcpFamily) -> Self {
        TcpConnector {
            target: spec.to_owned(),
            family,
        }
    }

    pub(crate) async fn connect_stream(&self, config: &TransportConfig) -> Result<TcpStream> {
        let mut last_err = Error::ConnectionRefused;
        for addr in resolve(&self.target, self.family).await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    apply_stream_options(&stream, config)?;
                    debug!(peer = %addr, "tcp connection established");
                    return Ok(stream);
                }
                Err(e) => last_err = e.into(),
            }
        }
        Err(last_err)
    }

    pub(crate) fn host(&self) -> &str {
        // "host:port" (or "[v6]:port"); the host part names the TLS peer.
        match self.target.rfind(':') {
            Some(idx) => self.target[..idx].trim_matches(|c| c == '[' || c == ']'),
            None => &self.target,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &TransportConfig) -> Result<Connection> {
        let stream = self.connect_stream(config).await?;
        framed(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_connect_and_exchange_frames() {
        let config = TransportConfig {
            tcp_nodelay: true,
            ..Default::default()
        };
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0", TcpFamily::V4).await.unwrap();
        let port = match acceptor.local_addr() {
            SockAddr::In4 { port, .. } => u16::from_be(port),
            other => panic!("unexpected local address {other}"),
        };

        let connector = TcpConnector::new(&format!("127.0.0.1:{port}"), TcpFamily::Any);
        let (client, server) = tokio::join!(connector.connect(&config), acceptor.accept(&config));
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        client.writer.send_frame(b"over tcp").await.unwrap();
        assert_eq!(server.reader.recv_frame(0).await.unwrap().unwrap(), b"over tcp");

        server.writer.send_frame(b"and back").await.unwrap();
        assert_eq!(client.reader.recv_frame(0).await.unwrap().unwrap(), b"and back");
    }

    #[tokio::test]
    async fn refused_connection_maps_to_taxonomy() {
        // Bind-then-drop to find a port nothing listens on.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let connector = TcpConnector::new(&addr.to_string(), TcpFamily::Any);
        let err = connector.connect(&TransportConfig::default()).await.unwrap_err();
        assert_eq!(err, Error::ConnectionRefused);
    }

    #[test]
    fn host_extraction_for_tls() {
        assert_eq!(TcpConnector::new("example.com:4433", TcpFamily::Any).host(), "example.com");
        assert_eq!(TcpConnector::new("[::1]:4433", TcpFamily::Any).host(), "::1");
    }
}
