//! TLS-over-TCP transport (`tls+tcp://`).
//!
//! Plain TCP underneath, with a rustls handshake layered on before any
//! frame moves. The TLS material comes in through
//! [`TransportConfig::tls`](super::TransportConfig); an endpoint without a
//! config cannot start a handshake and fails with `CryptoError`.

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor as RustlsAcceptor, TlsConnector as RustlsConnector};
use tracing::{debug, warn};

use super::tcp::{TcpAcceptor, TcpConnector, TcpFamily};
use super::{Acceptor, Connection, Connector, LengthReader, LengthWriter, TransportConfig};
use crate::error::{Error, Result};
use crate::sockaddr::SockAddr;
use crate::tls::TlsConfig;

fn required_tls(config: &TransportConfig) -> Result<&TlsConfig> {
    config.tls.as_ref().ok_or_else(|| {
        warn!("tls+tcp endpoint used without a TLS configuration");
        Error::CryptoError
    })
}

fn framed_tls<S>(stream: S, local_addr: SockAddr, peer_addr: SockAddr) -> Connection
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    Connection {
        reader: Box::new(LengthReader::new(read_half)),
        writer: Box::new(LengthWriter::new(write_half)),
        local_addr,
        peer_addr,
    }
}

pub(crate) struct TlsTcpAcceptor {
    tcp: TcpAcceptor,
}

impl TlsTcpAcceptor {
    pub async fn bind(spec: &str, config: &TransportConfig) -> Result<Self> {
        // Fail early when the listener has no server credentials.
        required_tls(config)?.server_config()?;
        let tcp = TcpAcceptor::bind(spec, TcpFamily::Any).await?;
        Ok(TlsTcpAcceptor { tcp })
    }
}

#[async_trait]
impl Acceptor for TlsTcpAcceptor {
    async fn accept(&mut self, config: &TransportConfig) -> Result<Connection> {
        let server_config = required_tls(config)?.server_config()?;
        let stream = self.tcp.accept_stream(config).await?;
        let local_addr = SockAddr::from_std(stream.local_addr()?);
        let peer_addr = SockAddr::from_std(stream.peer_addr()?);

        let acceptor = RustlsAcceptor::from(server_config);
        let stream = acceptor.accept(stream).await.map_err(|e| {
            warn!(peer = %peer_addr, "TLS accept handshake failed: {e}");
            Error::CryptoError
        })?;
        debug!(peer = %peer_addr, "TLS connection accepted");
        Ok(framed_tls(stream, local_addr, peer_addr))
    }

    fn local_addr(&self) -> SockAddr {
        Acceptor::local_addr(&self.tcp)
    }
}

pub(crate) struct TlsTcpConnector {
    tcp: TcpConnector,
}

impl TlsTcpConnector {
    pub fn new(spec: &str) -> Self {
        TlsTcpConnector {
            tcp: TcpConnector::new(spec, TcpFamily::Any),
        }
    }

    fn server_name(&self, tls: &TlsConfig) -> Result<ServerName<'static>> {
        let name = tls
            .server_name()
            .map(str::to_owned)
            .unwrap_or_else(|| self.tcp.host().to_owned());
        ServerName::try_from(name).map_err(|_| Error::AddressInvalid)
    }
}

#[async_trait]
impl Connector for TlsTcpConnector {
    async fn connect(&self, config: &TransportConfig) -> Result<Connection> {
        let tls = required_tls(config)?;
        let client_config = tls.client_config()?;
        let server_name = self.server_name(tls)?;

        let stream: TcpStream = self.tcp.connect_stream(config).await?;
        let local_addr = SockAddr::from_std(stream.local_addr()?);
        let peer_addr = SockAddr::from_std(stream.peer_addr()?);

        let connector = RustlsConnector::from(client_config);
        let stream = connector.connect(server_name, stream).await.map_err(|e| {
            warn!(peer = %peer_addr, "TLS connect handshake failed: {e}");
            Error::AuthenticationError
        })?;
        debug!(peer = %peer_addr, "TLS connection established");
        Ok(framed_tls(stream, local_addr, peer_addr))
    }
}
