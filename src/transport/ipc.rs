//! IPC transports: Unix domain sockets (`ipc://`) and the Linux abstract
//! namespace (`abstract://`).
//!
//! The filesystem variant owns its socket file: whoever bound it unlinks it
//! again on close, so the address can be reused immediately. Abstract names
//! never touch the filesystem; an empty name asks for auto-bind, which we
//! satisfy with a freshly generated name.

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use super::{Acceptor, Connection, Connector, LengthReader, LengthWriter, TransportConfig};
use crate::error::{Error, Result};
use crate::sockaddr::SockAddr;

fn framed_unix(stream: UnixStream, local_addr: SockAddr, peer_addr: SockAddr) -> Connection {
    let (read_half, write_half) = stream.into_split();
    Connection {
        reader: Box::new(LengthReader::new(read_half)),
        writer: Box::new(LengthWriter::new(write_half)),
        local_addr,
        peer_addr,
    }
}

pub(crate) struct IpcAcceptor {
    listener: Option<UnixListener>,
    path: String,
}

impl IpcAcceptor {
    pub async fn bind(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::AddressInvalid);
        }
        let listener = UnixListener::bind(path)?;
        debug!(path, "ipc listener bound");
        Ok(IpcAcceptor {
            listener: Some(listener),
            path: path.to_owned(),
        })
    }

    fn unlink(&self) {
        // Only the binder may remove the socket file.
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl Acceptor for IpcAcceptor {
    async fn accept(&mut self, _config: &TransportConfig) -> Result<Connection> {
        let listener = self.listener.as_ref().ok_or(Error::Closed)?;
        let (stream, _addr) = listener.accept().await?;
        debug!(path = %self.path, "ipc connection accepted");
        Ok(framed_unix(
            stream,
            SockAddr::Ipc { path: self.path.clone() },
            SockAddr::Ipc { path: String::new() },
        ))
    }

    fn local_addr(&self) -> SockAddr {
        SockAddr::Ipc { path: self.path.clone() }
    }

    fn close(&mut self) {
        if self.listener.take().is_some() {
            self.unlink();
        }
    }
}

impl Drop for IpcAcceptor {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) struct IpcConnector {
    path: String,
}

impl IpcConnector {
    pub fn new(path: &str) -> Self {
        IpcConnector { path: path.to_owned() }
    }
}

#[async_trait]
impl Connector for IpcConnector {
    async fn connect(&self, _config: &TransportConfig) -> Result<Connection> {
        let stream = UnixStream::connect(&self.path).await?;
        debug!(path = %self.path, "ipc connection established");
        Ok(framed_unix(
            stream,
            SockAddr::Ipc { path: String::new() },
            SockAddr::Ipc { path: self.path.clone() },
        ))
    }
}

#[cfg(target_os = "linux")]
pub(crate) use abstract_ns::{AbstractAcceptor, AbstractConnector};

#[cfg(target_os = "linux")]
mod abstract_ns {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{
        SocketAddr as UnixSocketAddr, UnixListener as StdUnixListener,
        UnixStream as StdUnixStream,
    };

    use rand::Rng;

    use super::*;
    use crate::sockaddr::uri_decode;

    fn abstract_addr(name: &[u8]) -> Result<UnixSocketAddr> {
        UnixSocketAddr::from_abstract_name(name).map_err(|_| Error::AddressInvalid)
    }

    /// Stand-in for kernel auto-bind: a short random name, regenerated on
    /// collision by the caller retrying.
    fn auto_name() -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let tag: u32 = rng.gen_range(0..0x100000);
        format!("{tag:05x}").into_bytes()
    }

    pub(crate) struct AbstractAcceptor {
        listener: Option<UnixListener>,
        name: Vec<u8>,
    }

    impl AbstractAcceptor {
        pub fn bind(spec: &str) -> Result<Self> {
            let requested = uri_decode(spec);
            let mut attempts = if requested.is_empty() { 8 } else { 1 };
            loop {
                let name = if requested.is_empty() {
                    auto_name()
                } else {
                    requested.clone()
                };
                let addr = abstract_addr(&name)?;
                match StdUnixListener::bind_addr(&addr) {
                    Ok(std_listener) => {
                        std_listener.set_nonblocking(true)?;
                        let listener = UnixListener::from_std(std_listener)?;
                        debug!(name = %SockAddr::Abstract { name: name.clone() },
                               "abstract listener bound");
                        return Ok(AbstractAcceptor {
                            listener: Some(listener),
                            name,
                        });
                    }
                    Err(e) => {
                        attempts -= 1;
                        if attempts == 0 {
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    #[async_trait]
    impl Acceptor for AbstractAcceptor {
        async fn accept(&mut self, _config: &TransportConfig) -> Result<Connection> {
            let listener = self.listener.as_ref().ok_or(Error::Closed)?;
            let (stream, _addr) = listener.accept().await?;
            Ok(framed_unix(
                stream,
                SockAddr::Abstract { name: self.name.clone() },
                SockAddr::Unspec,
            ))
        }

        fn local_addr(&self) -> SockAddr {
            SockAddr::Abstract { name: self.name.clone() }
        }

        fn close(&mut self) {
            // Abstract names vanish with the last socket; nothing to unlink.
            self.listener.take();
        }
    }

    pub(crate) struct AbstractConnector {
        name: Vec<u8>,
    }

    impl AbstractConnector {
        pub fn new(spec: &str) -> Result<Self> {
            let name = uri_decode(spec);
            if name.is_empty() {
                return Err(Error::AddressInvalid);
            }
            Ok(AbstractConnector { name })
        }
    }

    #[async_trait]
    impl Connector for AbstractConnector {
        async fn connect(&self, _config: &TransportConfig) -> Result<Connection> {
            let addr = abstract_addr(&self.name)?;
            let std_stream = tokio::task::spawn_blocking(move || StdUnixStream::connect_addr(&addr))
                .await
                .map_err(|_| Error::Internal)??;
            std_stream.set_nonblocking(true)?;
            let stream = UnixStream::from_std(std_stream)?;
            Ok(framed_unix(
                stream,
                SockAddr::Unspec,
                SockAddr::Abstract { name: self.name.clone() },
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ipc_round_trip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scalemsg.sock");
        let path_str = path.to_str().unwrap().to_owned();

        let config = TransportConfig::default();
        let mut acceptor = IpcAcceptor::bind(&path_str).await.unwrap();
        let connector = IpcConnector::new(&path_str);

        let (client, server) = tokio::join!(connector.connect(&config), acceptor.accept(&config));
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        client.writer.send_frame(b"over ipc").await.unwrap();
        assert_eq!(server.reader.recv_frame(0).await.unwrap().unwrap(), b"over ipc");

        // Closing the acceptor removes the socket file so the path can be
        // bound again right away.
        acceptor.close();
        assert!(!path.exists());
        let again = IpcAcceptor::bind(&path_str).await;
        assert!(again.is_ok());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abstract_round_trip_with_explicit_name() {
        let name = format!("scalemsg-test-{}", std::process::id());
        let config = TransportConfig::default();
        let mut acceptor = AbstractAcceptor::bind(&name).unwrap();
        let connector = AbstractConnector::new(&name).unwrap();

        let (client, server) = tokio::join!(connector.connect(&config), acceptor.accept(&config));
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        client.writer.send_frame(b"unseen").await.unwrap();
        assert_eq!(server.reader.recv_frame(0).await.unwrap().unwrap(), b"unseen");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abstract_auto_bind_gets_a_name() {
        let acceptor = AbstractAcceptor::bind("").unwrap();
        match acceptor.local_addr() {
            SockAddr::Abstract { name } => assert!(!name.is_empty()),
            other => panic!("unexpected address {other}"),
        }
    }
}
