//! In-process transport (`inproc://`).
//!
//! Connections are pairs of bounded byte-frame channels; listeners park in a
//! process-global name registry that dialers rendezvous through. Frames do
//! not leave the process and are never copied onto a wire.

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Acceptor, Connection, Connector, FrameReader, FrameWriter, TransportConfig};
use crate::error::{Error, Result};
use crate::sockaddr::SockAddr;

/// Frames in flight per direction before the writer blocks.
const CHANNEL_DEPTH: usize = 64;

type AcceptSender = mpsc::Sender<Connection>;

fn registry() -> &'static Mutex<HashMap<String, AcceptSender>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, AcceptSender>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl FrameReader for ChannelReader {
    async fn recv_frame(&mut self, max_size: usize) -> Result<Option<Vec<u8>>> {
        match self.rx.recv().await {
            Some(frame) if max_size > 0 && frame.len() > max_size => {
                debug!(len = frame.len(), max_size, "discarding oversized inproc frame");
                Ok(None)
            }
            Some(frame) => Ok(Some(frame)),
            None => Err(Error::ConnectionReset),
        }
    }
}

struct ChannelWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[async_trait]
impl FrameWriter for ChannelWriter {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::Closed)?;
        tx.send(frame.to_vec())
            .await
            .map_err(|_| Error::ConnectionReset)
    }

    async fn shutdown(&mut self) {
        self.tx.take();
    }
}

/// Two fully-connected halves of an in-process link.
fn link(name: &str) -> (Connection, Connection) {
    let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
    let addr = SockAddr::Inproc { name: name.to_owned() };
    let one = Connection {
        reader: Box::new(ChannelReader { rx: a_rx }),
        writer: Box::new(ChannelWriter { tx: Some(b_tx) }),
        local_addr: addr.clone(),
        peer_addr: addr.clone(),
    };
    let other = Connection {
        reader: Box::new(ChannelReader { rx: b_rx }),
        writer: Box::new(ChannelWriter { tx: Some(a_tx) }),
        local_addr: addr.clone(),
        peer_addr: addr,
    };
    (one, other)
}

pub(crate) struct InprocAcceptor {
    name: String,
    incoming: mpsc::Receiver<Connection>,
    registered: bool,
}

impl InprocAcceptor {
    pub fn bind(name: &str) -> Result<Self> {
        let mut names = registry().lock();
        if names.contains_key(name) {
            return Err(Error::AddressInUse);
        }
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        names.insert(name.to_owned(), tx);
        debug!(name, "inproc listener registered");
        Ok(InprocAcceptor {
            name: name.to_owned(),
            incoming: rx,
            registered: true,
        })
    }

    fn unregister(&mut self) {
        if self.registered {
            registry().lock().remove(&self.name);
            self.registered = false;
            debug!(name = %self.name, "inproc listener unregistered");
        }
    }
}

#[async_trait]
impl Acceptor for InprocAcceptor {
    async fn accept(&mut self, _config: &TransportConfig) -> Result<Connection> {
        self.incoming.recv().await.ok_or(Error::Closed)
    }

    fn local_addr(&self) -> SockAddr {
        SockAddr::Inproc { name: self.name.clone() }
    }

    fn close(&mut self) {
        self.unregister();
        self.incoming.close();
    }
}

impl Drop for InprocAcceptor {
    fn drop(&mut self) {
        self.unregister();
    }
}

pub(crate) struct InprocConnector {
    name: String,
}

impl InprocConnector {
    pub fn new(name: &str) -> Self {
        InprocConnector { name: name.to_owned() }
    }
}

#[async_trait]
impl Connector for InprocConnector {
    async fn connect(&self, _config: &TransportConfig) -> Result<Connection> {
        let accept_tx = registry()
            .lock()
            .get(&self.name)
            .cloned()
            .ok_or(Error::ConnectionRefused)?;
        let (dial_side, listen_side) = link(&self.name);
        accept_tx
            .send(listen_side)
            .await
            .map_err(|_| Error::ConnectionRefused)?;
        debug!(name = %self.name, "inproc connection established");
        Ok(dial_side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rendezvous_and_frame_exchange() {
        let config = TransportConfig::default();
        let mut acceptor = InprocAcceptor::bind("inproc-unit").unwrap();
        let connector = InprocConnector::new("inproc-unit");

        let (client, server) = tokio::join!(connector.connect(&config), acceptor.accept(&config));
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        client.writer.send_frame(b"in memory").await.unwrap();
        assert_eq!(server.reader.recv_frame(0).await.unwrap().unwrap(), b"in memory");
    }

    #[tokio::test]
    async fn duplicate_name_is_address_in_use() {
        let _first = InprocAcceptor::bind("inproc-dup").unwrap();
        assert!(matches!(InprocAcceptor::bind("inproc-dup"), Err(Error::AddressInUse)));
    }

    #[tokio::test]
    async fn dialing_nowhere_is_refused() {
        let connector = InprocConnector::new("inproc-nobody-home");
        let err = connector.connect(&TransportConfig::default()).await.unwrap_err();
        assert_eq!(err, Error::ConnectionRefused);
    }

    #[tokio::test]
    async fn close_frees_the_name() {
        let mut acceptor = InprocAcceptor::bind("inproc-reuse").unwrap();
        acceptor.close();
        assert!(InprocAcceptor::bind("inproc-reuse").is_ok());
    }
}
