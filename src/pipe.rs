//! Pipes: one live connection bound to a socket.
//!
//! A pipe owns a bounded outbound queue and two background tasks on the
//! library runtime: a reader pumping transport frames into the protocol
//! state machine and a writer draining the send queue onto the transport.
//! Pipe ids are allocated from a process-wide counter and never reused.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::options::{names, OptionValue};
use crate::queue::{MsgQueue, TryPushError};
use crate::runtime;
use crate::sockaddr::SockAddr;
use crate::socket::SocketCore;
use crate::transport::Connection;

static NEXT_PIPE_ID: AtomicU32 = AtomicU32::new(1);

/// How long a peer gets to complete protocol negotiation.
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which endpoint kind produced a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Listener,
    Dialer,
}

pub(crate) struct PipeInner {
    id: u32,
    socket_id: u32,
    socket: Weak<SocketCore>,
    endpoint_id: u32,
    endpoint_kind: EndpointKind,
    send_q: MsgQueue<Vec<u8>>,
    local_addr: SockAddr,
    peer_addr: SockAddr,
    /// Inbound frame size cap, snapshotted from the endpoint at creation.
    recv_max: usize,
    closed: AtomicBool,
    closed_notify: Notify,
}

/// Cloneable handle to one connection of a socket.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.inner.id)
            .field("socket", &self.inner.socket_id)
            .field("peer", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Pipe {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Pipe {}

impl Pipe {
    pub(crate) fn new(
        socket: &Arc<SocketCore>,
        endpoint_id: u32,
        endpoint_kind: EndpointKind,
        local_addr: SockAddr,
        peer_addr: SockAddr,
        send_buffer: usize,
        recv_max: usize,
    ) -> Pipe {
        Pipe {
            inner: Arc::new(PipeInner {
                id: NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed),
                socket_id: socket.id(),
                socket: Arc::downgrade(socket),
                endpoint_id,
                endpoint_kind,
                send_q: MsgQueue::new(send_buffer),
                local_addr,
                peer_addr,
                recv_max,
                closed: AtomicBool::new(false),
                closed_notify: Notify::new(),
            }),
        }
    }

    /// Frame size cap applied to this pipe's inbound traffic (0 = no cap).
    pub(crate) fn recv_max(&self) -> usize {
        self.inner.recv_max
    }

    /// Unique, monotonically assigned pipe id.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Id of the owning socket.
    pub fn socket_id(&self) -> u32 {
        self.inner.socket_id
    }

    /// Id of the listener or dialer that produced this pipe.
    pub fn endpoint_id(&self) -> u32 {
        self.inner.endpoint_id
    }

    pub fn endpoint_kind(&self) -> EndpointKind {
        self.inner.endpoint_kind
    }

    pub fn local_address(&self) -> SockAddr {
        self.inner.local_addr.clone()
    }

    pub fn remote_address(&self) -> SockAddr {
        self.inner.peer_addr.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close this pipe. The connection is torn down and, when a dialer
    /// produced it, a reconnect gets scheduled. Safe to call from pipe
    /// callbacks; closing during pre-add vetoes the pipe entirely.
    pub fn close(&self) {
        self.mark_closed();
    }

    pub(crate) fn mark_closed(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.send_q.close();
            self.inner.closed_notify.notify_waiters();
        }
    }

    pub(crate) async fn wait_closed(&self) {
        loop {
            let notified = self.inner.closed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Directed send on this specific pipe (synchronous).
    pub fn send(&self, data: &[u8]) -> Result<()> {
        runtime::block_on(self.asend(data))
    }

    /// Directed send on this specific pipe.
    pub async fn asend(&self, data: &[u8]) -> Result<()> {
        let mut msg = Message::with_pipe(data, self);
        self.asend_msg(&mut msg).await
    }

    pub fn send_msg(&self, msg: &mut Message) -> Result<()> {
        runtime::block_on(self.asend_msg(msg))
    }

    /// Directed message send; the message's affinity is forced to this pipe
    /// and the owning socket's protocol rules still apply.
    pub async fn asend_msg(&self, msg: &mut Message) -> Result<()> {
        msg.set_pipe(self)?;
        let core = self.inner.socket.upgrade().ok_or(Error::Closed)?;
        let (body, pipe) = msg.take_for_send()?;
        core.asend_parts(body, pipe).await
    }

    /// Pipe options are read-only views of connection state.
    pub fn get_option(&self, name: &str) -> Result<OptionValue> {
        match name {
            names::LOCAL_ADDRESS => Ok(OptionValue::Addr(self.local_address())),
            names::PEER_ADDRESS => Ok(OptionValue::Addr(self.remote_address())),
            _ => Err(Error::NotSupported),
        }
    }

    pub fn set_option(&self, name: &str, _value: &OptionValue) -> Result<()> {
        match name {
            names::LOCAL_ADDRESS | names::PEER_ADDRESS => Err(Error::ReadOnly),
            _ => Err(Error::NotSupported),
        }
    }

    /// Queue a wire frame without waiting; the frame is handed back when
    /// the queue is full or the pipe is closed.
    pub(crate) fn try_queue_frame(&self, frame: Vec<u8>) -> std::result::Result<(), Vec<u8>> {
        match self.inner.send_q.try_push(frame) {
            Ok(()) => Ok(()),
            Err(TryPushError::Full(frame)) | Err(TryPushError::Closed(frame)) => Err(frame),
        }
    }

    /// Queue a wire frame, waiting for capacity up to `deadline`.
    pub(crate) async fn queue_frame(
        &self,
        frame: Vec<u8>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        self.inner.send_q.push(frame, deadline).await
    }

    pub(crate) fn set_drain_notify(&self, notify: Arc<Notify>) {
        self.inner.send_q.set_drain_notify(notify);
    }

    pub(crate) fn set_send_capacity(&self, capacity: usize) {
        self.inner.send_q.set_capacity(capacity);
    }
}

/// Exchange and validate the 8-byte protocol banner:
/// `\0 S P \0 <proto-id be16> \0 \0`. A mismatched peer is rejected.
pub(crate) async fn negotiate(
    conn: &mut Connection,
    self_id: u16,
    expected_peer: u16,
) -> Result<()> {
    let work = async {
        let mut banner = [0u8; 8];
        banner[1] = b'S';
        banner[2] = b'P';
        banner[4..6].copy_from_slice(&self_id.to_be_bytes());
        conn.writer.send_frame(&banner).await?;

        let frame = conn
            .reader
            .recv_frame(banner.len())
            .await?
            .ok_or(Error::ProtocolError)?;
        if frame.len() != 8 || frame[0] != 0 || frame[1] != b'S' || frame[2] != b'P' || frame[3] != 0
        {
            return Err(Error::ProtocolError);
        }
        let peer = u16::from_be_bytes([frame[4], frame[5]]);
        if peer != expected_peer {
            debug!(peer, expected_peer, "peer protocol mismatch");
            return Err(Error::ProtocolError);
        }
        Ok(())
    };
    match tokio::time::timeout(NEGOTIATE_TIMEOUT, work).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}

/// Spawn the reader and writer tasks for a freshly added pipe.
pub(crate) fn start_io(core: &Arc<SocketCore>, pipe: &Pipe, conn: Connection) {
    let Connection {
        mut reader,
        mut writer,
        ..
    } = conn;

    let weak = Arc::downgrade(core);
    let reader_pipe = pipe.clone();
    runtime::spawn(async move {
        let max_size = reader_pipe.recv_max();
        loop {
            tokio::select! {
                biased;
                _ = reader_pipe.wait_closed() => break,
                incoming = reader.recv_frame(max_size) => match incoming {
                    Ok(Some(frame)) => {
                        let Some(core) = weak.upgrade() else { break };
                        core.deliver(frame, &reader_pipe).await;
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        debug!(pipe = reader_pipe.id(), "pipe read ended: {e}");
                        break;
                    }
                },
            }
        }
        reader_pipe.mark_closed();
        if let Some(core) = weak.upgrade() {
            core.remove_pipe(&reader_pipe);
        }
    });

    let writer_pipe = pipe.clone();
    runtime::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_pipe.wait_closed() => break,
                frame = writer_pipe.inner.send_q.pop(None) => match frame {
                    Ok(frame) => {
                        if let Err(e) = writer.send_frame(&frame).await {
                            debug!(pipe = writer_pipe.id(), "pipe write failed: {e}");
                            writer_pipe.mark_closed();
                            break;
                        }
                    }
                    Err(_) => break,
                },
            }
        }
        writer.shutdown().await;
    });
}
