//! Pair protocols: one-to-one (Pair0, Pair1) and one-to-many in Pair1's
//! polyamorous mode.
//!
//! Pair0 moves bodies verbatim between exactly two peers; a newly accepted
//! connection preempts the old one. Pair1 adds a 4-byte hop-count header
//! (always 1; anything else is dropped, since messages never traverse two
//! hops here). Polyamorous Pair1 keeps every peer and requires each send to
//! name its pipe explicitly; received messages carry the originating pipe.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{frame_with_header, ids, peek_u32_be, queue_recv, CallMode, PipeList, Protocol};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::options::{names, OptionValue};
use crate::pipe::Pipe;
use crate::queue::MsgQueue;
use crate::socket::Socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairVersion {
    V0,
    V1,
}

const HOP_HEADER: [u8; 4] = 1u32.to_be_bytes();

struct PairProto {
    version: PairVersion,
    /// Pair1 only; must be chosen before the first connection.
    poly: AtomicBool,
    ever_connected: AtomicBool,
    /// Current peer in one-to-one mode.
    peer: Mutex<Option<Pipe>>,
    pipes: PipeList,
    recv_q: MsgQueue<Message>,
    closed: AtomicBool,
}

impl PairProto {
    fn new(version: PairVersion, recv_buffer: usize) -> Self {
        PairProto {
            version,
            poly: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            peer: Mutex::new(None),
            pipes: PipeList::new(),
            recv_q: MsgQueue::new(recv_buffer),
            closed: AtomicBool::new(false),
        }
    }

    fn is_poly(&self) -> bool {
        self.poly.load(Ordering::Acquire)
    }

    fn make_frame(&self, body: &[u8]) -> Vec<u8> {
        match self.version {
            PairVersion::V0 => body.to_vec(),
            PairVersion::V1 => frame_with_header(&HOP_HEADER, body),
        }
    }

    /// Directed send used by polyamorous mode (and honored in one-to-one
    /// mode when the affinity names the live peer).
    async fn send_directed(&self, pipe: Pipe, body: &[u8], mode: CallMode) -> Result<()> {
        if pipe.is_closed() {
            return Err(Error::Closed);
        }
        let frame = self.make_frame(body);
        match mode {
            CallMode::NonBlocking => pipe.try_queue_frame(frame).map_err(|_| Error::TryAgain),
            CallMode::Deadline(deadline) => pipe.queue_frame(frame, deadline).await,
        }
    }
}

#[async_trait]
impl Protocol for PairProto {
    fn id(&self) -> u16 {
        match self.version {
            PairVersion::V0 => ids::PAIR0,
            PairVersion::V1 => ids::PAIR1,
        }
    }

    fn peer_id(&self) -> u16 {
        self.id()
    }

    fn name(&self) -> &'static str {
        match self.version {
            PairVersion::V0 => "pair",
            PairVersion::V1 => "pair1",
        }
    }

    fn peer_name(&self) -> &'static str {
        self.name()
    }

    fn pipe_added(&self, pipe: &Pipe) {
        self.ever_connected.store(true, Ordering::Release);
        self.pipes.add(pipe);
        if !self.is_poly() {
            let old = self.peer.lock().replace(pipe.clone());
            if let Some(old) = old {
                debug!(old = old.id(), new = pipe.id(), "pair peer preempted");
                old.close();
            }
        }
    }

    fn pipe_removed(&self, pipe: &Pipe) {
        self.pipes.remove(pipe.id());
        let mut peer = self.peer.lock();
        if peer.as_ref().map(Pipe::id) == Some(pipe.id()) {
            *peer = None;
        }
    }

    async fn deliver(&self, frame: Vec<u8>, pipe: &Pipe) {
        let (header, body) = match self.version {
            PairVersion::V0 => (Vec::new(), frame),
            PairVersion::V1 => {
                match peek_u32_be(&frame) {
                    Some(1) => (HOP_HEADER.to_vec(), frame[4..].to_vec()),
                    Some(hops) => {
                        debug!(pipe = pipe.id(), hops, "dropping message with bad hop count");
                        return;
                    }
                    None => {
                        debug!(pipe = pipe.id(), "dropping runt pair1 message");
                        return;
                    }
                }
            }
        };
        let msg = Message::from_wire(header, body, Some(pipe.clone()));
        let _ = self.recv_q.push(msg, None).await;
    }

    async fn send(&self, body: Vec<u8>, pipe: Option<Pipe>, mode: CallMode) -> Result<()> {
        if self.is_poly() {
            // Polyamorous sends go nowhere without explicit affinity.
            let pipe = pipe.ok_or(Error::InvalidOperation)?;
            return self.send_directed(pipe, &body, mode).await;
        }
        if let Some(pipe) = pipe {
            return self.send_directed(pipe, &body, mode).await;
        }

        let deadline = mode.deadline();
        loop {
            let notified = self.pipes.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            let current_peer = self.peer.lock().clone();
            if let Some(peer) = current_peer {
                match self.send_directed(peer, &body, mode).await {
                    // The peer died while we were queuing; a replacement may
                    // connect, so go around again.
                    Err(Error::Closed) => continue,
                    other => return other,
                }
            }

            match mode {
                CallMode::NonBlocking => return Err(Error::TryAgain),
                CallMode::Deadline(_) => crate::queue::wait(notified, deadline).await?,
            }
        }
    }

    async fn recv(&self, mode: CallMode) -> Result<Message> {
        queue_recv(&self.recv_q, mode).await
    }

    fn resize_recv_buffer(&self, capacity: usize) {
        self.recv_q.set_capacity(capacity);
    }

    fn set_option(&self, name: &str, value: &OptionValue) -> Result<()> {
        match name {
            names::PAIR1_POLYAMOROUS if self.version == PairVersion::V1 => {
                if self.ever_connected.load(Ordering::Acquire) {
                    return Err(Error::BadState);
                }
                self.poly.store(value.as_bool()?, Ordering::Release);
                Ok(())
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn get_option(&self, name: &str) -> Result<OptionValue> {
        match name {
            names::PAIR1_POLYAMOROUS if self.version == PairVersion::V1 => {
                Ok(OptionValue::Bool(self.is_poly()))
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.recv_q.close();
        self.pipes.ready.notify_waiters();
    }
}

/// One-to-one bidirectional socket, version 0.
pub struct Pair0 {
    socket: Socket,
}

impl Pair0 {
    pub fn open() -> Result<Pair0> {
        let recv_buffer = crate::defaults::RECV_BUFFER;
        let socket = Socket::open(Box::new(PairProto::new(PairVersion::V0, recv_buffer)))?;
        Ok(Pair0 { socket })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl Deref for Pair0 {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

/// One-to-one socket with hop-count headers; optionally polyamorous.
pub struct Pair1 {
    socket: Socket,
}

impl Pair1 {
    pub fn open() -> Result<Pair1> {
        let recv_buffer = crate::defaults::RECV_BUFFER;
        let socket = Socket::open(Box::new(PairProto::new(PairVersion::V1, recv_buffer)))?;
        Ok(Pair1 { socket })
    }

    /// Open with polyamorous mode already enabled.
    pub fn open_poly() -> Result<Pair1> {
        let pair = Pair1::open()?;
        pair.socket
            .set_option(names::PAIR1_POLYAMOROUS, OptionValue::Bool(true))?;
        Ok(pair)
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Whether sends require (and receives report) per-pipe affinity.
    pub fn is_polyamorous(&self) -> bool {
        matches!(
            self.socket.get_option(names::PAIR1_POLYAMOROUS),
            Ok(OptionValue::Bool(true))
        )
    }
}

impl Deref for Pair1 {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair1_header_is_a_single_hop() {
        let proto = PairProto::new(PairVersion::V1, 8);
        let frame = proto.make_frame(b"abc");
        assert_eq!(&frame[..4], &[0, 0, 0, 1]);
        assert_eq!(&frame[4..], b"abc");
    }

    #[test]
    fn poly_flag_locks_after_first_connection() {
        let proto = PairProto::new(PairVersion::V1, 8);
        proto
            .set_option(names::PAIR1_POLYAMOROUS, &OptionValue::Bool(true))
            .unwrap();
        proto.ever_connected.store(true, Ordering::Release);
        assert_eq!(
            proto
                .set_option(names::PAIR1_POLYAMOROUS, &OptionValue::Bool(false))
                .unwrap_err(),
            Error::BadState
        );
    }

    #[test]
    fn pair0_rejects_the_poly_option() {
        let proto = PairProto::new(PairVersion::V0, 8);
        assert_eq!(
            proto
                .set_option(names::PAIR1_POLYAMOROUS, &OptionValue::Bool(true))
                .unwrap_err(),
            Error::NotSupported
        );
    }
}
