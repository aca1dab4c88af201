//! Bus protocol (Bus0).
//!
//! Every send goes to every directly connected peer; every peer's messages
//! land in one fair receive queue. There is no transitive forwarding: a
//! message never hops across an intermediate bus socket on its own.

use std::ops::Deref;

use async_trait::async_trait;
use tracing::debug;

use super::{broadcast, ids, queue_recv, CallMode, PipeList, Protocol};
use crate::error::Result;
use crate::message::Message;
use crate::pipe::Pipe;
use crate::queue::MsgQueue;
use crate::socket::Socket;

struct BusProto {
    pipes: PipeList,
    recv_q: MsgQueue<Message>,
}

#[async_trait]
impl Protocol for BusProto {
    fn id(&self) -> u16 {
        ids::BUS0
    }

    fn peer_id(&self) -> u16 {
        ids::BUS0
    }

    fn name(&self) -> &'static str {
        "bus"
    }

    fn peer_name(&self) -> &'static str {
        "bus"
    }

    fn pipe_added(&self, pipe: &Pipe) {
        self.pipes.add(pipe);
    }

    fn pipe_removed(&self, pipe: &Pipe) {
        self.pipes.remove(pipe.id());
    }

    async fn deliver(&self, frame: Vec<u8>, pipe: &Pipe) {
        let msg = Message::from_wire(Vec::new(), frame, Some(pipe.clone()));
        if self.recv_q.try_push(msg).is_err() {
            debug!(pipe = pipe.id(), "bus backlog full, message dropped");
        }
    }

    async fn send(&self, body: Vec<u8>, _pipe: Option<Pipe>, _mode: CallMode) -> Result<()> {
        broadcast(&self.pipes.snapshot(), &body);
        Ok(())
    }

    async fn recv(&self, mode: CallMode) -> Result<Message> {
        queue_recv(&self.recv_q, mode).await
    }

    fn resize_recv_buffer(&self, capacity: usize) {
        self.recv_q.set_capacity(capacity);
    }

    fn close(&self) {
        self.recv_q.close();
    }
}

/// Many-to-many mesh socket.
pub struct Bus0 {
    socket: Socket,
}

impl Bus0 {
    pub fn open() -> Result<Bus0> {
        let recv_buffer = crate::defaults::RECV_BUFFER;
        let socket = Socket::open(Box::new(BusProto {
            pipes: PipeList::new(),
            recv_q: MsgQueue::new(recv_buffer),
        }))?;
        Ok(Bus0 { socket })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl Deref for Bus0 {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}
