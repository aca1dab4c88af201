//! Pipeline protocols (Push0/Pull0).
//!
//! Push distributes each message to exactly one peer, round-robin over the
//! pipes that currently have queue capacity; with no capacity anywhere the
//! send blocks (or times out / returns `TryAgain`). Pull fair-receives from
//! all of its peers. The reverse directions do not exist.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{ids, queue_recv, send_round_robin, CallMode, PipeList, Protocol, RoundRobin};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::pipe::Pipe;
use crate::queue::MsgQueue;
use crate::socket::Socket;

struct PushProto {
    pipes: PipeList,
    rr: RoundRobin,
    closed: AtomicBool,
}

#[async_trait]
impl Protocol for PushProto {
    fn id(&self) -> u16 {
        ids::PUSH0
    }

    fn peer_id(&self) -> u16 {
        ids::PULL0
    }

    fn name(&self) -> &'static str {
        "push"
    }

    fn peer_name(&self) -> &'static str {
        "pull"
    }

    fn pipe_added(&self, pipe: &Pipe) {
        self.pipes.add(pipe);
    }

    fn pipe_removed(&self, pipe: &Pipe) {
        self.pipes.remove(pipe.id());
    }

    async fn deliver(&self, _frame: Vec<u8>, pipe: &Pipe) {
        debug!(pipe = pipe.id(), "pusher dropping unexpected inbound message");
    }

    async fn send(&self, body: Vec<u8>, pipe: Option<Pipe>, mode: CallMode) -> Result<()> {
        if let Some(pipe) = pipe {
            // Explicit affinity bypasses the round-robin.
            if pipe.is_closed() {
                return Err(Error::Closed);
            }
            return match mode {
                CallMode::NonBlocking => pipe.try_queue_frame(body).map_err(|_| Error::TryAgain),
                CallMode::Deadline(deadline) => pipe.queue_frame(body, deadline).await,
            };
        }
        send_round_robin(&self.pipes, &self.rr, body, mode, None, &self.closed).await?;
        Ok(())
    }

    async fn recv(&self, _mode: CallMode) -> Result<Message> {
        Err(Error::NotSupported)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pipes.ready.notify_waiters();
    }
}

struct PullProto {
    recv_q: MsgQueue<Message>,
}

#[async_trait]
impl Protocol for PullProto {
    fn id(&self) -> u16 {
        ids::PULL0
    }

    fn peer_id(&self) -> u16 {
        ids::PUSH0
    }

    fn name(&self) -> &'static str {
        "pull"
    }

    fn peer_name(&self) -> &'static str {
        "push"
    }

    fn pipe_added(&self, _pipe: &Pipe) {}

    fn pipe_removed(&self, _pipe: &Pipe) {}

    async fn deliver(&self, frame: Vec<u8>, pipe: &Pipe) {
        // Backpressure: a full queue slows the pipes down rather than
        // dropping work items.
        let msg = Message::from_wire(Vec::new(), frame, Some(pipe.clone()));
        let _ = self.recv_q.push(msg, None).await;
    }

    async fn send(&self, _body: Vec<u8>, _pipe: Option<Pipe>, _mode: CallMode) -> Result<()> {
        Err(Error::NotSupported)
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

/// Work distributor: send-only, round-robin over peers.
pub struct Push0 {
    socket: Socket,
}

impl Push0 {
    pub fn open() -> Result<Push0> {
        let socket = Socket::open(Box::new(PushProto {
            pipes: PipeList::new(),
            rr: RoundRobin::new(),
            closed: AtomicBool::new(false),
        }))?;
        Ok(Push0 { socket })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl Deref for Push0 {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

/// Work collector: receive-only, fair over peers.
pub struct Pull0 {
    socket: Socket,
}

impl Pull0 {
    pub fn open() -> Result<Pull0> {
        let recv_buffer = crate::defaults::RECV_BUFFER;
        let socket = Socket::open(Box::new(PullProto {
            recv_q: MsgQueue::new(recv_buffer),
        }))?;
        Ok(Pull0 { socket })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl Deref for Pull0 {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}
