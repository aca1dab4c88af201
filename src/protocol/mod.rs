//! Protocol state machines.
//!
//! Each messaging pattern implements [`Protocol`]: it owns the pattern's
//! queues and per-pipe bookkeeping, decides which pipe an outgoing message
//! lands on, and transforms inbound frames (header stripping, filtering,
//! routing) before they reach the caller. The socket core calls in through
//! this trait only; protocols never touch transports directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::options::OptionValue;
use crate::pipe::Pipe;
use crate::queue::MsgQueue;

pub(crate) mod bus;
pub(crate) mod pair;
pub(crate) mod pipeline;
pub(crate) mod pubsub;
pub(crate) mod reqrep;
pub(crate) mod survey;

pub use bus::Bus0;
pub use pair::{Pair0, Pair1};
pub use pipeline::{Pull0, Push0};
pub use pubsub::{Pub0, Sub0};
pub use reqrep::{Rep0, Req0};
pub use survey::{Respondent0, Surveyor0};

/// Numeric protocol identifiers, as exchanged during pipe negotiation.
pub(crate) mod ids {
    pub const PAIR0: u16 = 0x10;
    pub const PAIR1: u16 = 0x11;
    pub const PUB0: u16 = 0x20;
    pub const SUB0: u16 = 0x21;
    pub const REQ0: u16 = 0x30;
    pub const REP0: u16 = 0x31;
    pub const PUSH0: u16 = 0x50;
    pub const PULL0: u16 = 0x51;
    pub const SURVEYOR0: u16 = 0x62;
    pub const RESPONDENT0: u16 = 0x63;
    pub const BUS0: u16 = 0x70;
}

/// How a send/recv entry point wants to block.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CallMode {
    /// Fail with `TryAgain` instead of waiting.
    NonBlocking,
    /// Wait, bounded by an optional deadline (`Timeout` past it).
    Deadline(Option<Instant>),
}

impl CallMode {
    pub fn deadline(self) -> Option<Instant> {
        match self {
            CallMode::NonBlocking => None,
            CallMode::Deadline(d) => d,
        }
    }
}

/// Pop a message according to the caller's blocking mode.
pub(crate) async fn queue_recv(queue: &MsgQueue<Message>, mode: CallMode) -> Result<Message> {
    match mode {
        CallMode::NonBlocking => queue.try_pop()?.ok_or(Error::TryAgain),
        CallMode::Deadline(deadline) => queue.pop(deadline).await,
    }
}

/// One protocol state machine attached to a socket.
#[async_trait]
pub(crate) trait Protocol: Send + Sync {
    fn id(&self) -> u16;
    fn peer_id(&self) -> u16;
    fn name(&self) -> &'static str;
    fn peer_name(&self) -> &'static str;

    /// Whether [`Protocol::open_context`] works (Req0/Rep0 family only).
    fn supports_context(&self) -> bool {
        false
    }

    /// Open an independent protocol-state slice for concurrent exchanges.
    fn open_context(&self) -> Result<Arc<dyn ProtocolContext>> {
        Err(Error::NotSupported)
    }

    /// A pipe joined the socket (post-add, under the pipe-notify lock).
    fn pipe_added(&self, pipe: &Pipe);

    /// A pipe left the socket (under the pipe-notify lock).
    fn pipe_removed(&self, pipe: &Pipe);

    /// An inbound frame arrived on `pipe`. The protocol parses its header
    /// rules and queues, routes or drops the message.
    async fn deliver(&self, frame: Vec<u8>, pipe: &Pipe);

    /// Send `body`, optionally directed at `pipe` (affinity).
    async fn send(&self, body: Vec<u8>, pipe: Option<Pipe>, mode: CallMode) -> Result<()>;

    /// Receive the next message for this socket.
    async fn recv(&self, mode: CallMode) -> Result<Message>;

    /// Apply a changed `recv-buffer` option to the protocol's queues.
    fn resize_recv_buffer(&self, _capacity: usize) {}

    /// Protocol-specific options (names carry a `proto:` prefix).
    fn set_option(&self, _name: &str, _value: &OptionValue) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn get_option(&self, _name: &str) -> Result<OptionValue> {
        Err(Error::NotSupported)
    }

    /// Tear down queues; every blocked caller wakes with `Closed`.
    fn close(&self);
}

/// An independent protocol-state slice multiplexed onto one socket.
#[async_trait]
pub(crate) trait ProtocolContext: Send + Sync {
    async fn send(&self, body: Vec<u8>, pipe: Option<Pipe>, mode: CallMode) -> Result<()>;
    async fn recv(&self, mode: CallMode) -> Result<Message>;

    fn set_option(&self, _name: &str, _value: &OptionValue) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn get_option(&self, _name: &str) -> Result<OptionValue> {
        Err(Error::NotSupported)
    }

    fn close(&self);
}

/// The set of live pipes a protocol dispatches over, with a shared wakeup
/// for capacity/membership changes.
pub(crate) struct PipeList {
    pipes: Mutex<Vec<Pipe>>,
    /// Pinged when a pipe joins or leaves, and by every pipe whose send
    /// queue drains (see `MsgQueue::set_drain_notify`).
    pub ready: Arc<Notify>,
}

impl PipeList {
    pub fn new() -> Self {
        PipeList {
            pipes: Mutex::new(Vec::new()),
            ready: Arc::new(Notify::new()),
        }
    }

    pub fn add(&self, pipe: &Pipe) {
        pipe.set_drain_notify(self.ready.clone());
        self.pipes.lock().push(pipe.clone());
        self.ready.notify_waiters();
    }

    pub fn remove(&self, id: u32) {
        self.pipes.lock().retain(|p| p.id() != id);
        self.ready.notify_waiters();
    }

    pub fn snapshot(&self) -> Vec<Pipe> {
        self.pipes.lock().clone()
    }
}

/// Round-robin cursor over a [`PipeList`].
pub(crate) struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin {
            next: AtomicUsize::new(0),
        }
    }

    pub fn start(&self, len: usize) -> usize {
        if len == 0 {
            0
        } else {
            self.next.fetch_add(1, Ordering::Relaxed) % len
        }
    }
}

/// Prefix a body with a protocol header.
pub(crate) fn frame_with_header(header: &[u8], body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header);
    frame.extend_from_slice(body);
    frame
}

/// Read the 4-byte big-endian word at the front of a frame.
pub(crate) fn peek_u32_be(frame: &[u8]) -> Option<u32> {
    let word: [u8; 4] = frame.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(word))
}

/// Best-effort broadcast: enqueue `frame` on every live pipe, dropping it
/// where the send queue is full.
pub(crate) fn broadcast(pipes: &[Pipe], frame: &[u8]) {
    for pipe in pipes {
        if pipe.try_queue_frame(frame.to_vec()).is_err() {
            debug!(pipe = pipe.id(), "broadcast frame dropped (queue full or pipe closed)");
        }
    }
}

/// Queue `frame` on the next pipe with capacity, round-robin. Returns the
/// pipe the frame landed on. Blocks (per `mode`) when every queue is full
/// or no pipe exists; `exclude` skips one pipe when alternatives exist;
/// `closed` aborts waiters when the protocol shuts down.
pub(crate) async fn send_round_robin(
    list: &PipeList,
    rr: &RoundRobin,
    frame: Vec<u8>,
    mode: CallMode,
    exclude: Option<u32>,
    closed: &std::sync::atomic::AtomicBool,
) -> Result<Pipe> {
    let deadline = mode.deadline();
    let mut frame = frame;
    loop {
        let notified = list.ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let pipes = list.snapshot();
        let n = pipes.len();
        let start = rr.start(n);
        for i in 0..n {
            let pipe = &pipes[(start + i) % n];
            if n > 1 && exclude == Some(pipe.id()) {
                continue;
            }
            match pipe.try_queue_frame(frame) {
                Ok(()) => return Ok(pipe.clone()),
                Err(back) => frame = back,
            }
        }

        match mode {
            CallMode::NonBlocking => return Err(Error::TryAgain),
            CallMode::Deadline(_) => crate::queue::wait(notified, deadline).await?,
        }
    }
}
