//! Request/Reply protocols.
//!
//! Every request gets a 32-bit id with the high bit set, drawn from a
//! randomly seeded monotonic counter. The id travels as a 4-byte big-endian
//! header word; forwarders may stack further words in front, so a replier
//! strips words until it hits the first one with the high bit set and sends
//! that whole stack back in front of its reply.
//!
//! A requester that hears nothing for `req:resend-time` re-issues the
//! request on a different pipe. Contexts give each in-flight exchange its
//! own id and reply slot, so one socket can serve many concurrent
//! request/reply conversations.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{
    frame_with_header, ids, peek_u32_be, queue_recv, send_round_robin, CallMode, PipeList,
    Protocol, ProtocolContext, RoundRobin,
};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::options::{ms_to_duration, names, OptionValue};
use crate::pipe::Pipe;
use crate::queue::MsgQueue;
use crate::runtime;
use crate::socket::Socket;

const REQUEST_ID_FLAG: u32 = 0x8000_0000;

/// Default resend interval, milliseconds.
const DEFAULT_RESEND_MS: i32 = 60_000;

struct ReqShared {
    pipes: PipeList,
    rr: RoundRobin,
    next_id: AtomicU32,
    resend_ms: Mutex<i32>,
    /// Outstanding request id → the context waiting for its reply.
    pending: Mutex<HashMap<u32, Arc<ReqCtxState>>>,
    closed: AtomicBool,
}

impl ReqShared {
    fn next_request_id(&self) -> u32 {
        (self.next_id.fetch_add(1, Ordering::Relaxed) & !REQUEST_ID_FLAG) | REQUEST_ID_FLAG
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct Outstanding {
    id: u32,
    timer: Option<JoinHandle<()>>,
}

struct ReqCtxState {
    replies: MsgQueue<Message>,
    outstanding: Mutex<Option<Outstanding>>,
    /// Per-context override of the socket's resend time.
    resend_ms: Mutex<Option<i32>>,
}

impl ReqCtxState {
    fn new() -> Arc<Self> {
        Arc::new(ReqCtxState {
            replies: MsgQueue::new(1),
            outstanding: Mutex::new(None),
            resend_ms: Mutex::new(None),
        })
    }
}

struct ReqCtx {
    shared: Arc<ReqShared>,
    state: Arc<ReqCtxState>,
}

impl ReqCtx {
    fn resend_interval(&self) -> Option<Duration> {
        let ms = self
            .state
            .resend_ms
            .lock()
            .unwrap_or_else(|| *self.shared.resend_ms.lock());
        ms_to_duration(ms).filter(|d| !d.is_zero())
    }

    fn abandon(&self) {
        if let Some(mut old) = self.state.outstanding.lock().take() {
            self.shared.pending.lock().remove(&old.id);
            if let Some(timer) = old.timer.take() {
                timer.abort();
            }
        }
    }
}

#[async_trait]
impl ProtocolContext for ReqCtx {
    async fn send(&self, body: Vec<u8>, _pipe: Option<Pipe>, mode: CallMode) -> Result<()> {
        if self.shared.is_closed() {
            return Err(Error::Closed);
        }
        // A new request abandons the previous one; late replies to the old
        // id will no longer match anything and get dropped.
        self.abandon();
        self.state.replies.clear();

        let id = self.shared.next_request_id();
        let frame = frame_with_header(&id.to_be_bytes(), &body);
        self.shared.pending.lock().insert(id, self.state.clone());

        let pipe = match send_round_robin(
            &self.shared.pipes,
            &self.shared.rr,
            frame.clone(),
            mode,
            None,
            &self.shared.closed,
        )
        .await
        {
            Ok(pipe) => pipe,
            Err(e) => {
                self.shared.pending.lock().remove(&id);
                return Err(e);
            }
        };

        let timer = self.resend_interval().map(|interval| {
            runtime::spawn(resend_loop(
                self.shared.clone(),
                id,
                frame,
                pipe.id(),
                interval,
            ))
        });
        *self.state.outstanding.lock() = Some(Outstanding { id, timer });
        Ok(())
    }

    async fn recv(&self, mode: CallMode) -> Result<Message> {
        if self.shared.is_closed() {
            return Err(Error::Closed);
        }
        {
            let outstanding = self.state.outstanding.lock();
            if outstanding.is_none() && self.state.replies.len() == 0 {
                return Err(Error::BadState);
            }
        }
        let msg = queue_recv(&self.state.replies, mode).await?;
        // Exchange complete; the next recv without a send is a state error.
        self.abandon();
        Ok(msg)
    }

    fn set_option(&self, name: &str, value: &OptionValue) -> Result<()> {
        match name {
            names::REQ_RESEND_TIME => {
                let ms = value.as_ms()?;
                if ms < -1 {
                    return Err(Error::InvalidOperation);
                }
                *self.state.resend_ms.lock() = Some(ms);
                Ok(())
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn get_option(&self, name: &str) -> Result<OptionValue> {
        match name {
            names::REQ_RESEND_TIME => {
                let ms = self
                    .state
                    .resend_ms
                    .lock()
                    .unwrap_or_else(|| *self.shared.resend_ms.lock());
                Ok(OptionValue::Ms(ms))
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn close(&self) {
        self.abandon();
        self.state.replies.close();
    }
}

/// Re-issue an unanswered request, preferring a pipe other than the one it
/// last went out on. Stops as soon as the id leaves the pending table.
async fn resend_loop(
    shared: Arc<ReqShared>,
    id: u32,
    frame: Vec<u8>,
    mut last_pipe: u32,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        if shared.is_closed() || !shared.pending.lock().contains_key(&id) {
            return;
        }
        debug!(request = id, "no reply yet; resending on another pipe");
        match send_round_robin(
            &shared.pipes,
            &shared.rr,
            frame.clone(),
            CallMode::NonBlocking,
            Some(last_pipe),
            &shared.closed,
        )
        .await
        {
            Ok(pipe) => last_pipe = pipe.id(),
            // Nothing writable right now; try again next interval.
            Err(_) => {}
        }
    }
}

struct ReqProto {
    shared: Arc<ReqShared>,
    default_ctx: ReqCtx,
}

impl ReqProto {
    fn new() -> Self {
        let shared = Arc::new(ReqShared {
            pipes: PipeList::new(),
            rr: RoundRobin::new(),
            next_id: AtomicU32::new(rand::thread_rng().gen()),
            resend_ms: Mutex::new(DEFAULT_RESEND_MS),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let default_ctx = ReqCtx {
            shared: shared.clone(),
            state: ReqCtxState::new(),
        };
        ReqProto {
            shared,
            default_ctx,
        }
    }
}

#[async_trait]
impl Protocol for ReqProto {
    fn id(&self) -> u16 {
        ids::REQ0
    }

    fn peer_id(&self) -> u16 {
        ids::REP0
    }

    fn name(&self) -> &'static str {
        "req"
    }

    fn peer_name(&self) -> &'static str {
        "rep"
    }

    fn supports_context(&self) -> bool {
        true
    }

    fn open_context(&self) -> Result<Arc<dyn ProtocolContext>> {
        if self.shared.is_closed() {
            return Err(Error::Closed);
        }
        Ok(Arc::new(ReqCtx {
            shared: self.shared.clone(),
            state: ReqCtxState::new(),
        }))
    }

    fn pipe_added(&self, pipe: &Pipe) {
        self.shared.pipes.add(pipe);
    }

    fn pipe_removed(&self, pipe: &Pipe) {
        self.shared.pipes.remove(pipe.id());
    }

    async fn deliver(&self, frame: Vec<u8>, pipe: &Pipe) {
        let Some(id) = peek_u32_be(&frame) else {
            debug!(pipe = pipe.id(), "dropping runt reply");
            return;
        };
        let body = frame[4..].to_vec();
        let target = self.shared.pending.lock().remove(&id);
        match target {
            Some(ctx) => {
                let msg = Message::from_wire(id.to_be_bytes().to_vec(), body, Some(pipe.clone()));
                if ctx.replies.try_push(msg).is_err() {
                    debug!(request = id, "reply slot unavailable; dropping");
                }
            }
            None => debug!(request = id, "dropping stale or unmatched reply"),
        }
    }

    async fn send(&self, body: Vec<u8>, pipe: Option<Pipe>, mode: CallMode) -> Result<()> {
        self.default_ctx.send(body, pipe, mode).await
    }

    async fn recv(&self, mode: CallMode) -> Result<Message> {
        self.default_ctx.recv(mode).await
    }

    fn set_option(&self, name: &str, value: &OptionValue) -> Result<()> {
        match name {
            names::REQ_RESEND_TIME => {
                let ms = value.as_ms()?;
                if ms < -1 {
                    return Err(Error::InvalidOperation);
                }
                *self.shared.resend_ms.lock() = ms;
                Ok(())
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn get_option(&self, name: &str) -> Result<OptionValue> {
        match name {
            names::REQ_RESEND_TIME => Ok(OptionValue::Ms(*self.shared.resend_ms.lock())),
            _ => Err(Error::NotSupported),
        }
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.default_ctx.close();
        let pending: Vec<_> = self.shared.pending.lock().drain().collect();
        for (_, ctx) in pending {
            ctx.replies.close();
        }
        self.shared.pipes.ready.notify_waiters();
    }
}

struct RepShared {
    /// Incoming requests: routing header (ending in the request id) plus
    /// the body message, shared by every context on the socket.
    requests: MsgQueue<(Vec<u8>, Message)>,
    closed: AtomicBool,
}

struct RepCtxState {
    stash: Mutex<Option<(Vec<u8>, Pipe)>>,
}

struct RepCtx {
    shared: Arc<RepShared>,
    state: Arc<RepCtxState>,
}

#[async_trait]
impl ProtocolContext for RepCtx {
    async fn send(&self, body: Vec<u8>, _pipe: Option<Pipe>, mode: CallMode) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let (header, pipe) = self.state.stash.lock().take().ok_or(Error::BadState)?;
        if pipe.is_closed() {
            // The requester is gone; the reply is undeliverable, best effort.
            debug!(pipe = pipe.id(), "request peer vanished; reply dropped");
            return Ok(());
        }
        let frame = frame_with_header(&header, &body);
        let outcome = match mode {
            CallMode::NonBlocking => pipe.try_queue_frame(frame).map_err(|_| Error::TryAgain),
            CallMode::Deadline(deadline) => pipe.queue_frame(frame, deadline).await,
        };
        if outcome.is_err() {
            // Leave the exchange replyable.
            *self.state.stash.lock() = Some((header, pipe));
        }
        outcome
    }

    async fn recv(&self, mode: CallMode) -> Result<Message> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let (header, msg) = match mode {
            CallMode::NonBlocking => self.shared.requests.try_pop()?.ok_or(Error::TryAgain)?,
            CallMode::Deadline(deadline) => self.shared.requests.pop(deadline).await?,
        };
        let pipe = msg.pipe().cloned().ok_or(Error::Internal)?;
        *self.state.stash.lock() = Some((header, pipe));
        Ok(msg)
    }

    fn close(&self) {
        self.state.stash.lock().take();
    }
}

struct RepProto {
    shared: Arc<RepShared>,
    default_ctx: RepCtx,
}

impl RepProto {
    fn new(recv_buffer: usize) -> Self {
        let shared = Arc::new(RepShared {
            requests: MsgQueue::new(recv_buffer),
            closed: AtomicBool::new(false),
        });
        let default_ctx = RepCtx {
            shared: shared.clone(),
            state: Arc::new(RepCtxState {
                stash: Mutex::new(None),
            }),
        };
        RepProto {
            shared,
            default_ctx,
        }
    }
}

/// Split a request frame into its routing header (everything up to and
/// including the first high-bit word) and the body.
fn split_backtrace(frame: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut idx = 0;
    loop {
        let word = peek_u32_be(frame.get(idx..)?)?;
        idx += 4;
        if word & REQUEST_ID_FLAG != 0 {
            return Some((frame[..idx].to_vec(), frame[idx..].to_vec()));
        }
    }
}

#[async_trait]
impl Protocol for RepProto {
    fn id(&self) -> u16 {
        ids::REP0
    }

    fn peer_id(&self) -> u16 {
        ids::REQ0
    }

    fn name(&self) -> &'static str {
        "rep"
    }

    fn peer_name(&self) -> &'static str {
        "req"
    }

    fn supports_context(&self) -> bool {
        true
    }

    fn open_context(&self) -> Result<Arc<dyn ProtocolContext>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(Arc::new(RepCtx {
            shared: self.shared.clone(),
            state: Arc::new(RepCtxState {
                stash: Mutex::new(None),
            }),
        }))
    }

    fn pipe_added(&self, _pipe: &Pipe) {}

    fn pipe_removed(&self, _pipe: &Pipe) {}

    async fn deliver(&self, frame: Vec<u8>, pipe: &Pipe) {
        let Some((header, body)) = split_backtrace(&frame) else {
            debug!(pipe = pipe.id(), "dropping request with malformed routing header");
            return;
        };
        let msg = Message::from_wire(Vec::new(), body, Some(pipe.clone()));
        let _ = self.shared.requests.push((header, msg), None).await;
    }

    async fn send(&self, body: Vec<u8>, pipe: Option<Pipe>, mode: CallMode) -> Result<()> {
        self.default_ctx.send(body, pipe, mode).await
    }

    async fn recv(&self, mode: CallMode) -> Result<Message> {
        self.default_ctx.recv(mode).await
    }

    fn resize_recv_buffer(&self, capacity: usize) {
        self.shared.requests.set_capacity(capacity);
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.requests.close();
        self.default_ctx.close();
    }
}

/// Requester socket: stateful client with automatic retry.
pub struct Req0 {
    socket: Socket,
}

impl Req0 {
    pub fn open() -> Result<Req0> {
        let socket = Socket::open(Box::new(ReqProto::new()))?;
        Ok(Req0 { socket })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// How long to wait for a reply before resending; `None` disables
    /// retries.
    pub fn set_resend_time(&self, interval: Option<Duration>) -> Result<()> {
        let ms = match interval {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };
        self.socket
            .set_option(names::REQ_RESEND_TIME, OptionValue::Ms(ms))
    }
}

impl Deref for Req0 {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

/// Replier socket: stateful server.
pub struct Rep0 {
    socket: Socket,
}

impl Rep0 {
    pub fn open() -> Result<Rep0> {
        let recv_buffer = crate::defaults::RECV_BUFFER;
        let socket = Socket::open(Box::new(RepProto::new(recv_buffer)))?;
        Ok(Rep0 { socket })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl Deref for Rep0 {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_carry_the_high_bit_and_increase() {
        let proto = ReqProto::new();
        let a = proto.shared.next_request_id();
        let b = proto.shared.next_request_id();
        assert_ne!(a, b);
        assert!(a & REQUEST_ID_FLAG != 0);
        assert!(b & REQUEST_ID_FLAG != 0);
    }

    #[test]
    fn backtrace_splitting() {
        // One forwarding word, then the request id, then the body.
        let mut frame = Vec::new();
        frame.extend_from_slice(&0x0000_0007u32.to_be_bytes());
        frame.extend_from_slice(&0x8000_0001u32.to_be_bytes());
        frame.extend_from_slice(b"payload");
        let (header, body) = split_backtrace(&frame).unwrap();
        assert_eq!(header.len(), 8);
        assert_eq!(body, b"payload");

        // No terminator at all: malformed.
        let runt = 7u32.to_be_bytes();
        assert!(split_backtrace(&runt).is_none());
    }
}
