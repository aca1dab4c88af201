//! Sockets: a protocol state machine plus its pipes and endpoints.
//!
//! The [`Socket`] handle is cheap to clone and thread-safe; all state lives
//! in the shared core. Pipe lifecycle (pre-add, post-add, post-remove) is
//! serialized under a dedicated pipe-notify lock so user callbacks observe a
//! consistent pipe set, and a callback closing the pipe during pre-add
//! vetoes it before it ever joins the socket. Dropping the last handle
//! closes the socket; endpoints and pipes hold only weak back-references.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::aio::Aio;
use crate::context::Context;
use crate::endpoint::{DialMode, Dialer, Listener};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::options::{names, OptionValue, SocketOptions};
use crate::pipe::{self, EndpointKind, Pipe};
use crate::protocol::{CallMode, Protocol};
use crate::runtime;
use crate::transport::Connection;

static NEXT_SOCKET_ID: AtomicU32 = AtomicU32::new(1);

/// A registered pipe-lifecycle callback.
pub type PipeCallback = Arc<dyn Fn(&Pipe) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CbSlot {
    PreAdd,
    PostAdd,
    PostRemove,
}

/// Handle returned by callback registration; pass to
/// [`Socket::remove_pipe_cb`] to unregister.
#[derive(Debug, Clone, Copy)]
pub struct CallbackHandle {
    slot: CbSlot,
    id: u64,
}

#[derive(Default)]
struct CallbackSet {
    next_id: u64,
    pre: Vec<(u64, PipeCallback)>,
    post: Vec<(u64, PipeCallback)>,
    removed: Vec<(u64, PipeCallback)>,
}

impl CallbackSet {
    fn slot_mut(&mut self, slot: CbSlot) -> &mut Vec<(u64, PipeCallback)> {
        match slot {
            CbSlot::PreAdd => &mut self.pre,
            CbSlot::PostAdd => &mut self.post,
            CbSlot::PostRemove => &mut self.removed,
        }
    }
}

pub(crate) struct SocketCore {
    id: u32,
    proto: Box<dyn Protocol>,
    pub(crate) options: SocketOptions,
    pipes: Mutex<Vec<Pipe>>,
    /// Lifecycle lock: every pipe add/remove (and the callbacks it runs)
    /// happens under this, never under an `.await`.
    pipe_notify: Mutex<()>,
    listeners: Mutex<Vec<Listener>>,
    dialers: Mutex<Vec<Dialer>>,
    callbacks: Mutex<CallbackSet>,
    closed: AtomicBool,
}

impl SocketCore {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn proto(&self) -> &dyn Protocol {
        self.proto.as_ref()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Forward an inbound frame to the protocol state machine.
    pub(crate) async fn deliver(&self, frame: Vec<u8>, pipe: &Pipe) {
        if self.ensure_open().is_ok() {
            self.proto.deliver(frame, pipe).await;
        }
    }

    pub(crate) async fn asend_parts(&self, body: Vec<u8>, pipe: Option<Pipe>) -> Result<()> {
        self.ensure_open()?;
        let deadline = self.options.send_timeout().map(|d| Instant::now() + d);
        self.proto.send(body, pipe, CallMode::Deadline(deadline)).await
    }

    pub(crate) async fn send_mode(
        &self,
        body: Vec<u8>,
        pipe: Option<Pipe>,
        mode: CallMode,
    ) -> Result<()> {
        self.ensure_open()?;
        self.proto.send(body, pipe, mode).await
    }

    pub(crate) async fn recv_mode(&self, mode: CallMode) -> Result<Message> {
        self.ensure_open()?;
        self.proto.recv(mode).await
    }

    pub(crate) async fn arecv_msg(&self) -> Result<Message> {
        let deadline = self.options.recv_timeout().map(|d| Instant::now() + d);
        self.recv_mode(CallMode::Deadline(deadline)).await
    }

    /// Bind a fresh connection to this socket as a new pipe.
    ///
    /// Runs the pre-add callbacks first; any of them calling
    /// [`Pipe::close`] vetoes the pipe, which then never reaches post-add
    /// (or post-remove). Otherwise the pipe is indexed, the protocol is
    /// told, post-add callbacks run, and only then does I/O start — so a
    /// delivered message can never reference an unindexed pipe.
    pub(crate) fn add_pipe(
        self: &Arc<Self>,
        conn: Connection,
        endpoint_id: u32,
        kind: EndpointKind,
        recv_max: usize,
    ) -> Result<Pipe> {
        let pipe = Pipe::new(
            self,
            endpoint_id,
            kind,
            conn.local_addr.clone(),
            conn.peer_addr.clone(),
            self.options.send_buffer(),
            recv_max,
        );
        {
            let _lifecycle = self.pipe_notify.lock();
            self.ensure_open()?;
            self.run_callbacks(CbSlot::PreAdd, &pipe);
            if pipe.is_closed() {
                debug!(socket = self.id, pipe = pipe.id(), "pipe vetoed during pre-add");
                return Err(Error::Canceled);
            }
            self.pipes.lock().push(pipe.clone());
            self.proto.pipe_added(&pipe);
            self.run_callbacks(CbSlot::PostAdd, &pipe);
        }
        debug!(
            socket = self.id,
            pipe = pipe.id(),
            peer = %pipe.remote_address(),
            "pipe added"
        );
        pipe::start_io(self, &pipe, conn);
        Ok(pipe)
    }

    /// Evict a pipe. Idempotent; the first caller runs the post-remove
    /// callbacks.
    pub(crate) fn remove_pipe(&self, pipe: &Pipe) {
        let _lifecycle = self.pipe_notify.lock();
        {
            let mut pipes = self.pipes.lock();
            let before = pipes.len();
            pipes.retain(|p| p.id() != pipe.id());
            if pipes.len() == before {
                return;
            }
        }
        pipe.mark_closed();
        self.proto.pipe_removed(pipe);
        self.run_callbacks(CbSlot::PostRemove, pipe);
        debug!(socket = self.id, pipe = pipe.id(), "pipe removed");
    }

    fn run_callbacks(&self, slot: CbSlot, pipe: &Pipe) {
        let snapshot: Vec<PipeCallback> = {
            let mut callbacks = self.callbacks.lock();
            callbacks.slot_mut(slot).iter().map(|(_, f)| f.clone()).collect()
        };
        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(pipe))).is_err() {
                error!(
                    socket = self.id,
                    pipe = pipe.id(),
                    "pipe callback panicked; continuing"
                );
            }
        }
    }

    pub(crate) fn register_listener(&self, listener: Listener) {
        self.listeners.lock().push(listener);
    }

    pub(crate) fn register_dialer(&self, dialer: Dialer) {
        self.dialers.lock().push(dialer);
    }

    pub(crate) fn unregister_listener(&self, id: u32) {
        self.listeners.lock().retain(|l| l.id() != id);
    }

    pub(crate) fn unregister_dialer(&self, id: u32) {
        self.dialers.lock().retain(|d| d.id() != id);
    }

    fn close_ref(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(socket = self.id, "closing socket");

        // Endpoints first: nothing new may arrive while pipes drain.
        let listeners: Vec<Listener> = self.listeners.lock().drain(..).collect();
        for listener in listeners {
            listener.close_detached();
        }
        let dialers: Vec<Dialer> = self.dialers.lock().drain(..).collect();
        for dialer in dialers {
            dialer.close_detached();
        }

        {
            let _lifecycle = self.pipe_notify.lock();
            let pipes: Vec<Pipe> = self.pipes.lock().drain(..).collect();
            for pipe in pipes {
                pipe.mark_closed();
                self.proto.pipe_removed(&pipe);
                self.run_callbacks(CbSlot::PostRemove, &pipe);
            }
        }

        self.proto.close();
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        self.close_ref();
    }
}

/// A scalability-protocols socket.
///
/// Obtained from a protocol constructor ([`Pair0::open`](crate::Pair0) and
/// friends); the typed wrappers deref to this shared API.
#[derive(Clone)]
pub struct Socket {
    core: Arc<SocketCore>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.core.id)
            .field("protocol", &self.core.proto.name())
            .field("pipes", &self.core.pipes.lock().len())
            .finish()
    }
}

impl Socket {
    pub(crate) fn open(proto: Box<dyn Protocol>) -> Result<Socket> {
        if runtime::is_shutdown() {
            return Err(Error::Closed);
        }
        let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
        let core = Arc::new(SocketCore {
            id,
            proto,
            options: SocketOptions::new(id),
            pipes: Mutex::new(Vec::new()),
            pipe_notify: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            dialers: Mutex::new(Vec::new()),
            callbacks: Mutex::new(CallbackSet::default()),
            closed: AtomicBool::new(false),
        });
        debug!(socket = id, protocol = core.proto.name(), "socket opened");
        Ok(Socket { core })
    }

    pub(crate) fn core(&self) -> &Arc<SocketCore> {
        &self.core
    }

    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// Listen at `url`; the address is bound before this returns.
    pub async fn listen(&self, url: &str) -> Result<Listener> {
        self.core.ensure_open()?;
        Listener::start(&self.core, url).await
    }

    /// Synchronous form of [`Socket::listen`].
    pub fn listen_sync(&self, url: &str) -> Result<Listener> {
        runtime::block_on(self.listen(url))
    }

    /// Dial `url` with the default policy: one synchronous attempt, then
    /// (on failure) background retries with exponential backoff.
    pub async fn dial(&self, url: &str) -> Result<Dialer> {
        self.core.ensure_open()?;
        Dialer::start(&self.core, url, DialMode::Default).await
    }

    /// Dial and fail immediately when the first attempt fails.
    pub async fn dial_blocking(&self, url: &str) -> Result<Dialer> {
        self.core.ensure_open()?;
        Dialer::start(&self.core, url, DialMode::Block).await
    }

    /// Start dialing in the background; never fails on connection errors.
    pub async fn dial_nonblocking(&self, url: &str) -> Result<Dialer> {
        self.core.ensure_open()?;
        Dialer::start(&self.core, url, DialMode::NonBlock).await
    }

    /// Synchronous form of [`Socket::dial`].
    pub fn dial_sync(&self, url: &str) -> Result<Dialer> {
        runtime::block_on(self.dial(url))
    }

    /// Send `data`, blocking until queued (honors `send-timeout`).
    pub fn send(&self, data: &[u8]) -> Result<()> {
        runtime::block_on(self.asend(data))
    }

    /// Non-blocking send; `TryAgain` when the protocol cannot take the
    /// message right now.
    pub fn try_send(&self, data: &[u8]) -> Result<()> {
        runtime::block_on(self.core.send_mode(data.to_vec(), None, CallMode::NonBlocking))
    }

    /// Receive the next message body, blocking (honors `recv-timeout`).
    pub fn recv(&self) -> Result<Vec<u8>> {
        runtime::block_on(self.arecv())
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<Vec<u8>> {
        runtime::block_on(async {
            self.core.recv_mode(CallMode::NonBlocking).await?.into_body()
        })
    }

    pub fn send_msg(&self, msg: &mut Message) -> Result<()> {
        runtime::block_on(self.asend_msg(msg))
    }

    pub fn recv_msg(&self) -> Result<Message> {
        runtime::block_on(self.arecv_msg())
    }

    /// Async send.
    pub async fn asend(&self, data: &[u8]) -> Result<()> {
        self.core.asend_parts(data.to_vec(), None).await
    }

    /// Async receive.
    pub async fn arecv(&self) -> Result<Vec<u8>> {
        self.core.arecv_msg().await?.into_body()
    }

    /// Async message send. The message is consumed: whatever the outcome,
    /// later operations on it fail with `AlreadySent` (clone first to
    /// retry).
    pub async fn asend_msg(&self, msg: &mut Message) -> Result<()> {
        let (body, pipe) = msg.take_for_send()?;
        self.core.asend_parts(body, pipe).await
    }

    /// Async message receive. The returned message carries the originating
    /// pipe when the transport reported a valid one.
    pub async fn arecv_msg(&self) -> Result<Message> {
        self.core.arecv_msg().await
    }

    /// Start an asynchronous receive operation (AIO surface).
    pub fn start_recv(&self, deadline: Option<Duration>) -> Aio {
        let core = self.core.clone();
        crate::aio::start(deadline, None, async move {
            core.recv_mode(CallMode::Deadline(None)).await.map(Some)
        })
    }

    /// Like [`Socket::start_recv`], waking `callback` on completion.
    pub fn start_recv_with_callback(
        &self,
        deadline: Option<Duration>,
        callback: impl FnOnce() + Send + 'static,
    ) -> Aio {
        let core = self.core.clone();
        crate::aio::start(deadline, Some(Box::new(callback)), async move {
            core.recv_mode(CallMode::Deadline(None)).await.map(Some)
        })
    }

    /// Start an asynchronous send operation (AIO surface). The message is
    /// consumed immediately.
    pub fn start_send(&self, msg: &mut Message, deadline: Option<Duration>) -> Result<Aio> {
        let (body, pipe) = msg.take_for_send()?;
        let core = self.core.clone();
        Ok(crate::aio::start(deadline, None, async move {
            core.send_mode(body, pipe, CallMode::Deadline(None)).await.map(|_| None)
        }))
    }

    /// Like [`Socket::start_send`], waking `callback` on completion.
    pub fn start_send_with_callback(
        &self,
        msg: &mut Message,
        deadline: Option<Duration>,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<Aio> {
        let (body, pipe) = msg.take_for_send()?;
        let core = self.core.clone();
        Ok(crate::aio::start(deadline, Some(Box::new(callback)), async move {
            core.send_mode(body, pipe, CallMode::Deadline(None)).await.map(|_| None)
        }))
    }

    /// Open an independent request/reply context (Req0/Rep0 only).
    pub fn context(&self) -> Result<Context> {
        self.core.ensure_open()?;
        if !self.core.proto.supports_context() {
            return Err(Error::NotSupported);
        }
        let ctx = self.core.proto.open_context()?;
        Ok(Context::new(self.clone(), ctx))
    }

    pub fn get_option(&self, name: &str) -> Result<OptionValue> {
        match name {
            names::PROTOCOL => Ok(OptionValue::Int(self.core.proto.id() as i32)),
            names::PROTOCOL_NAME => Ok(OptionValue::Str(self.core.proto.name().to_owned())),
            names::PEER => Ok(OptionValue::Int(self.core.proto.peer_id() as i32)),
            names::PEER_NAME => Ok(OptionValue::Str(self.core.proto.peer_name().to_owned())),
            _ if name.contains(':') => self.core.proto.get_option(name),
            _ => self.core.options.get(name),
        }
    }

    pub fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        match name {
            names::PROTOCOL | names::PROTOCOL_NAME | names::PEER | names::PEER_NAME => {
                Err(Error::ReadOnly)
            }
            names::RECV_BUFFER => {
                self.core.options.set(name, &value)?;
                self.core.proto.resize_recv_buffer(self.core.options.recv_buffer());
                Ok(())
            }
            names::SEND_BUFFER => {
                self.core.options.set(name, &value)?;
                let capacity = self.core.options.send_buffer();
                for pipe in self.core.pipes.lock().iter() {
                    pipe.set_send_capacity(capacity);
                }
                Ok(())
            }
            _ if name.contains(':') => self.core.proto.set_option(name, &value),
            _ => self.core.options.set(name, &value),
        }
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.set_option(names::RECV_TIMEOUT, OptionValue::Ms(duration_to_ms(timeout)))
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        self.core.options.recv_timeout()
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.set_option(names::SEND_TIMEOUT, OptionValue::Ms(duration_to_ms(timeout)))
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.core.options.send_timeout()
    }

    /// Free-form socket name, defaults to the socket id.
    pub fn name(&self) -> String {
        self.core.options.socket_name()
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.set_option(names::SOCKET_NAME, OptionValue::Str(name.to_owned()))
    }

    /// Live pipes, in the order they were added.
    pub fn pipes(&self) -> Vec<Pipe> {
        self.core.pipes.lock().clone()
    }

    pub fn listeners(&self) -> Vec<Listener> {
        self.core.listeners.lock().clone()
    }

    pub fn dialers(&self) -> Vec<Dialer> {
        self.core.dialers.lock().clone()
    }

    /// Register a callback invoked before a new pipe joins the socket.
    /// Closing the pipe inside the callback rejects the connection.
    pub fn add_pre_pipe_connect_cb(
        &self,
        callback: impl Fn(&Pipe) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.add_cb(CbSlot::PreAdd, Arc::new(callback))
    }

    /// Register a callback invoked after a pipe joined the socket.
    pub fn add_post_pipe_connect_cb(
        &self,
        callback: impl Fn(&Pipe) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.add_cb(CbSlot::PostAdd, Arc::new(callback))
    }

    /// Register a callback invoked after a pipe was evicted.
    pub fn add_post_pipe_remove_cb(
        &self,
        callback: impl Fn(&Pipe) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.add_cb(CbSlot::PostRemove, Arc::new(callback))
    }

    fn add_cb(&self, slot: CbSlot, callback: PipeCallback) -> CallbackHandle {
        let mut callbacks = self.core.callbacks.lock();
        callbacks.next_id += 1;
        let id = callbacks.next_id;
        callbacks.slot_mut(slot).push((id, callback));
        CallbackHandle { slot, id }
    }

    /// Unregister a previously added pipe callback.
    pub fn remove_pipe_cb(&self, handle: CallbackHandle) {
        let mut callbacks = self.core.callbacks.lock();
        callbacks
            .slot_mut(handle.slot)
            .retain(|(id, _)| *id != handle.id);
    }

    /// Close the socket: endpoints stop, pipes drain with their
    /// post-remove callbacks, blocked callers wake with `Closed`.
    pub fn close(&self) {
        self.core.close_ref();
    }
}

fn duration_to_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
    }
}
