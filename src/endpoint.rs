//! Endpoints: listeners (passive) and dialers (active, with reconnect).
//!
//! A listener binds immediately and runs an accept loop on the library
//! runtime, handing each negotiated connection to the socket as a pipe. A
//! dialer keeps exactly one connection alive: when its pipe dies it waits
//! out an exponential backoff (`reconnect-time-min` doubling up to
//! `reconnect-time-max`) and connects again, resetting the delay after
//! every success.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::options::{names, EndpointOptions, OptionValue};
use crate::pipe::{self, EndpointKind, Pipe};
use crate::runtime;
use crate::sockaddr::SockAddr;
use crate::socket::SocketCore;
use crate::tls::TlsMode;
use crate::transport::{self, Acceptor, Connection, Connector};

static NEXT_ENDPOINT_ID: AtomicU32 = AtomicU32::new(1);

/// Pause after a transient accept failure, so a broken listener cannot
/// spin the worker pool.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

fn next_endpoint_id() -> u32 {
    NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed)
}

struct ListenerInner {
    id: u32,
    url: String,
    socket: Weak<SocketCore>,
    options: EndpointOptions,
    local_addr: SockAddr,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl ListenerInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.closed_notify.notify_waiters();
        }
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// A passive endpoint accepting connections for its socket.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Listener {
    pub(crate) async fn start(core: &Arc<SocketCore>, url: &str) -> Result<Listener> {
        let options = EndpointOptions::new(core.options.endpoint_snapshot(), false);
        let config = options.transport_config(TlsMode::Server)?;
        let acceptor = transport::bind(url, &config).await?;

        let inner = Arc::new(ListenerInner {
            id: next_endpoint_id(),
            url: url.to_owned(),
            socket: Arc::downgrade(core),
            options,
            local_addr: acceptor.local_addr(),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        });
        let listener = Listener { inner: inner.clone() };
        core.register_listener(listener.clone());
        debug!(url, listener = inner.id, "listener started");

        runtime::spawn(accept_loop(inner, acceptor));
        Ok(listener)
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// The address actually bound, e.g. with the ephemeral port filled in.
    pub fn local_address(&self) -> SockAddr {
        self.inner.local_addr.clone()
    }

    pub fn get_option(&self, name: &str) -> Result<OptionValue> {
        match name {
            names::URL => Ok(OptionValue::Str(self.inner.url.clone())),
            names::LOCAL_ADDRESS => Ok(OptionValue::Addr(self.local_address())),
            _ => self.inner.options.get(name),
        }
    }

    pub fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        self.inner.options.set(name, &value)
    }

    /// Stop accepting and release the address.
    pub fn close(&self) {
        self.close_detached();
        if let Some(core) = self.inner.socket.upgrade() {
            core.unregister_listener(self.inner.id);
        }
    }

    pub(crate) fn close_detached(&self) {
        self.inner.mark_closed();
    }
}

async fn accept_loop(inner: Arc<ListenerInner>, mut acceptor: Box<dyn Acceptor>) {
    loop {
        if inner.is_closed() {
            break;
        }
        let config = match inner.options.transport_config(TlsMode::Server) {
            Ok(config) => config,
            Err(e) => {
                warn!(url = %inner.url, "listener misconfigured: {e}");
                break;
            }
        };
        tokio::select! {
            biased;
            _ = inner.wait_closed() => break,
            accepted = acceptor.accept(&config) => match accepted {
                Ok(conn) => {
                    // Negotiation can stall; never block the accept loop on it.
                    let inner = inner.clone();
                    runtime::spawn(async move { setup_pipe(inner, conn).await });
                }
                Err(Error::Closed) => break,
                Err(e) => {
                    warn!(url = %inner.url, "accept failed: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }
    acceptor.close();
    debug!(url = %inner.url, listener = inner.id, "listener stopped");
}

async fn setup_pipe(inner: Arc<ListenerInner>, mut conn: Connection) {
    let Some(core) = inner.socket.upgrade() else {
        return;
    };
    let (self_id, peer_id) = (core.proto().id(), core.proto().peer_id());
    match pipe::negotiate(&mut conn, self_id, peer_id).await {
        Ok(()) => {
            if let Err(e) = core.add_pipe(
                conn,
                inner.id,
                EndpointKind::Listener,
                inner.options.recv_max_size(),
            ) {
                debug!(url = %inner.url, "inbound pipe not added: {e}");
            }
        }
        Err(e) => debug!(url = %inner.url, "inbound negotiation failed: {e}"),
    }
}

/// Dialer connection policy for the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DialMode {
    /// Synchronous first attempt, then background retries on failure.
    Default,
    /// Synchronous first attempt; failure is returned to the caller.
    Block,
    /// Background from the start; connection errors are never surfaced.
    NonBlock,
}

/// Observable dialer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialerState {
    Idle,
    Connecting,
    Connected,
    Waiting,
    Closed,
}

struct DialerInner {
    id: u32,
    url: String,
    socket: Weak<SocketCore>,
    options: EndpointOptions,
    state: Mutex<DialerState>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl DialerInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.closed_notify.notify_waiters();
            *self.state.lock() = DialerState::Closed;
        }
    }

    fn set_state(&self, state: DialerState) {
        let mut current = self.state.lock();
        if *current != DialerState::Closed {
            *current = state;
        }
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// An active endpoint that initiates, and re-initiates, connections.
#[derive(Clone)]
pub struct Dialer {
    inner: Arc<DialerInner>,
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}

impl Dialer {
    pub(crate) async fn start(
        core: &Arc<SocketCore>,
        url: &str,
        mode: DialMode,
    ) -> Result<Dialer> {
        let connector = transport::connector(url)?;
        let options = EndpointOptions::new(core.options.endpoint_snapshot(), true);
        let inner = Arc::new(DialerInner {
            id: next_endpoint_id(),
            url: url.to_owned(),
            socket: Arc::downgrade(core),
            options,
            state: Mutex::new(DialerState::Idle),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        });
        let dialer = Dialer { inner: inner.clone() };

        let initial = match mode {
            DialMode::Block => Some(attempt(&inner, core, connector.as_ref()).await?),
            DialMode::NonBlock => None,
            DialMode::Default => match attempt(&inner, core, connector.as_ref()).await {
                Ok(pipe) => Some(pipe),
                Err(e) => {
                    warn!(url, "synchronous dial failed ({e}); retrying in the background");
                    None
                }
            },
        };

        core.register_dialer(dialer.clone());
        debug!(url, dialer = inner.id, "dialer started");
        runtime::spawn(maintain(inner, connector, initial));
        Ok(dialer)
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> DialerState {
        *self.inner.state.lock()
    }

    pub fn get_option(&self, name: &str) -> Result<OptionValue> {
        match name {
            names::URL => Ok(OptionValue::Str(self.inner.url.clone())),
            _ => self.inner.options.get(name),
        }
    }

    pub fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        self.inner.options.set(name, &value)
    }

    /// Stop redialing. An established pipe is closed by the maintenance
    /// task as part of shutdown.
    pub fn close(&self) {
        self.close_detached();
        if let Some(core) = self.inner.socket.upgrade() {
            core.unregister_dialer(self.inner.id);
        }
    }

    pub(crate) fn close_detached(&self) {
        self.inner.mark_closed();
    }
}

async fn attempt(
    inner: &Arc<DialerInner>,
    core: &Arc<SocketCore>,
    connector: &dyn Connector,
) -> Result<Pipe> {
    inner.set_state(DialerState::Connecting);
    let config = inner.options.transport_config(TlsMode::Client)?;
    let mut conn = connector.connect(&config).await?;
    pipe::negotiate(&mut conn, core.proto().id(), core.proto().peer_id()).await?;
    let pipe = core.add_pipe(
        conn,
        inner.id,
        EndpointKind::Dialer,
        inner.options.recv_max_size(),
    )?;
    inner.set_state(DialerState::Connected);
    Ok(pipe)
}

/// Keep one connection alive for the lifetime of the dialer.
async fn maintain(inner: Arc<DialerInner>, connector: Box<dyn Connector>, initial: Option<Pipe>) {
    let mut current = initial;
    let (mut delay, _) = inner.options.reconnect_bounds();
    loop {
        if inner.is_closed() {
            break;
        }

        let pipe = match current.take() {
            Some(pipe) => Some(pipe),
            None => {
                let outcome = {
                    let Some(core) = inner.socket.upgrade() else { break };
                    tokio::select! {
                        biased;
                        _ = inner.wait_closed() => break,
                        outcome = attempt(&inner, &core, connector.as_ref()) => outcome,
                    }
                };
                match outcome {
                    Ok(pipe) => Some(pipe),
                    Err(e) => {
                        debug!(url = %inner.url, "dial failed: {e}; next attempt in {delay:?}");
                        None
                    }
                }
            }
        };

        if let Some(pipe) = pipe {
            // Connected: backoff resets, then wait for the pipe to die.
            let (min, _) = inner.options.reconnect_bounds();
            delay = min;
            tokio::select! {
                biased;
                _ = inner.wait_closed() => {
                    pipe.close();
                    break;
                }
                _ = pipe.wait_closed() => {
                    debug!(url = %inner.url, "pipe lost; reconnect in {delay:?}");
                }
            }
        }

        inner.set_state(DialerState::Waiting);
        tokio::select! {
            biased;
            _ = inner.wait_closed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        let (min, max) = inner.options.reconnect_bounds();
        delay = match max {
            Some(cap) => (delay * 2).min(cap),
            None => min,
        };
    }
    inner.mark_closed();
    debug!(url = %inner.url, dialer = inner.id, "dialer stopped");
}
