//! Contexts: independent request/reply state on a shared socket.
//!
//! A [`Context`] carries its own request id, reply slot and stashed routing
//! header, so N contexts on one Req0 or Rep0 socket can run N exchanges
//! concurrently. Only the Req/Rep family supports them; other protocols
//! answer `NotSupported` from [`Socket::context`](crate::Socket::context).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::message::Message;
use crate::options::OptionValue;
use crate::protocol::{CallMode, ProtocolContext};
use crate::runtime;
use crate::socket::Socket;

/// An independent protocol-state slice multiplexed onto a socket.
pub struct Context {
    socket: Socket,
    ctx: Arc<dyn ProtocolContext>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(socket: Socket, ctx: Arc<dyn ProtocolContext>) -> Self {
        Context { socket, ctx }
    }

    /// The socket this context runs on.
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    fn send_deadline(&self) -> Option<Instant> {
        self.socket.send_timeout().map(|d| Instant::now() + d)
    }

    fn recv_deadline(&self) -> Option<Instant> {
        self.socket.recv_timeout().map(|d| Instant::now() + d)
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        runtime::block_on(self.asend(data))
    }

    pub fn try_send(&self, data: &[u8]) -> Result<()> {
        runtime::block_on(self.ctx.send(data.to_vec(), None, CallMode::NonBlocking))
    }

    pub fn recv(&self) -> Result<Vec<u8>> {
        runtime::block_on(self.arecv())
    }

    pub fn try_recv(&self) -> Result<Vec<u8>> {
        runtime::block_on(async { self.ctx.recv(CallMode::NonBlocking).await?.into_body() })
    }

    pub fn send_msg(&self, msg: &mut Message) -> Result<()> {
        runtime::block_on(self.asend_msg(msg))
    }

    pub fn recv_msg(&self) -> Result<Message> {
        runtime::block_on(self.arecv_msg())
    }

    pub async fn asend(&self, data: &[u8]) -> Result<()> {
        self.ctx
            .send(data.to_vec(), None, CallMode::Deadline(self.send_deadline()))
            .await
    }

    pub async fn arecv(&self) -> Result<Vec<u8>> {
        self.arecv_msg().await?.into_body()
    }

    /// Message send; consumes the message like
    /// [`Socket::asend_msg`](crate::Socket::asend_msg).
    pub async fn asend_msg(&self, msg: &mut Message) -> Result<()> {
        let (body, pipe) = msg.take_for_send()?;
        self.ctx
            .send(body, pipe, CallMode::Deadline(self.send_deadline()))
            .await
    }

    pub async fn arecv_msg(&self) -> Result<Message> {
        self.ctx.recv(CallMode::Deadline(self.recv_deadline())).await
    }

    /// Start an asynchronous receive on this context (AIO surface).
    pub fn start_recv(&self, deadline: Option<Duration>) -> crate::aio::Aio {
        let ctx = self.ctx.clone();
        crate::aio::start(deadline, None, async move {
            ctx.recv(CallMode::Deadline(None)).await.map(Some)
        })
    }

    /// Start an asynchronous send on this context (AIO surface).
    pub fn start_send(
        &self,
        msg: &mut Message,
        deadline: Option<Duration>,
    ) -> Result<crate::aio::Aio> {
        let (body, pipe) = msg.take_for_send()?;
        let ctx = self.ctx.clone();
        Ok(crate::aio::start(deadline, None, async move {
            ctx.send(body, pipe, CallMode::Deadline(None)).await.map(|_| None)
        }))
    }

    /// Context-level options (`req:resend-time` on Req0 contexts).
    pub fn get_option(&self, name: &str) -> Result<OptionValue> {
        self.ctx.get_option(name)
    }

    pub fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        self.ctx.set_option(name, &value)
    }

    /// Abandon this context's pending state.
    pub fn close(&self) {
        self.ctx.close();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.ctx.close();
    }
}
