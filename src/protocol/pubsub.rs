//! Publish/Subscribe protocols.
//!
//! Pub0 fans every message out to all connected pipes, best effort: a
//! subscriber that cannot keep up loses messages, never slows the
//! publisher. Filtering happens entirely on the subscriber side against an
//! ordered set of byte prefixes; the empty prefix matches everything, and a
//! socket with no subscriptions receives nothing.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{broadcast, ids, queue_recv, CallMode, PipeList, Protocol};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::options::{names, OptionValue};
use crate::pipe::Pipe;
use crate::queue::MsgQueue;
use crate::socket::Socket;

struct PubProto {
    pipes: PipeList,
}

#[async_trait]
impl Protocol for PubProto {
    fn id(&self) -> u16 {
        ids::PUB0
    }

    fn peer_id(&self) -> u16 {
        ids::SUB0
    }

    fn name(&self) -> &'static str {
        "pub"
    }

    fn peer_name(&self) -> &'static str {
        "sub"
    }

    fn pipe_added(&self, pipe: &Pipe) {
        self.pipes.add(pipe);
    }

    fn pipe_removed(&self, pipe: &Pipe) {
        self.pipes.remove(pipe.id());
    }

    async fn deliver(&self, _frame: Vec<u8>, pipe: &Pipe) {
        // Subscribers do not talk back.
        debug!(pipe = pipe.id(), "publisher dropping unexpected inbound message");
    }

    async fn send(&self, body: Vec<u8>, _pipe: Option<Pipe>, _mode: CallMode) -> Result<()> {
        // Best effort to every peer; no peers means the message vanishes.
        broadcast(&self.pipes.snapshot(), &body);
        Ok(())
    }

    async fn recv(&self, _mode: CallMode) -> Result<Message> {
        Err(Error::NotSupported)
    }

    fn close(&self) {}
}

struct SubProto {
    subscriptions: Mutex<Vec<Vec<u8>>>,
    recv_q: MsgQueue<Message>,
    closed: AtomicBool,
}

impl SubProto {
    fn new(recv_buffer: usize) -> Self {
        SubProto {
            subscriptions: Mutex::new(Vec::new()),
            recv_q: MsgQueue::new(recv_buffer),
            closed: AtomicBool::new(false),
        }
    }

    fn matches(&self, body: &[u8]) -> bool {
        self.subscriptions
            .lock()
            .iter()
            .any(|prefix| body.starts_with(prefix))
    }

    fn subscribe(&self, topic: &[u8]) {
        let mut subs = self.subscriptions.lock();
        if !subs.iter().any(|t| t == topic) {
            subs.push(topic.to_vec());
        }
    }

    fn unsubscribe(&self, topic: &[u8]) -> Result<()> {
        let mut subs = self.subscriptions.lock();
        let before = subs.len();
        subs.retain(|t| t != topic);
        if subs.len() == before {
            Err(Error::NoEntry)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Protocol for SubProto {
    fn id(&self) -> u16 {
        ids::SUB0
    }

    fn peer_id(&self) -> u16 {
        ids::PUB0
    }

    fn name(&self) -> &'static str {
        "sub"
    }

    fn peer_name(&self) -> &'static str {
        "pub"
    }

    fn pipe_added(&self, _pipe: &Pipe) {}

    fn pipe_removed(&self, _pipe: &Pipe) {}

    async fn deliver(&self, frame: Vec<u8>, pipe: &Pipe) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if !self.matches(&frame) {
            return;
        }
        let msg = Message::from_wire(Vec::new(), frame, Some(pipe.clone()));
        if self.recv_q.try_push(msg).is_err() {
            debug!(pipe = pipe.id(), "subscriber backlog full, message dropped");
        }
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

    fn set_option(&self, name: &str, value: &OptionValue) -> Result<()> {
        match name {
            names::SUB_SUBSCRIBE => {
                self.subscribe(value.as_bytes()?);
                Ok(())
            }
            names::SUB_UNSUBSCRIBE => self.unsubscribe(value.as_bytes()?),
            _ => Err(Error::NotSupported),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.recv_q.close();
    }
}

/// Publisher socket: send-only broadcast.
pub struct Pub0 {
    socket: Socket,
}

impl Pub0 {
    pub fn open() -> Result<Pub0> {
        let socket = Socket::open(Box::new(PubProto { pipes: PipeList::new() }))?;
        Ok(Pub0 { socket })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl Deref for Pub0 {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

/// Subscriber socket: receive-only, prefix-filtered.
pub struct Sub0 {
    socket: Socket,
}

impl Sub0 {
    pub fn open() -> Result<Sub0> {
        let recv_buffer = crate::defaults::RECV_BUFFER;
        let socket = Socket::open(Box::new(SubProto::new(recv_buffer)))?;
        Ok(Sub0 { socket })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Deliver messages whose body starts with `topic`. Topics are
    /// arbitrary bytes; the empty topic subscribes to everything.
    pub fn subscribe(&self, topic: impl AsRef<[u8]>) -> Result<()> {
        self.socket.set_option(
            names::SUB_SUBSCRIBE,
            OptionValue::Bytes(topic.as_ref().to_vec()),
        )
    }

    /// Remove a previous subscription; `NoEntry` when it never existed.
    pub fn unsubscribe(&self, topic: impl AsRef<[u8]>) -> Result<()> {
        self.socket.set_option(
            names::SUB_UNSUBSCRIBE,
            OptionValue::Bytes(topic.as_ref().to_vec()),
        )
    }
}

impl Deref for Sub0 {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching_rules() {
        let proto = SubProto::new(8);
        assert!(!proto.matches(b"anything"));

        proto.subscribe(b"wolf");
        assert!(proto.matches(b"wolf: big dog"));
        assert!(!proto.matches(b"puppy: cute dog"));

        proto.subscribe(b"");
        assert!(proto.matches(b"puppy: cute dog"));
    }

    #[test]
    fn duplicate_subscriptions_collapse() {
        let proto = SubProto::new(8);
        proto.subscribe(b"a");
        proto.subscribe(b"a");
        assert_eq!(proto.subscriptions.lock().len(), 1);

        proto.unsubscribe(b"a").unwrap();
        assert_eq!(proto.unsubscribe(b"a").unwrap_err(), Error::NoEntry);
    }

    #[test]
    fn subscription_options_take_bytes_or_strings() {
        let proto = SubProto::new(8);
        proto
            .set_option(names::SUB_SUBSCRIBE, &OptionValue::Bytes(vec![0xFF, 0x00]))
            .unwrap();
        assert!(proto.matches(&[0xFF, 0x00, 0x42]));

        proto
            .set_option(names::SUB_SUBSCRIBE, &OptionValue::Str("txt".into()))
            .unwrap();
        assert!(proto.matches(b"txt: hello"));

        assert_eq!(
            proto
                .set_option(names::SUB_SUBSCRIBE, &OptionValue::Int(1))
                .unwrap_err(),
            Error::BadType
        );
    }
}
