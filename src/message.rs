//! The message object carried between sockets.
//!
//! A [`Message`] has two separately addressable regions: a short *header*
//! used by the protocol state machines for routing ids, and the *body* the
//! application cares about. Both regions are `Arc`-backed so that cloning a
//! message is cheap; mutating a shared region copies it first.
//!
//! Sending consumes the payload: after a successful `send_msg` every further
//! operation on the same `Message` value fails with
//! [`Error::AlreadySent`](crate::Error::AlreadySent). Clone the message
//! before sending if the bytes are still needed.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pipe::Pipe;

/// Suggested minimum capacity of the header region. Protocol headers in this
/// crate are 4-byte words; routing stacks stay well under this.
pub const HEADER_CAPACITY: usize = 32;

/// A routable message with a header region, a body region and an optional
/// pipe affinity.
#[derive(Debug, Clone)]
pub struct Message {
    header: Arc<Vec<u8>>,
    body: Arc<Vec<u8>>,
    pipe: Option<Pipe>,
    sent: bool,
}

impl Message {
    /// Create a message holding `body`.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Message {
            header: Arc::new(Vec::with_capacity(HEADER_CAPACITY)),
            body: Arc::new(body.into()),
            pipe: None,
            sent: false,
        }
    }

    /// Create an empty message with a pre-sized body region.
    pub fn alloc(capacity: usize) -> Self {
        Message {
            header: Arc::new(Vec::with_capacity(HEADER_CAPACITY)),
            body: Arc::new(Vec::with_capacity(capacity)),
            pipe: None,
            sent: false,
        }
    }

    /// Create a message already directed at `pipe`.
    pub fn with_pipe(body: impl Into<Vec<u8>>, pipe: &Pipe) -> Self {
        let mut msg = Message::new(body);
        msg.pipe = Some(pipe.clone());
        msg
    }

    /// Internal constructor for messages arriving off the wire.
    pub(crate) fn from_wire(header: Vec<u8>, body: Vec<u8>, pipe: Option<Pipe>) -> Self {
        Message {
            header: Arc::new(header),
            body: Arc::new(body),
            pipe,
            sent: false,
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.sent {
            Err(Error::AlreadySent)
        } else {
            Ok(())
        }
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// `true` when the body is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Header length in bytes.
    pub fn header_len(&self) -> usize {
        self.header.len()
    }

    /// The body bytes.
    pub fn body(&self) -> Result<&[u8]> {
        self.check_usable()?;
        Ok(self.body.as_slice())
    }

    /// Alias for [`Message::body`], matching the original API surface.
    pub fn bytes(&self) -> Result<&[u8]> {
        self.body()
    }

    /// The header bytes.
    pub fn header(&self) -> Result<&[u8]> {
        self.check_usable()?;
        Ok(self.header.as_slice())
    }

    /// Append bytes to the body.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        Arc::make_mut(&mut self.body).extend_from_slice(data);
        Ok(())
    }

    /// Insert bytes at the front of the body.
    pub fn prepend(&mut self, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        let body = Arc::make_mut(&mut self.body);
        body.splice(0..0, data.iter().copied());
        Ok(())
    }

    /// Remove `n` bytes from the front of the body.
    pub fn trim(&mut self, n: usize) -> Result<()> {
        self.check_usable()?;
        if n > self.body.len() {
            return Err(Error::InvalidOperation);
        }
        Arc::make_mut(&mut self.body).drain(..n);
        Ok(())
    }

    /// Remove `n` bytes from the end of the body.
    pub fn chop(&mut self, n: usize) -> Result<()> {
        self.check_usable()?;
        let len = self.body.len();
        if n > len {
            return Err(Error::InvalidOperation);
        }
        Arc::make_mut(&mut self.body).truncate(len - n);
        Ok(())
    }

    /// Append bytes to the header region.
    pub fn header_append(&mut self, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        Arc::make_mut(&mut self.header).extend_from_slice(data);
        Ok(())
    }

    /// Insert bytes at the front of the header region.
    pub fn header_prepend(&mut self, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        let header = Arc::make_mut(&mut self.header);
        header.splice(0..0, data.iter().copied());
        Ok(())
    }

    /// Remove `n` bytes from the front of the header region.
    pub fn header_trim(&mut self, n: usize) -> Result<()> {
        self.check_usable()?;
        if n > self.header.len() {
            return Err(Error::InvalidOperation);
        }
        Arc::make_mut(&mut self.header).drain(..n);
        Ok(())
    }

    /// Drop all header bytes.
    pub fn header_clear(&mut self) -> Result<()> {
        self.check_usable()?;
        Arc::make_mut(&mut self.header).clear();
        Ok(())
    }

    /// Direct the message at a specific pipe. Protocols that pick a peer per
    /// message (Pair1 in polyamorous mode, and the directed `Pipe::send`
    /// path) honor this; broadcast protocols ignore it.
    pub fn set_pipe(&mut self, pipe: &Pipe) -> Result<()> {
        self.check_usable()?;
        self.pipe = Some(pipe.clone());
        Ok(())
    }

    /// Clear the pipe affinity.
    pub fn clear_pipe(&mut self) -> Result<()> {
        self.check_usable()?;
        self.pipe = None;
        Ok(())
    }

    /// The pipe this message arrived on, or was directed at. `None` when the
    /// message has no affinity (or the originating pipe was invalid).
    pub fn pipe(&self) -> Option<&Pipe> {
        self.pipe.as_ref()
    }

    /// Unwrap the message into its body bytes.
    pub fn into_body(self) -> Result<Vec<u8>> {
        self.check_usable()?;
        Ok(Arc::try_unwrap(self.body).unwrap_or_else(|shared| (*shared).clone()))
    }

    /// Consume the payload for transmission. The message value stays behind
    /// as a husk whose every operation reports `AlreadySent`.
    pub(crate) fn take_for_send(&mut self) -> Result<(Vec<u8>, Option<Pipe>)> {
        self.check_usable()?;
        self.sent = true;
        let body = std::mem::take(&mut self.body);
        let body = Arc::try_unwrap(body).unwrap_or_else(|shared| (*shared).clone());
        Ok((body, self.pipe.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_edits_work_both_ends() {
        let mut msg = Message::new(&b"middle"[..]);
        msg.prepend(b"front ").unwrap();
        msg.append(b" back").unwrap();
        assert_eq!(msg.body().unwrap(), b"front middle back");
        msg.trim(6).unwrap();
        msg.chop(5).unwrap();
        assert_eq!(msg.body().unwrap(), b"middle");
        assert!(msg.trim(100).is_err());
    }

    #[test]
    fn clones_share_until_written() {
        let mut original = Message::new(&b"shared"[..]);
        let copied = original.clone();
        original.append(b" no more").unwrap();
        assert_eq!(original.body().unwrap(), b"shared no more");
        assert_eq!(copied.body().unwrap(), b"shared");
    }

    #[test]
    fn header_region_is_independent() {
        let mut msg = Message::new(&b"payload"[..]);
        msg.header_append(&[0, 0, 0, 1]).unwrap();
        assert_eq!(msg.header_len(), 4);
        assert_eq!(msg.len(), 7);
        msg.header_trim(2).unwrap();
        assert_eq!(msg.header().unwrap(), &[0, 1]);
        msg.header_clear().unwrap();
        assert_eq!(msg.header_len(), 0);
    }

    #[test]
    fn consumed_messages_refuse_everything() {
        let mut msg = Message::new(&b"one shot"[..]);
        let (body, pipe) = msg.take_for_send().unwrap();
        assert_eq!(body, b"one shot");
        assert!(pipe.is_none());

        assert_eq!(msg.body().unwrap_err(), Error::AlreadySent);
        assert_eq!(msg.append(b"x").unwrap_err(), Error::AlreadySent);
        assert_eq!(msg.take_for_send().unwrap_err(), Error::AlreadySent);
    }
}
