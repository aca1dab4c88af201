//! Bounded message queues backing per-pipe send buffers and per-socket
//! receive buffers.
//!
//! The queue is deliberately small: a `VecDeque` under a short-held lock,
//! with `Notify`-based wakeups for blocked producers and consumers. Unlike a
//! fixed channel, capacity can be adjusted at runtime (the `recv-buffer` /
//! `send-buffer` options) and the surveyor protocol can discard a stale
//! backlog with [`MsgQueue::clear`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Outcome of a non-blocking push.
pub(crate) enum TryPushError<T> {
    /// The queue is at capacity; the item is handed back.
    Full(T),
    /// The queue was closed; the item is handed back.
    Closed(T),
}

struct State<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

pub(crate) struct MsgQueue<T> {
    state: Mutex<State<T>>,
    readable: Notify,
    writable: Notify,
    /// Optional external wakeup pinged whenever space frees up. Used by
    /// protocols that wait for capacity across many pipes at once.
    drain_hook: Mutex<Option<Arc<Notify>>>,
}

impl<T> MsgQueue<T> {
    pub fn new(capacity: usize) -> Self {
        MsgQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                capacity: capacity.max(1),
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            drain_hook: Mutex::new(None),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = capacity.max(1);
        self.writable.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn set_drain_notify(&self, notify: Arc<Notify>) {
        *self.drain_hook.lock() = Some(notify);
    }

    fn ping_drain_hook(&self) {
        if let Some(hook) = self.drain_hook.lock().as_ref() {
            hook.notify_waiters();
        }
    }

    pub fn try_push(&self, item: T) -> std::result::Result<(), TryPushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TryPushError::Closed(item));
        }
        if state.items.len() >= state.capacity {
            return Err(TryPushError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.readable.notify_one();
        Ok(())
    }

    /// Push, waiting for space. `deadline` converts a blocked push into
    /// `Timeout`; a closed queue yields `Closed`.
    pub async fn push(&self, item: T, deadline: Option<Instant>) -> Result<()> {
        let mut item = item;
        loop {
            // Register interest before re-checking, so a wakeup issued
            // between the check and the await is not lost.
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(TryPushError::Closed(_)) => return Err(Error::Closed),
                Err(TryPushError::Full(back)) => item = back,
            }
            wait(notified, deadline).await?;
        }
    }

    /// Non-blocking pop. `Ok(None)` means "empty right now"; a closed queue
    /// is an error.
    pub fn try_pop(&self) -> Result<Option<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let item = state.items.pop_front();
        let more = !state.items.is_empty();
        drop(state);
        if item.is_some() {
            self.writable.notify_one();
            self.ping_drain_hook();
            if more {
                self.readable.notify_one();
            }
        }
        Ok(item)
    }

    /// Pop, waiting for an item up to `deadline`.
    pub async fn pop(&self, deadline: Option<Instant>) -> Result<T> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.try_pop()? {
                return Ok(item);
            }
            wait(notified, deadline).await?;
        }
    }

    /// Drop everything queued. Pending producers get to run again.
    pub fn clear(&self) {
        self.state.lock().items.clear();
        self.writable.notify_waiters();
        self.ping_drain_hook();
    }

    /// Close the queue; everyone blocked on it wakes with `Closed`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        self.ping_drain_hook();
    }
}

/// Await an already-registered notification, bounded by an optional deadline.
pub(crate) async fn wait(
    notified: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>,
    deadline: Option<Instant>,
) -> Result<()> {
    match deadline {
        None => {
            notified.await;
            Ok(())
        }
        Some(at) => {
            let at = tokio::time::Instant::from_std(at);
            tokio::time::timeout_at(at, notified)
                .await
                .map_err(|_| Error::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn push_pop_in_order() {
        let q = MsgQueue::new(4);
        q.push(1u32, None).await.unwrap();
        q.push(2, None).await.unwrap();
        assert_eq!(q.pop(None).await.unwrap(), 1);
        assert_eq!(q.pop(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn full_queue_times_out() {
        let q = MsgQueue::new(1);
        q.push(1u32, None).await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(q.push(2, Some(deadline)).await.unwrap_err(), Error::Timeout);
    }

    #[tokio::test]
    async fn blocked_pop_wakes_on_push() {
        let q = Arc::new(MsgQueue::new(1));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop(None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(7u32, None).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn close_wakes_everyone() {
        let q = Arc::new(MsgQueue::<u32>::new(1));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop(None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert_eq!(waiter.await.unwrap().unwrap_err(), Error::Closed);
        assert_eq!(q.try_pop().unwrap_err(), Error::Closed);
    }

    #[tokio::test]
    async fn clear_discards_backlog() {
        let q = MsgQueue::new(4);
        q.push(1u32, None).await.unwrap();
        q.push(2, None).await.unwrap();
        q.clear();
        assert!(q.try_pop().unwrap().is_none());
    }
}
