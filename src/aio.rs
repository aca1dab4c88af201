//! Asynchronous operation handles.
//!
//! Every send and receive ultimately runs as one cancellable, deadline-bound
//! operation on the library runtime. [`Aio`] is the handle: synchronous
//! callers park on [`Aio::wait`], async callers await [`Aio::wait_async`],
//! and an optional completion callback fires exactly once when the operation
//! settles — that callback is how foreign event loops get woken.
//!
//! Cancellation is cooperative and idempotent: [`Aio::cancel`] flags the
//! operation, the driver aborts at its next suspension point, and the result
//! becomes `Canceled`. Cancelling a completed operation changes nothing.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::error;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::runtime;

/// Callback invoked when an operation completes (including by cancellation
/// or timeout).
pub type AioCallback = Box<dyn FnOnce() + Send + 'static>;

struct AioState {
    finished: bool,
    result: Option<Result<()>>,
    msg: Option<Message>,
    callback: Option<AioCallback>,
}

struct AioInner {
    state: Mutex<AioState>,
    cv: Condvar,
    done: Notify,
    cancel_flag: AtomicBool,
    cancel_notify: Notify,
}

/// Handle to one in-flight (or finished) asynchronous operation.
#[derive(Clone)]
pub struct Aio {
    inner: Arc<AioInner>,
}

impl std::fmt::Debug for Aio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aio").finish_non_exhaustive()
    }
}

impl Aio {
    fn new(callback: Option<AioCallback>) -> Self {
        Aio {
            inner: Arc::new(AioInner {
                state: Mutex::new(AioState {
                    finished: false,
                    result: None,
                    msg: None,
                    callback,
                }),
                cv: Condvar::new(),
                done: Notify::new(),
                cancel_flag: AtomicBool::new(false),
                cancel_notify: Notify::new(),
            }),
        }
    }

    /// Block the calling thread until the operation settles.
    ///
    /// Meant for non-async callers; inside a runtime use
    /// [`Aio::wait_async`].
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while !state.finished {
            self.inner.cv.wait(&mut state);
        }
        state.result.unwrap_or(Err(Error::Internal))
    }

    /// Await the operation's completion.
    pub async fn wait_async(&self) -> Result<()> {
        loop {
            let notified = self.inner.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock();
                if state.finished {
                    return state.result.unwrap_or(Err(Error::Internal));
                }
            }
            notified.await;
        }
    }

    /// The result so far: `None` while still running.
    pub fn result(&self) -> Option<Result<()>> {
        let state = self.inner.state.lock();
        if state.finished {
            state.result
        } else {
            None
        }
    }

    /// Request cancellation. A no-op once the operation completed.
    pub fn cancel(&self) {
        if self.inner.state.lock().finished {
            return;
        }
        self.inner.cancel_flag.store(true, Ordering::Release);
        self.inner.cancel_notify.notify_waiters();
    }

    /// Take the message produced by a completed receive.
    pub fn take_msg(&self) -> Option<Message> {
        self.inner.state.lock().msg.take()
    }

    /// Stash a message on the handle (retrieved again via
    /// [`Aio::take_msg`]).
    pub fn set_msg(&self, msg: Message) {
        self.inner.state.lock().msg = Some(msg);
    }

    fn complete(&self, outcome: Result<Option<Message>>) {
        let callback = {
            let mut state = self.inner.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            match outcome {
                Ok(msg) => {
                    state.msg = msg;
                    state.result = Some(Ok(()));
                }
                Err(e) => state.result = Some(Err(e)),
            }
            state.callback.take()
        };
        self.inner.cv.notify_all();
        self.inner.done.notify_waiters();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!("aio completion callback panicked");
            }
        }
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.inner.cancel_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.cancel_flag.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Start `op` as an asynchronous operation with an optional relative
/// deadline and completion callback.
pub(crate) fn start<F>(deadline: Option<Duration>, callback: Option<AioCallback>, op: F) -> Aio
where
    F: Future<Output = Result<Option<Message>>> + Send + 'static,
{
    let aio = Aio::new(callback);
    if runtime::is_shutdown() {
        aio.complete(Err(Error::Closed));
        return aio;
    }
    let driver = aio.clone();
    runtime::spawn(async move {
        let outcome = {
            let work = async {
                match deadline {
                    Some(limit) => match tokio::time::timeout(limit, op).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout),
                    },
                    None => op.await,
                }
            };
            tokio::select! {
                biased;
                _ = driver.cancelled() => Err(Error::Canceled),
                result = work => result,
            }
        };
        driver.complete(outcome);
    });
    aio
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn completed_op_delivers_result_and_message() {
        let aio = start(None, None, async { Ok(Some(Message::new(&b"done"[..]))) });
        assert_eq!(aio.wait(), Ok(()));
        let msg = aio.take_msg().expect("message should be present");
        assert_eq!(msg.body().unwrap(), b"done");
        // Taking twice yields nothing.
        assert!(aio.take_msg().is_none());
    }

    #[test]
    fn deadline_turns_into_timeout() {
        let aio = start(Some(Duration::from_millis(20)), None, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        });
        assert_eq!(aio.wait(), Err(Error::Timeout));
    }

    #[test]
    fn cancel_is_effective_and_idempotent() {
        let aio = start(None, None, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        });
        aio.cancel();
        aio.cancel();
        assert_eq!(aio.wait(), Err(Error::Canceled));
        // Cancelling after completion is a no-op.
        aio.cancel();
        assert_eq!(aio.wait(), Err(Error::Canceled));
    }

    #[test]
    fn callback_fires_once_on_completion() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let aio = start(
            None,
            Some(Box::new(|| {
                FIRED.fetch_add(1, Ordering::SeqCst);
            })),
            async { Ok(None) },
        );
        assert_eq!(aio.wait(), Ok(()));
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }
}
