//! The library-owned worker pool.
//!
//! Accept loops, reconnect loops, pipe readers/writers and AIO operations
//! all run on a single lazily-created multi-thread tokio runtime, so sockets
//! keep functioning no matter which thread (or which caller runtime) touched
//! them. The runtime is process-global and torn down exactly once through
//! [`shutdown`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

static GLOBAL: OnceLock<Global> = OnceLock::new();
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

struct Global {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

fn global() -> &'static Global {
    GLOBAL.get_or_init(|| {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("scalemsg-worker")
            .build()
            .expect("failed to build the scalemsg worker runtime");
        debug!("scalemsg worker runtime started");
        Global {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        }
    })
}

/// A handle onto the library runtime, creating it on first use.
pub(crate) fn handle() -> Handle {
    global().handle.clone()
}

/// `true` once [`shutdown`] ran.
pub(crate) fn is_shutdown() -> bool {
    SHUTDOWN.load(Ordering::Acquire)
}

/// Spawn background work onto the library runtime.
pub(crate) fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    handle().spawn(future)
}

/// Drive a future to completion from synchronous code.
///
/// Outside any tokio context this parks the calling thread on the library
/// runtime. Inside a *multi-thread* tokio runtime the calling worker is
/// shifted to blocking mode first. Synchronous calls from a current-thread
/// runtime are not supported; use the async variants there.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    match Handle::try_current() {
        Ok(current) => tokio::task::block_in_place(move || current.block_on(future)),
        Err(_) => handle().block_on(future),
    }
}

/// Tear down the library worker pool, draining background tasks.
///
/// Call at most once, after every socket is closed. Sockets opened after
/// shutdown fail with [`Closed`](crate::Error::Closed). Safe to call when
/// the runtime was never started.
pub fn shutdown() {
    SHUTDOWN.store(true, Ordering::Release);
    if let Some(global) = GLOBAL.get() {
        if let Some(runtime) = global.runtime.lock().take() {
            debug!("draining scalemsg worker runtime");
            runtime.shutdown_timeout(Duration::from_secs(5));
        }
    }
}
