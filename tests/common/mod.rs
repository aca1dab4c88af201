//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use scalemsg::Socket;

/// Wait up to five seconds for a socket's pipe count to settle at
/// `expected`. Polling beats hardcoded sleeps: fast locally, tolerant in CI.
pub async fn wait_for_pipes(socket: &Socket, expected: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if socket.pipes().len() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    socket.pipes().len() == expected
}

/// A process-unique inproc URL, so concurrently running tests in one binary
/// never collide on a rendezvous name.
pub fn inproc_url(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "inproc://{tag}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Install a subscriber honoring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
