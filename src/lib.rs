//! # Scalemsg
//!
//! A messaging library implementing the scalability-protocols family:
//! stateful, connection-oriented message-exchange patterns layered over
//! pluggable byte-stream transports.
//!
//! ## Patterns
//!
//! - **Pair** ([`Pair0`], [`Pair1`]): one-to-one, plus Pair1's polyamorous
//!   many-peer mode with per-pipe routing
//! - **Request/Reply** ([`Req0`], [`Rep0`]): retried requests, routed
//!   replies, concurrent exchanges via [`Context`]
//! - **Publish/Subscribe** ([`Pub0`], [`Sub0`]): broadcast with
//!   subscriber-side prefix filtering
//! - **Pipeline** ([`Push0`], [`Pull0`]): round-robin work distribution
//! - **Surveyor/Respondent** ([`Surveyor0`], [`Respondent0`]): windowed
//!   broadcast question-and-answer
//! - **Bus** ([`Bus0`]): many-to-many mesh
//!
//! ## Transports
//!
//! `tcp://`, `tcp4://`, `tcp6://`, `tls+tcp://`, `ipc://`, `abstract://`
//! (Linux) and `inproc://`. Listeners accept, dialers connect and
//! transparently reconnect with exponential backoff.
//!
//! ## Blocking and async
//!
//! Every operation exists in a synchronous form (`send`, `recv`, ...), an
//! async form (`asend`, `arecv`, ...) and a raw AIO form
//! ([`Socket::start_send`] / [`Socket::start_recv`] returning an [`Aio`]
//! handle with cancellation and deadlines). Background work runs on a
//! library-owned tokio runtime torn down once via [`shutdown`].

pub mod aio;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod options;
pub mod pipe;
pub mod protocol;
mod queue;
mod runtime;
pub mod sockaddr;
pub mod socket;
pub mod tls;
pub mod transport;

pub use aio::Aio;
pub use context::Context;
pub use endpoint::{Dialer, DialerState, Listener};
pub use error::{Error, Result};
pub use message::Message;
pub use options::OptionValue;
pub use pipe::Pipe;
pub use protocol::{
    Bus0, Pair0, Pair1, Pub0, Pull0, Push0, Rep0, Req0, Respondent0, Sub0, Surveyor0,
};
pub use runtime::shutdown;
pub use sockaddr::SockAddr;
pub use socket::{CallbackHandle, Socket};
pub use tls::{TlsAuthMode, TlsConfig, TlsMode};

/// The current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    /// Default receive queue depth, in messages.
    pub const RECV_BUFFER: usize = 8;

    /// Default per-pipe send queue depth, in messages.
    pub const SEND_BUFFER: usize = 8;

    /// Default minimum reconnect delay for dialers, in milliseconds.
    pub const RECONNECT_TIME_MIN_MS: i32 = 10;
}
