//! Error taxonomy shared by every public entry point.
//!
//! Every fallible operation in this crate returns [`Result`] with an [`Error`]
//! drawn from a single closed set of kinds. Transport-level I/O errors are
//! folded into the taxonomy through the [`From<std::io::Error>`] impl so that
//! callers never have to match on raw `io::ErrorKind`s.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds surfaced by sockets, pipes, endpoints and messages.
///
/// The set is closed on purpose: protocol state machines and transports agree
/// on these kinds, and tests match on them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("operation interrupted")]
    Interrupted,
    #[error("out of memory")]
    NoMemory,
    #[error("invalid argument")]
    InvalidOperation,
    #[error("resource busy")]
    Busy,
    #[error("operation timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("object closed")]
    Closed,
    #[error("resource temporarily unavailable, try again")]
    TryAgain,
    #[error("operation not supported")]
    NotSupported,
    #[error("address in use")]
    AddressInUse,
    #[error("incorrect state for operation")]
    BadState,
    #[error("no such entry")]
    NoEntry,
    #[error("protocol error")]
    ProtocolError,
    #[error("destination unreachable")]
    DestinationUnreachable,
    #[error("address invalid")]
    AddressInvalid,
    #[error("permission denied")]
    PermissionDenied,
    #[error("message too large")]
    MessageTooLarge,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("operation canceled")]
    Canceled,
    #[error("out of file descriptors")]
    OutOfFiles,
    #[error("out of disk space")]
    OutOfSpace,
    #[error("resource already exists")]
    AlreadyExists,
    #[error("resource is read-only")]
    ReadOnly,
    #[error("resource is write-only")]
    WriteOnly,
    #[error("cryptographic error")]
    CryptoError,
    #[error("peer could not be authenticated")]
    AuthenticationError,
    #[error("option requires an argument")]
    NoArgument,
    #[error("ambiguous option")]
    Ambiguous,
    #[error("incorrect value type")]
    BadType,
    #[error("internal error")]
    Internal,
    #[error("message was already sent")]
    AlreadySent,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted => Error::Interrupted,
            io::ErrorKind::OutOfMemory => Error::NoMemory,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Error::InvalidOperation,
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::WouldBlock => Error::TryAgain,
            io::ErrorKind::Unsupported => Error::NotSupported,
            io::ErrorKind::AddrInUse => Error::AddressInUse,
            io::ErrorKind::AddrNotAvailable => Error::AddressInvalid,
            io::ErrorKind::NotFound => Error::NoEntry,
            io::ErrorKind::PermissionDenied => Error::PermissionDenied,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Error::ConnectionReset,
            // A peer hanging up mid-frame surfaces as a short read.
            io::ErrorKind::UnexpectedEof => Error::ConnectionReset,
            io::ErrorKind::ConnectionAborted | io::ErrorKind::NotConnected => {
                Error::ConnectionAborted
            }
            io::ErrorKind::AlreadyExists => Error::AlreadyExists,
            _ => Error::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_into_the_taxonomy() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(Error::from(refused), Error::ConnectionRefused);

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        assert_eq!(Error::from(eof), Error::ConnectionReset);

        let odd = io::Error::new(io::ErrorKind::Other, "???");
        assert_eq!(Error::from(odd), Error::Internal);
    }

    #[test]
    fn errors_render_human_readable() {
        assert_eq!(Error::Timeout.to_string(), "operation timed out");
        assert_eq!(Error::AlreadySent.to_string(), "message was already sent");
    }
}
