//! Error codes that flow through the networking runtime.
//!
//! Success is the `Ok` arm of `Result<_, NetError>`; every handler and
//! subscription in this crate receives a `Result` rather than a sentinel
//! success code. Socket-level failures are folded into a small set of
//! domain codes, with the raw [`std::io::ErrorKind`] carried through for
//! anything without a better name.

use std::io;

/// Error type for every failure the runtime reports.
///
/// The stopped markers (`ServiceStopped`, `ChannelStopped`) are terminal
/// deliveries for subscriptions, not programming errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Illegal state, such as starting a component that is already running.
    OperationFailed,
    /// The coordinator (or one of its subscribers) has been stopped.
    ServiceStopped,
    /// Terminal delivery to per-channel subscribers.
    ChannelStopped,
    /// A channel deadline (connect, inactivity, expiration) elapsed.
    ChannelTimeout,
    /// Wire framing or checksum violation; always fatal for the channel.
    BadStream,
    /// A channel for the same authority is already registered.
    AddressInUse,
    /// Nothing to fetch from the address book.
    NotFound,
    /// Loading or saving the address book failed.
    FileSystem,
    /// The remote endpoint cannot be reached.
    NetworkUnreachable,
    /// Socket-layer failure with no more specific mapping.
    Io(io::ErrorKind),
}

impl NetError {
    /// Folds a socket error into the closest domain code.
    ///
    /// Peer disconnects read as `ChannelStopped` so that the stop fanout
    /// carries the same code whether the local or remote side hung up.
    pub fn from_io(err: &io::Error) -> NetError {
        use io::ErrorKind::*;
        match err.kind() {
            UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe => {
                NetError::ChannelStopped
            }
            ConnectionRefused | AddrNotAvailable => NetError::NetworkUnreachable,
            TimedOut => NetError::ChannelTimeout,
            kind => NetError::Io(kind),
        }
    }
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetError::OperationFailed => write!(f, "operation failed"),
            NetError::ServiceStopped => write!(f, "service stopped"),
            NetError::ChannelStopped => write!(f, "channel stopped"),
            NetError::ChannelTimeout => write!(f, "channel timed out"),
            NetError::BadStream => write!(f, "bad data stream"),
            NetError::AddressInUse => write!(f, "address already in use"),
            NetError::NotFound => write!(f, "object does not exist"),
            NetError::FileSystem => write!(f, "file system error"),
            NetError::NetworkUnreachable => write!(f, "network unreachable"),
            NetError::Io(kind) => write!(f, "i/o error: {kind}"),
        }
    }
}

impl std::error::Error for NetError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_mapping_folds_disconnects() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(NetError::from_io(&eof), NetError::ChannelStopped);

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(NetError::from_io(&reset), NetError::ChannelStopped);

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(NetError::from_io(&refused), NetError::NetworkUnreachable);
    }

    #[test]
    fn unmapped_kinds_pass_through() {
        let other = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            NetError::from_io(&other),
            NetError::Io(io::ErrorKind::PermissionDenied)
        );
    }
}
