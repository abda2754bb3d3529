//! Crate-local error type for the recoverable failure paths named in the error handling design:
//! configuration, transport, protocol, resource and remote failures. Allocator invariant
//! violations are programmer faults and are not represented here; they `panic!` directly.

use std::fmt;
use std::io;

/// The five recoverable error kinds a call can fail with.
#[derive(Debug)]
pub enum Error {
    /// No servers are configured (`--remotethread` was never passed).
    Config(&'static str),
    /// A socket, read, write, or ioctl failed, or the peer closed early.
    Transport(io::Error),
    /// A frame violated the wire protocol (bad magic, truncated inflate, trailing bytes).
    Protocol(&'static str),
    /// A local resource could not be obtained (region/scratch allocation, binary/temp-file I/O).
    Resource(&'static str),
    /// The remote side reported `Reply.status == Error`.
    Remote,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remotethread WARNING: ")?;
        match self {
            Error::Config(msg) => write!(f, "{msg}"),
            Error::Transport(e) => write!(f, "{e}"),
            Error::Protocol(msg) => write!(f, "{msg}"),
            Error::Resource(msg) => write!(f, "{msg}"),
            Error::Remote => write!(f, "server returned an error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e)
    }
}

/// Log `err` at `warn!` level with the conventional `remotethread WARNING: ...` prefix (already
/// produced by `Error`'s `Display` impl), then collapse it to the `None` sentinel the public API
/// surface returns. Centralizes the "log once, return None" pattern used throughout the crate.
pub(crate) fn warn_none<T>(err: Error) -> Option<T> {
    warn!("{err}");
    None
}
