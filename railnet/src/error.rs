//! Error types for the rail transport.

use std::fmt;

use libfabric::Errno;

/// Caller-facing error classes, mirroring the categories the collective
/// library distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// The remote peer went away (connection aborted/reset/refused, host
    /// down/unreachable).
    Remote,
    /// An internal invariant was violated.
    Internal,
    /// Everything else, including provider failures.
    System,
    /// The caller passed something invalid.
    InvalidArgument,
    /// The requested feature is not available in this build/configuration.
    Unsupported,
}

/// Error type for rail transport operations.
#[derive(Debug)]
pub enum Error {
    /// A fabric operation failed. The libfabric error code passes through
    /// unchanged; see [`Error::category`] for the caller-facing class.
    Fabric(Errno),
    /// Invalid argument from the caller.
    InvalidArgument(&'static str),
    /// A pool, freelist or inflight budget ran out.
    ResourceExhausted(&'static str),
    /// Feature not supported by this build or provider.
    Unsupported(&'static str),
    /// Fatal protocol violation; the endpoint may no longer be usable.
    Protocol(String),
    /// A previously posted request finished in the error state.
    RequestFailed,
    /// Invalid configuration value.
    InvalidConfig(String),
    /// OS-level failure (page allocation and friends).
    Io(std::io::Error),
}

impl Error {
    /// Classify for the caller, preserving the fabric errno mapping:
    /// connection-loss errnos become `Remote`, `EINVAL` becomes `Internal`,
    /// anything else is `System`.
    pub fn category(&self) -> Category {
        match self {
            Error::Fabric(errno) => match errno.raw() {
                code if code == libc::ECONNABORTED
                    || code == libc::ECONNRESET
                    || code == libc::ECONNREFUSED
                    || code == libc::ENOTCONN
                    || code == libc::EHOSTDOWN
                    || code == libc::EHOSTUNREACH =>
                {
                    Category::Remote
                }
                code if code == libc::EINVAL => Category::Internal,
                _ => Category::System,
            },
            Error::InvalidArgument(_) => Category::InvalidArgument,
            Error::ResourceExhausted(_) => Category::System,
            Error::Unsupported(_) => Category::Unsupported,
            Error::Protocol(_) => Category::System,
            Error::RequestFailed => Category::Remote,
            Error::InvalidConfig(_) => Category::InvalidArgument,
            Error::Io(_) => Category::System,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Fabric(errno) => write!(f, "fabric error: {}", errno),
            Error::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Error::ResourceExhausted(what) => write!(f, "out of resources: {}", what),
            Error::Unsupported(what) => write!(f, "not supported: {}", what),
            Error::Protocol(what) => write!(f, "protocol violation: {}", what),
            Error::RequestFailed => write!(f, "request completed with error"),
            Error::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Fabric(errno) => Some(errno),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Fabric(errno)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for rail transport operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_category_mapping() {
        for code in [
            libc::ECONNABORTED,
            libc::ECONNRESET,
            libc::ECONNREFUSED,
            libc::ENOTCONN,
            libc::EHOSTDOWN,
            libc::EHOSTUNREACH,
        ] {
            let err = Error::Fabric(Errno::from_raw(code));
            assert_eq!(err.category(), Category::Remote, "code {}", code);
        }
    }

    #[test]
    fn test_internal_and_system_mapping() {
        assert_eq!(
            Error::Fabric(Errno::from_raw(libc::EINVAL)).category(),
            Category::Internal
        );
        assert_eq!(
            Error::Fabric(Errno::from_raw(libc::EIO)).category(),
            Category::System
        );
    }
}
