//! Error values for fabric operations.
//!
//! Libfabric reports errors as negated errno-style integers. Codes below
//! `FI_ERRNO_OFFSET` map directly onto ISO C errno values; codes above it are
//! libfabric-specific. `Errno` keeps the positive code untranslated so callers
//! can match on well-known values (`EAGAIN` in particular is part of the
//! normal control flow, not a failure).

use std::ffi::CStr;
use std::fmt;

/// A libfabric error code (positive).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Errno(i32);

impl Errno {
    /// Resource temporarily unavailable; the operation must be retried.
    pub const AGAIN: Errno = Errno(libfabric_sys::FI_EAGAIN as i32);

    /// An error completion is queued on the CQ error queue.
    pub const AVAIL: Errno = Errno(libfabric_sys::FI_EAVAIL as i32);

    /// Invalid argument.
    pub const INVAL: Errno = Errno(libfabric_sys::FI_EINVAL as i32);

    /// Out of memory.
    pub const NOMEM: Errno = Errno(libfabric_sys::FI_ENOMEM as i32);

    /// Operation not supported.
    pub const NOSYS: Errno = Errno(libfabric_sys::FI_ENOSYS as i32);

    /// Build an `Errno` from a negative libfabric return value.
    #[inline]
    pub fn from_ret(ret: isize) -> Self {
        debug_assert!(ret < 0);
        Errno((-ret) as i32)
    }

    /// Build an `Errno` from a positive code (e.g. a CQ error entry's `err`).
    #[inline]
    pub fn from_raw(code: i32) -> Self {
        Errno(code.abs())
    }

    /// The positive error code, untranslated.
    #[inline]
    pub fn raw(&self) -> i32 {
        self.0
    }

    /// Whether this is the transient-backpressure code.
    #[inline]
    pub fn is_again(&self) -> bool {
        *self == Errno::AGAIN
    }

    /// Human-readable message from `fi_strerror`.
    pub fn message(&self) -> &'static str {
        unsafe {
            let ptr = libfabric_sys::fi_strerror(self.0);
            if ptr.is_null() {
                "unknown fabric error"
            } else {
                CStr::from_ptr(ptr).to_str().unwrap_or("unknown fabric error")
            }
        }
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, self.message())
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message(), self.0)
    }
}

impl std::error::Error for Errno {}

/// Result type for fabric operations.
pub type Result<T> = std::result::Result<T, Errno>;

/// Convert a libfabric return value into a `Result`.
#[inline]
pub(crate) fn check(ret: isize) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(Errno::from_ret(ret))
    }
}
