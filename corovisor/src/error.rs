//! Error handling utils.
//!
//! Every fallible operation in this crate returns [`Result`], whose error
//! variants distinguish programmer-misuse (which the rest of the crate
//! actually reports via `assert!`/`panic!`, per the invariants in the
//! top-level crate docs) from genuinely recoverable conditions: allocation
//! failure, kernel rejection of an `epoll_ctl`, and I/O timeouts.

use std::fmt::{self, Display, Formatter};
use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases surfaced by the scheduling core.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The fiber's stack could not be allocated (`mmap`/allocator returned
    /// null).
    #[error("failed to allocate a {requested} byte fiber stack")]
    StackAlloc { requested: usize },

    /// A `ucontext` API call (`getcontext`/`makecontext`/`swapcontext`)
    /// failed. This is treated as unrecoverable everywhere it's checked;
    /// the variant exists so fiber construction can still report it instead
    /// of aborting.
    #[error("context switch failed: {0}")]
    Context(#[source] io::Error),

    /// `epoll_ctl` rejected a registration (table growth, invalid fd, ...).
    #[error("epoll_ctl({op}) on fd {fd} failed: {source}")]
    EpollCtl {
        op: &'static str,
        fd: std::os::raw::c_int,
        #[source]
        source: io::Error,
    },

    /// `epoll_create1`/the self-pipe could not be constructed.
    #[error("failed to initialize the epoll reactor: {0}")]
    ReactorInit(#[source] io::Error),

    /// A hooked I/O call exceeded its configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// Wraps an arbitrary I/O error from an underlying syscall.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// `true` if this error represents [`Error::Timeout`], the case hooked
    /// I/O callers translate back into `errno = ETIMEDOUT`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

/// Lightweight stand-in for libc's errno-based error reporting, used by
/// [`crate::fdmanager`] and [`crate::io`] call sites that need to surface a
/// raw `errno` value rather than an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub fn last() -> Self {
        Errno(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    pub fn set(self) {
        unsafe { *libc::__errno_location() = self.0 };
    }
}

impl Display for Errno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}
