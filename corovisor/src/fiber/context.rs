//! Raw `ucontext`-based stack switch primitive.
//!
//! This is the one part of the crate that talks directly to the platform's
//! machine-context API rather than to epoll or a socket. It deliberately
//! knows nothing about fiber states, scheduling, or thread-locals — those
//! live in [`super`]; this module only knows how to carve a context out of a
//! stack buffer and swap into/out of it.

use std::io;
use std::os::raw::c_void;

use crate::error::{Error, Result};

/// A single saved machine context plus (optionally) the stack it runs on.
///
/// The "thread-main" context adopts the OS-provided stack and never calls
/// [`RawContext::init`]; every other context is backed by a heap-allocated
/// buffer owned by the `Fiber` that wraps this `RawContext`.
pub(crate) struct RawContext {
    ucontext: Box<libc::ucontext_t>,
}

impl RawContext {
    /// An empty, uninitialized context. Must be filled in with
    /// [`RawContext::init`] (for a fiber with its own stack) before it is
    /// ever used as the `to` side of [`RawContext::swap`].
    ///
    /// The thread-main/bootstrap context is the one exception: it is never
    /// `init`-ed. It only ever appears as the `from` side of `swap`, which
    /// fills it in (via the underlying `swapcontext`'s save side) the first
    /// time the thread yields out of its own stack, so a zeroed context is a
    /// fine starting point.
    pub fn uninit() -> Self {
        RawContext {
            // Safe to zero-initialize: ucontext_t is a plain-old-data
            // struct and `swap`'s save side fills it in before anything
            // ever reads it as a `to` target.
            ucontext: Box::new(unsafe { std::mem::zeroed() }),
        }
    }

    /// Initializes this context to run `entry` on `stack`, with no
    /// `uc_link` (the trampoline is expected to always yield explicitly
    /// rather than return).
    ///
    /// # Safety
    /// `stack` must outlive this context for as long as it may be resumed,
    /// and must not be moved while a context built from it is live.
    pub unsafe fn init(&mut self, stack: &mut [u8], entry: extern "C" fn()) -> Result<()> {
        let rc = libc::getcontext(self.ucontext.as_mut());
        if rc != 0 {
            return Err(Error::Context(io::Error::last_os_error()));
        }
        self.ucontext.uc_stack.ss_sp = stack.as_mut_ptr() as *mut c_void;
        self.ucontext.uc_stack.ss_size = stack.len();
        self.ucontext.uc_stack.ss_flags = 0;
        // No uc_link: if `entry` ever returned instead of yielding, falling
        // off the end of makecontext's trampoline is undefined behavior,
        // same as the original's bare `ucontext_t` usage. `fiber::trampoline`
        // never returns; it always ends in an explicit yield.
        self.ucontext.uc_link = std::ptr::null_mut();
        libc::makecontext(self.ucontext.as_mut(), entry, 0);
        Ok(())
    }

    /// Swaps the machine context: saves the caller's registers into `from`,
    /// restores `to`'s, and transfers control. Returns once some other
    /// `swap` call restores `from` again.
    ///
    /// # Safety
    /// Both contexts must be either the thread-main context or have been
    /// built with [`RawContext::init`] over a stack that is still alive.
    pub unsafe fn swap(from: &mut RawContext, to: &RawContext) {
        let rc = libc::swapcontext(from.ucontext.as_mut(), to.ucontext.as_ref());
        if rc != 0 {
            // Per the data model: context-API failure is unrecoverable.
            panic!(
                "swapcontext failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}
