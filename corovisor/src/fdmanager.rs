//! Process-wide per-fd bookkeeping: is this a socket, did the user ask for
//! non-blocking mode, did the hook layer already force it, what's the
//! current read/write timeout.
//!
//! Grounded in `original_source/include/fd_manager.h` +
//! `src/fd_manager.cpp`'s `FdCtx`/`FdManager`. The original is a
//! `Singleton<FdManager>` read with an `RWMutex`; `corovisor` keeps the
//! same shape (`global()` below) but with `std::sync::RwLock` protecting
//! the table, since real OS threads (not just cooperating fibers) can call
//! into the hook layer concurrently.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// No timeout configured — the original's `(uint64_t)-1`.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which direction a timeout applies to, corresponding to the `SO_RCVTIMEO`/
/// `SO_SNDTIMEO` socket options the hook layer's `setsockopt` override
/// intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

impl TimeoutKind {
    /// Maps a raw `setsockopt` option name to a [`TimeoutKind`], or `None`
    /// for anything else (the hook layer forwards those straight through).
    pub fn from_sockopt(optname: libc::c_int) -> Option<Self> {
        match optname {
            libc::SO_RCVTIMEO => Some(TimeoutKind::Recv),
            libc::SO_SNDTIMEO => Some(TimeoutKind::Send),
            _ => None,
        }
    }
}

/// Per-fd state: is it a socket, is it (user- or system-) non-blocking, and
/// its configured read/write timeouts. One of these is created the first
/// time a fd is looked up with `auto_create = true` and lives until
/// [`FdManager::remove`] drops it.
pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    is_close: AtomicBool,
    user_nonblock: AtomicBool,
    system_nonblock: bool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    /// `fstat`s `fd` to determine whether it's a socket, and if so forces
    /// `O_NONBLOCK` on it directly via `fcntl` — bypassing the hook layer's
    /// intercepted `fcntl`, the same way the original calls `fcntl_f`
    /// (the real, un-hooked symbol) from inside `FdCtx::init` to avoid
    /// recursing back into its own hook.
    fn new(fd: RawFd) -> Self {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let (is_init, is_socket) = if unsafe { libc::fstat(fd, &mut stat) } == -1 {
            (false, false)
        } else {
            (true, (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK)
        };

        let system_nonblock = if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            true
        } else {
            false
        };

        FdCtx {
            fd,
            is_init,
            is_socket,
            is_close: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            system_nonblock,
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_close(&self) -> bool {
        self.is_close.load(Ordering::Relaxed)
    }

    pub fn set_close(&self, closed: bool) {
        self.is_close.store(closed, Ordering::Relaxed);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_user_nonblock(&self, flag: bool) {
        self.user_nonblock.store(flag, Ordering::Relaxed);
    }

    /// Whether the hook layer itself forced `O_NONBLOCK` on this fd at
    /// construction time (always true for sockets, never for anything
    /// else) — the thing a hooked `read`/`write`/`accept` checks to decide
    /// whether it's allowed to park the calling fiber on a timeout at all.
    pub fn system_nonblock(&self) -> bool {
        self.system_nonblock
    }

    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout.load(Ordering::Relaxed),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, timeout_ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.store(timeout_ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout.store(timeout_ms, Ordering::Relaxed),
        }
    }
}

/// The process-wide fd table — the original's `FdManager`/`Singleton<FdManager>`.
/// Indexed directly by fd value, growing (1.5x) on demand.
pub struct FdManager {
    data: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl Default for FdManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FdManager {
    pub fn new() -> Self {
        FdManager {
            data: RwLock::new(vec![None; 64]),
        }
    }

    /// Looks up `fd`'s context, creating one (via `fstat`/`fcntl`) if it
    /// doesn't exist yet and `auto_create` is `true`. Returns `None` for a
    /// negative fd, or for an untracked fd when `auto_create` is `false`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let table = self.data.read().unwrap();
            match table.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                Some(None) if !auto_create => return None,
                None if !auto_create => return None,
                _ => {}
            }
        }

        let mut table = self.data.write().unwrap();
        if idx >= table.len() {
            let new_len = ((idx + 1) * 3 / 2).max(table.len() + 1);
            table.resize(new_len, None);
        }
        if let Some(ctx) = &table[idx] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdCtx::new(fd));
        table[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Drops `fd`'s context, e.g. when the hook layer's `close` override
    /// sees the real `close(2)` succeed.
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut table = self.data.write().unwrap();
        if let Some(slot) = table.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

static GLOBAL: Lazy<FdManager> = Lazy::new(FdManager::new);

/// The process-wide [`FdManager`] instance, the original's `FdMgr::GetInstance()`.
pub fn global() -> &'static FdManager {
    &GLOBAL
}
