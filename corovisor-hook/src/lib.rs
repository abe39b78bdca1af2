//! Cooperative overrides for the handful of POSIX calls that would
//! otherwise block an OS thread: `sleep`/`usleep`/`nanosleep` and the
//! socket I/O family (`read`/`write`/`recv`/`send`/`accept`/`connect`/...).
//!
//! Grounded in `original_source/include/hook.h` + `src/hook.cpp`. The
//! original is `dlopen`'d implicitly via `LD_PRELOAD` and resolves the real
//! libc symbols once at startup with `dlsym(RTLD_NEXT, ...)`; this crate
//! does the same thing, and is built both as a `cdylib` (for actual
//! `LD_PRELOAD` use) and an `rlib` (so the `tests` crate can call the
//! overrides directly, in-process, without ever loading a second .so).
//!
//! None of this does anything unless [`install`] has been called on an
//! [`corovisor::io::IOManager`] whose scheduler threads are the ones
//! calling these functions — `corovisor` itself doesn't know this crate
//! exists, so the wiring goes through `Scheduler::add_thread_start_hook`,
//! the same extension point `IOManager` uses to install its own
//! thread-local "current reactor" handle.
//!
//! # Logging
//! Same as `corovisor`: only depends on the `log` facade.

use std::ffi::CString;
use std::os::raw::{c_int, c_long, c_uint, c_ulong, c_void};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use libc::{
    iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec, timeval, useconds_t,
};
use once_cell::sync::Lazy;

use corovisor::error::Errno;
use corovisor::fdmanager::{self, TimeoutKind, NO_TIMEOUT};
use corovisor::fiber::Fiber;
use corovisor::io::{Event, IOManager};

thread_local! {
    /// Whether calls made *on this thread* should be intercepted at all.
    /// Off by default everywhere, including on a scheduler's own worker
    /// threads, until [`install`] registers the thread-start hook that
    /// flips it on — the replacement for the original's `t_hook_enable`.
    static HOOK_ENABLE: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

/// Whether hooked I/O calls on the current thread should cooperate with a
/// [`corovisor::scheduler::Scheduler`] instead of blocking it outright.
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLE.with(|c| c.get())
}

/// Sets this thread's hook-enabled flag directly. Exposed mostly for tests
/// that want to exercise the overrides without a full `IOManager`; ordinary
/// callers should use [`install`] instead.
pub fn set_hook_enabled(flag: bool) {
    HOOK_ENABLE.with(|c| c.set(flag));
}

static CONNECT_TIMEOUT_MS: Lazy<AtomicU64> =
    Lazy::new(|| AtomicU64::new(corovisor::config::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64));

/// Overrides the global timeout the plain `connect` override passes to
/// [`connect_with_timeout`]. Callers that need a different timeout for one
/// particular socket should call [`connect_with_timeout`] directly instead.
pub fn set_connect_timeout_ms(ms: u64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Relaxed);
}

fn connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT_MS.load(Ordering::Relaxed)
}

/// Registers this crate's overrides on `io`'s worker threads: every thread
/// [`IOManager::start`]/[`IOManager::run`] puts to work gets
/// [`set_hook_enabled`]`(true)` applied before it enters the dispatch loop.
/// Also forces the real-symbol table (see [`real`]) to resolve eagerly,
/// rather than lazily on the first hooked call.
pub fn install(io: &IOManager) {
    Lazy::force(&REAL);
    io.scheduler()
        .add_thread_start_hook(Arc::new(|| set_hook_enabled(true)));
}

// ---------------------------------------------------------------------
// Real symbol resolution
// ---------------------------------------------------------------------

unsafe fn dlsym_next(name: &str) -> *mut c_void {
    let cname = CString::new(name).expect("hook symbol name has no interior NUL");
    libc::dlsym(libc::RTLD_NEXT, cname.as_ptr())
}

/// Variadic C functions (`fcntl`, `ioctl`) can't be *defined* from stable
/// Rust, so the overrides below take the single extra argument most real
/// callers pass as a plain integer. The System V calling convention puts it
/// in the same register a true variadic call would, so this is ABI-
/// compatible for the `F_SETFL`/`FIONBIO` style one-argument calls this
/// crate actually cares about.
macro_rules! real_fns {
    ($($field:ident : $ty:ty),* $(,)?) => {
        struct RealFns {
            $($field: $ty,)*
        }

        impl RealFns {
            unsafe fn resolve() -> Self {
                RealFns {
                    $($field: std::mem::transmute::<*mut c_void, $ty>(dlsym_next(
                        stringify!($field).trim_end_matches("_f"),
                    )),)*
                }
            }
        }
    };
}

real_fns! {
    sleep_f: unsafe extern "C" fn(c_uint) -> c_uint,
    usleep_f: unsafe extern "C" fn(useconds_t) -> c_int,
    nanosleep_f: unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int,
    socket_f: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    connect_f: unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int,
    accept_f: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int,
    read_f: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t,
    readv_f: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t,
    recv_f: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t,
    recvfrom_f: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t,
    recvmsg_f: unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t,
    write_f: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t,
    writev_f: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t,
    send_f: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t,
    sendto_f: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t,
    sendmsg_f: unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t,
    close_f: unsafe extern "C" fn(c_int) -> c_int,
    fcntl_f: unsafe extern "C" fn(c_int, c_int, c_long) -> c_int,
    ioctl_f: unsafe extern "C" fn(c_int, c_ulong, c_long) -> c_int,
    getsockopt_f: unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int,
    setsockopt_f: unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int,
}

static REAL: Lazy<RealFns> = Lazy::new(|| unsafe { RealFns::resolve() });

fn errno() -> c_int {
    Errno::last().0
}

// ---------------------------------------------------------------------
// The shared retry loop behind every socket I/O override
// ---------------------------------------------------------------------

/// The generic "try the real call, and if it would block, park the
/// current fiber on the fd until it's ready (or a timeout fires)" loop —
/// the original's `do_io` template, minus the template: every hooked
/// socket call below supplies its own `call` closure and picks
/// [`Event::READ`] or [`Event::WRITE`].
fn io_action(
    fd: RawFd,
    event: Event,
    kind: TimeoutKind,
    mut call: impl FnMut() -> ssize_t,
) -> ssize_t {
    if !is_hook_enabled() {
        return call();
    }
    let ctx = match fdmanager::global().get(fd, false) {
        Some(ctx) => ctx,
        None => return call(),
    };
    if ctx.is_close() {
        Errno(libc::EBADF).set();
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return call();
    }
    let timeout_ms = ctx.timeout(kind);

    loop {
        let mut n = call();
        while n == -1 && errno() == libc::EINTR {
            n = call();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        let io = match IOManager::current() {
            Some(io) => io,
            None => return n,
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let timer = (timeout_ms != NO_TIMEOUT).then(|| {
            let flag = cancelled.clone();
            let weak: std::sync::Weak<AtomicBool> = Arc::downgrade(&cancelled);
            let io = io.clone();
            io.timers().add_conditional_timer(
                timeout_ms,
                move || {
                    // Only the thread that actually triggers the event gets
                    // to call it a timeout: if the fd's data event already
                    // fired earlier in this same idle cycle, `cancel_event`
                    // here is a no-op (the armed bit is already clear), and
                    // the fiber resuming because data was genuinely ready
                    // must not see `cancelled`.
                    if io.cancel_event(fd, event) {
                        flag.store(true, Ordering::SeqCst);
                    }
                },
                weak,
                false,
            )
        });

        if let Err(e) = io.add_event(fd, event, None) {
            log::error!("hooked I/O on fd {fd} failed to register {event:?}: {e}");
            if let Some(t) = &timer {
                t.cancel();
            }
            Errno(libc::EBADF).set();
            return -1;
        }

        Fiber::yield_hold();

        if let Some(t) = &timer {
            t.cancel();
        }
        if cancelled.load(Ordering::SeqCst) {
            Errno(libc::ETIMEDOUT).set();
            return -1;
        }
    }
}

// ---------------------------------------------------------------------
// sleep family
// ---------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if !is_hook_enabled() {
        return (REAL.sleep_f)(seconds);
    }
    let Some(io) = IOManager::current() else {
        return (REAL.sleep_f)(seconds);
    };
    let fiber = Fiber::current();
    let scheduler = io.scheduler().clone();
    io.timers().add_timer(
        (seconds as u64) * 1000,
        move || scheduler.schedule(fiber.clone()),
        false,
    );
    Fiber::yield_hold();
    0
}

#[no_mangle]
pub unsafe extern "C" fn usleep(usec: useconds_t) -> c_int {
    if !is_hook_enabled() {
        return (REAL.usleep_f)(usec);
    }
    let Some(io) = IOManager::current() else {
        return (REAL.usleep_f)(usec);
    };
    let fiber = Fiber::current();
    let scheduler = io.scheduler().clone();
    io.timers().add_timer(
        usec as u64 / 1000,
        move || scheduler.schedule(fiber.clone()),
        false,
    );
    Fiber::yield_hold();
    0
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if !is_hook_enabled() || req.is_null() {
        return (REAL.nanosleep_f)(req, rem);
    }
    let Some(io) = IOManager::current() else {
        return (REAL.nanosleep_f)(req, rem);
    };
    let req = &*req;
    let timeout_ms = (req.tv_sec as u64) * 1000 + (req.tv_nsec as u64) / 1_000_000;
    let fiber = Fiber::current();
    let scheduler = io.scheduler().clone();
    io.timers()
        .add_timer(timeout_ms, move || scheduler.schedule(fiber.clone()), false);
    Fiber::yield_hold();
    0
}

// ---------------------------------------------------------------------
// socket lifecycle
// ---------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (REAL.socket_f)(domain, ty, protocol);
    if is_hook_enabled() && fd >= 0 {
        fdmanager::global().get(fd, true);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn accept(
    sockfd: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    let fd = io_action(sockfd, Event::READ, TimeoutKind::Recv, || {
        (REAL.accept_f)(sockfd, addr, addrlen) as ssize_t
    }) as c_int;
    if is_hook_enabled() && fd >= 0 {
        fdmanager::global().get(fd, true);
    }
    fd
}

/// `connect(2)` with an explicit timeout, independent of the global default
/// the plain `connect` override uses. The original's free function of the
/// same name — not a libc symbol, so it isn't `#[no_mangle]`.
pub unsafe fn connect_with_timeout(
    sockfd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_hook_enabled() {
        return (REAL.connect_f)(sockfd, addr, addrlen);
    }
    let ctx = match fdmanager::global().get(sockfd, false) {
        Some(ctx) => ctx,
        None => return (REAL.connect_f)(sockfd, addr, addrlen),
    };
    if ctx.is_close() {
        Errno(libc::EBADF).set();
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return (REAL.connect_f)(sockfd, addr, addrlen);
    }

    let n = (REAL.connect_f)(sockfd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(io) = IOManager::current() else {
        return n;
    };

    let cancelled = Arc::new(AtomicBool::new(false));
    let timer = (timeout_ms != NO_TIMEOUT).then(|| {
        let flag = cancelled.clone();
        let weak: std::sync::Weak<AtomicBool> = Arc::downgrade(&cancelled);
        let io = io.clone();
        io.timers().add_conditional_timer(
            timeout_ms,
            move || {
                // See the comment in `io_action`'s conditional timer: only
                // count this as a timeout if cancel_event actually triggered
                // the WRITE event, so a connect that completed in the same
                // idle cycle isn't clobbered.
                if io.cancel_event(sockfd, Event::WRITE) {
                    flag.store(true, Ordering::SeqCst);
                }
            },
            weak,
            false,
        )
    });

    if io.add_event(sockfd, Event::WRITE, None).is_err() {
        if let Some(t) = &timer {
            t.cancel();
        }
        Errno(libc::EBADF).set();
        return -1;
    }

    Fiber::yield_hold();

    if let Some(t) = &timer {
        t.cancel();
    }
    if cancelled.load(Ordering::SeqCst) {
        Errno(libc::ETIMEDOUT).set();
        return -1;
    }

    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rc = (REAL.getsockopt_f)(
        sockfd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut c_int as *mut c_void,
        &mut len,
    );
    if rc == -1 {
        return -1;
    }
    if error != 0 {
        Errno(error).set();
        return -1;
    }
    0
}

#[no_mangle]
pub unsafe extern "C" fn connect(
    sockfd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> c_int {
    connect_with_timeout(sockfd, addr, addrlen, connect_timeout_ms())
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if is_hook_enabled() {
        if fdmanager::global().get(fd, false).is_some() {
            if let Some(io) = IOManager::current() {
                io.cancel_all_event(fd);
            }
            fdmanager::global().remove(fd);
        }
    }
    (REAL.close_f)(fd)
}

// ---------------------------------------------------------------------
// read family
// ---------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    io_action(fd, Event::READ, TimeoutKind::Recv, || {
        (REAL.read_f)(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    io_action(fd, Event::READ, TimeoutKind::Recv, || {
        (REAL.readv_f)(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    io_action(sockfd, Event::READ, TimeoutKind::Recv, || {
        (REAL.recv_f)(sockfd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    io_action(sockfd, Event::READ, TimeoutKind::Recv, || {
        (REAL.recvfrom_f)(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(sockfd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    io_action(sockfd, Event::READ, TimeoutKind::Recv, || {
        (REAL.recvmsg_f)(sockfd, msg, flags)
    })
}

// ---------------------------------------------------------------------
// write family
// ---------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    io_action(fd, Event::WRITE, TimeoutKind::Send, || {
        (REAL.write_f)(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    io_action(fd, Event::WRITE, TimeoutKind::Send, || {
        (REAL.writev_f)(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    io_action(sockfd, Event::WRITE, TimeoutKind::Send, || {
        (REAL.send_f)(sockfd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    io_action(sockfd, Event::WRITE, TimeoutKind::Send, || {
        (REAL.sendto_f)(sockfd, buf, len, flags, dest_addr, addrlen)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(sockfd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    io_action(sockfd, Event::WRITE, TimeoutKind::Send, || {
        (REAL.sendmsg_f)(sockfd, msg, flags)
    })
}

// ---------------------------------------------------------------------
// fd flags / options
// ---------------------------------------------------------------------

/// `fd`'s `O_NONBLOCK`/`FIONBIO` bookkeeping in [`fdmanager`] applies
/// regardless of [`is_hook_enabled`] — it's metadata a later hooked call
/// (possibly on a different, hook-enabled thread) needs to see, not an
/// I/O operation that itself needs to park a fiber.
#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let requested = arg as c_int;
            let ctx = match fdmanager::global().get(fd, false) {
                Some(ctx) if !ctx.is_close() && ctx.is_socket() => ctx,
                _ => return (REAL.fcntl_f)(fd, cmd, arg),
            };
            ctx.set_user_nonblock(requested & libc::O_NONBLOCK != 0);
            let real_arg = if ctx.system_nonblock() {
                requested | libc::O_NONBLOCK
            } else {
                requested & !libc::O_NONBLOCK
            };
            (REAL.fcntl_f)(fd, cmd, real_arg as c_long)
        }
        libc::F_GETFL => {
            let flags = (REAL.fcntl_f)(fd, cmd, 0);
            match fdmanager::global().get(fd, false) {
                Some(ctx) if !ctx.is_close() && ctx.is_socket() && ctx.user_nonblock() => {
                    flags | libc::O_NONBLOCK
                }
                Some(ctx) if !ctx.is_close() && ctx.is_socket() => flags & !libc::O_NONBLOCK,
                _ => flags,
            }
        }
        _ => (REAL.fcntl_f)(fd, cmd, arg),
    }
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: c_long) -> c_int {
    if request == libc::FIONBIO as c_ulong && arg != 0 {
        let user_nonblock = *(arg as *const c_int) != 0;
        if let Some(ctx) = fdmanager::global().get(fd, false) {
            if !ctx.is_close() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    (REAL.ioctl_f)(fd, request, arg)
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    (REAL.getsockopt_f)(sockfd, level, optname, optval, optlen)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enabled() && level == libc::SOL_SOCKET && !optval.is_null() {
        if let Some(kind) = TimeoutKind::from_sockopt(optname) {
            if let Some(ctx) = fdmanager::global().get(sockfd, false) {
                if !ctx.is_close() && ctx.is_socket() {
                    let tv = &*(optval as *const timeval);
                    let timeout_ms = (tv.tv_sec as u64) * 1000 + (tv.tv_usec as u64) / 1000;
                    ctx.set_timeout(kind, timeout_ms);
                }
            }
        }
    }
    (REAL.setsockopt_f)(sockfd, level, optname, optval, optlen)
}
