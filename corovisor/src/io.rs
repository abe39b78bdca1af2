//! The epoll reactor: an [`IOManager`] composes a [`Scheduler`] and a
//! [`TimerManager`] the way the original's `IOManager` inherited from both
//! `Scheduler` and `TimerManager` (Rust has no multiple inheritance, so this
//! is composition plus the [`crate::scheduler::Idle`] trait instead).
//!
//! Grounded in `original_source/include/iomanager.h` + `src/iomanager.cpp`:
//! the self-pipe tickle, the per-fd `EventContext`/`FdContext` bookkeeping,
//! `addEvent`/`delEvent`/`cancelEvent`/`cancelAllEvent`, and the `idle()`
//! epoll loop (256 events per wait, a 3 second idle cap) are all carried
//! over line for line.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use once_cell::sync::OnceCell;

use crate::config::{MAX_EPOLL_EVENTS, MAX_IDLE_TIMEOUT_MS};
use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::scheduler::{Idle, Scheduler};
use crate::timer::TimerManager;

bitflags::bitflags! {
    /// Which half of a file descriptor's readiness a caller is waiting on.
    /// Bit positions match `EPOLLIN`/`EPOLLOUT` directly, so an `Event` can
    /// be fed straight into `epoll_event.events`.
    #[derive(Default)]
    pub struct Event: u32 {
        const NONE = 0;
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

/// What to resume when an `Event` fires: either a fiber parked via
/// `add_event(fd, event, None)`, or a plain callback handed to
/// `add_event(fd, event, Some(cb))`. Never both — the original's
/// `EventContext` has the same either/or shape (`fiber` xor `cb`).
#[derive(Default)]
struct EventContext {
    scheduler: Option<Scheduler>,
    fiber: Option<Fiber>,
    cb: Option<Box<dyn FnMut() + Send>>,
}

#[derive(Default)]
struct FdContextState {
    events: Event,
    read: EventContext,
    write: EventContext,
}

struct FdSlot {
    fd: RawFd,
    state: std::sync::Mutex<FdContextState>,
}

/// Sentinel stored in `epoll_event.u64` for the self-pipe registration; no
/// real fd table index ever reaches this value since `fd_contexts` is
/// indexed by (small, non-negative) fd numbers.
const TICKLE_SENTINEL: u64 = u64::MAX;

struct Shared {
    name: String,
    epoll_fd: RawFd,
    tickle_r: RawFd,
    tickle_w: RawFd,
    max_epoll_events: usize,
    max_idle_timeout_ms: u64,
    pending_event_count: AtomicUsize,
    fd_contexts: RwLock<Vec<Arc<FdSlot>>>,
    timers: TimerManager,
    scheduler: OnceCell<Scheduler>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.tickle_r);
            libc::close(self.tickle_w);
        }
    }
}

impl Shared {
    /// Writes one byte to the self-pipe if a worker thread is actually
    /// parked in `epoll_wait` — mirrors the original's `hasIdleThreads()`
    /// guard in `tickle()`, avoiding pointless wakeups.
    fn tickle(&self) {
        let should_tickle = self
            .scheduler
            .get()
            .map(|s| s.has_idle_threads())
            .unwrap_or(false);
        if !should_tickle {
            return;
        }
        let byte = [1u8];
        unsafe {
            libc::write(self.tickle_w, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    fn scheduler(&self) -> Scheduler {
        self.scheduler
            .get()
            .cloned()
            .expect("IOManager's scheduler is set before any event can be registered")
    }

    fn event_ctx<'a>(state: &'a mut FdContextState, event: Event) -> &'a mut EventContext {
        if event == Event::READ {
            &mut state.read
        } else if event == Event::WRITE {
            &mut state.write
        } else {
            panic!("event must be exactly READ or WRITE, got {event:?}");
        }
    }

    /// Hands the fiber or callback parked on `event` back to the scheduler
    /// it was registered from, clearing the slot — the original's
    /// `triggerEvent`.
    fn trigger(&self, state: &mut FdContextState, event: Event) {
        let ctx = Self::event_ctx(state, event);
        let scheduler = ctx.scheduler.take().unwrap_or_else(|| self.scheduler());
        let fiber = ctx.fiber.take();
        let cb = ctx.cb.take();
        match (fiber, cb) {
            (Some(fiber), None) => scheduler.schedule(fiber),
            (None, Some(cb)) => scheduler.schedule_callback(cb),
            (None, None) => log::warn!("triggerEvent fired with nothing registered to resume"),
            (Some(_), Some(_)) => unreachable!("an EventContext never holds both a fiber and a callback"),
        }
    }

    fn ensure_fd_slot(&self, fd: RawFd) -> Arc<FdSlot> {
        let idx = fd as usize;
        {
            let table = self.fd_contexts.read().unwrap();
            if idx < table.len() {
                return table[idx].clone();
            }
        }
        let mut table = self.fd_contexts.write().unwrap();
        if idx >= table.len() {
            // Same 1.5x growth factor as the original's `fdContextsResize`.
            let new_len = ((idx + 1) * 3 / 2).max(table.len() + 1);
            for i in table.len()..new_len {
                table.push(Arc::new(FdSlot {
                    fd: i as RawFd,
                    state: std::sync::Mutex::new(FdContextState::default()),
                }));
            }
        }
        table[idx].clone()
    }

    fn fd_slot(&self, fd: RawFd) -> Option<Arc<FdSlot>> {
        let table = self.fd_contexts.read().unwrap();
        table.get(fd as usize).cloned()
    }
}

/// Parks idle worker threads in `epoll_wait` instead of busy-yielding —
/// installed as the [`Scheduler`]'s [`Idle`] implementation by
/// [`IOManager::new`].
struct ReactorIdle(Weak<Shared>);

impl Idle for ReactorIdle {
    fn idle(&self, scheduler: &Scheduler) {
        let Some(shared) = self.0.upgrade() else { return };
        shared.idle_loop(scheduler);
    }

    fn tickle(&self) {
        if let Some(shared) = self.0.upgrade() {
            shared.tickle();
        }
    }
}

impl Shared {
    /// The reactor's main loop: one iteration is "block in `epoll_wait` for
    /// at most the next timer's deadline (capped at `max_idle_timeout_ms`),
    /// then run whatever that produced" — the original's `IOManager::idle`.
    /// Returns (i.e. yields back to the scheduler) after every iteration so
    /// `Scheduler::run` rechecks its task queue.
    fn idle_loop(&self, scheduler: &Scheduler) {
        let mut events: Vec<libc::epoll_event> =
            vec![unsafe { std::mem::zeroed() }; self.max_epoll_events];

        loop {
            let next_timer_ms = self.timers.next_timer_ms();
            if next_timer_ms.is_none()
                && self.pending_event_count.load(Ordering::Relaxed) == 0
                && scheduler.stopping()
            {
                log::debug!("io manager '{}' idle loop exiting: stopping", self.name);
                return;
            }

            let timeout_ms = next_timer_ms
                .map(|t| t.min(self.max_idle_timeout_ms))
                .unwrap_or(self.max_idle_timeout_ms);

            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epoll_fd,
                        events.as_mut_ptr(),
                        events.len() as i32,
                        timeout_ms as i32,
                    )
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                log::warn!("epoll_wait on '{}' failed: {err}", self.name);
                break 0;
            };

            for cb in self.timers.list_expired() {
                scheduler.schedule_callback(cb);
            }

            for event in &events[..n] {
                let u64_tag = event.u64;
                if u64_tag == TICKLE_SENTINEL {
                    self.drain_tickle_pipe();
                    continue;
                }
                self.handle_fd_event(event, u64_tag as usize);
            }

            Fiber::yield_hold();
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(self.tickle_r, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn handle_fd_event(&self, event: &libc::epoll_event, fd_idx: usize) {
        let Some(slot) = self.fd_slot(fd_idx as RawFd) else {
            log::warn!("epoll event for untracked fd {fd_idx}");
            return;
        };
        let mut state = slot.state.lock().unwrap();
        if state.events.is_empty() {
            return;
        }

        let raw_events = event.events;
        let mut real_events = Event::from_bits_truncate(raw_events) & state.events;
        if raw_events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
            real_events |= state.events;
        }
        if real_events.is_empty() {
            return;
        }

        let remaining = state.events & !real_events;
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut rearm = libc::epoll_event {
            events: remaining.bits() | libc::EPOLLET as u32,
            u64: fd_idx as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, slot.fd, &mut rearm) };
        if rc != 0 {
            log::warn!(
                "epoll_ctl re-arm on fd {} failed: {}",
                slot.fd,
                std::io::Error::last_os_error()
            );
            return;
        }
        state.events = remaining;

        if real_events.contains(Event::READ) {
            self.trigger(&mut state, Event::READ);
            self.pending_event_count.fetch_sub(1, Ordering::Relaxed);
        }
        if real_events.contains(Event::WRITE) {
            self.trigger(&mut state, Event::WRITE);
            self.pending_event_count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// An epoll-backed reactor: an N:M [`Scheduler`] whose idle worker threads
/// block in `epoll_wait`, plus a [`TimerManager`] whose expirations and
/// whose "new earliest timer" events both route through the same self-pipe
/// tickle. Grounded in the original's `IOManager`.
///
/// Cloning an `IOManager` is cheap — same handle-onto-shared-state pattern
/// as [`Scheduler`] and [`TimerManager`].
#[derive(Clone)]
pub struct IOManager {
    scheduler: Scheduler,
    shared: Arc<Shared>,
}

thread_local! {
    /// The `IOManager` whose `run()`/`start()` thread this is, if any — set
    /// via a [`Scheduler`] thread-start hook installed in `new_inner`, the
    /// replacement for the original's `IOManager::GetThis()` (itself built
    /// on `Scheduler::GetThis()`'s thread-local, since `IOManager` doesn't
    /// get to *be* a `Scheduler` in Rust the way it inherited from one in
    /// C++). The hook layer's `io_action` reads this to find where to
    /// register events and timers on behalf of the current fiber.
    static CURRENT_IO: std::cell::RefCell<Option<IOManager>> = std::cell::RefCell::new(None);
}

impl IOManager {
    /// The `IOManager` running on this thread, if [`IOManager::run`]
    /// (directly, or via a worker spawned by [`IOManager::start`]) is on
    /// the call stack.
    pub fn current() -> Option<IOManager> {
        CURRENT_IO.with(|c| c.borrow().clone())
    }

    fn set_current(io: Option<IOManager>) {
        CURRENT_IO.with(|c| *c.borrow_mut() = io);
    }

    /// `worker_threads`/`use_caller`/`name` are forwarded to the underlying
    /// [`Scheduler`]; event batch size and idle cap use
    /// [`MAX_EPOLL_EVENTS`]/[`MAX_IDLE_TIMEOUT_MS`]. Use
    /// [`IOManager::with_config`] to override those.
    pub fn new(worker_threads: usize, use_caller: bool, name: impl Into<String>) -> Result<Self> {
        Self::new_inner(
            worker_threads,
            use_caller,
            name.into(),
            MAX_EPOLL_EVENTS,
            MAX_IDLE_TIMEOUT_MS,
        )
    }

    /// Like [`IOManager::new`], but takes batch size and idle cap from a
    /// [`crate::Config`] instead of the crate-wide defaults.
    pub fn with_config(config: &crate::Config, name: impl Into<String>) -> Result<Self> {
        Self::new_inner(
            config.worker_threads(),
            config.use_caller(),
            name.into(),
            config.max_epoll_events,
            config.max_idle_timeout_ms,
        )
    }

    fn new_inner(
        worker_threads: usize,
        use_caller: bool,
        name: String,
        max_epoll_events: usize,
        max_idle_timeout_ms: u64,
    ) -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::ReactorInit(std::io::Error::last_os_error()));
        }

        let mut pipe_fds = [0i32; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(Error::ReactorInit(err));
        }
        let (tickle_r, tickle_w) = (pipe_fds[0], pipe_fds[1]);

        // Only the read end needs to be non-blocking: `idle_loop` drains it
        // in a loop until empty, matching the original.
        let flags = unsafe { libc::fcntl(tickle_r, libc::F_GETFL, 0) };
        unsafe { libc::fcntl(tickle_r, libc::F_SETFL, flags | libc::O_NONBLOCK) };

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let hook_weak = weak.clone();
            Shared {
                name: name.clone(),
                epoll_fd,
                tickle_r,
                tickle_w,
                max_epoll_events,
                max_idle_timeout_ms,
                pending_event_count: AtomicUsize::new(0),
                fd_contexts: RwLock::new(Vec::new()),
                timers: TimerManager::with_hook(Arc::new(move || {
                    if let Some(shared) = hook_weak.upgrade() {
                        shared.tickle();
                    }
                })),
                scheduler: OnceCell::new(),
            }
        });

        let mut tickle_event = libc::epoll_event {
            events: libc::EPOLLIN as u32 | libc::EPOLLET as u32,
            u64: TICKLE_SENTINEL,
        };
        let rc = unsafe {
            libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, tickle_r, &mut tickle_event)
        };
        if rc != 0 {
            return Err(Error::ReactorInit(std::io::Error::last_os_error()));
        }

        let idle = Arc::new(ReactorIdle(Arc::downgrade(&shared)));
        let scheduler = Scheduler::with_idle(worker_threads, use_caller, name, idle);
        shared
            .scheduler
            .set(scheduler.clone())
            .unwrap_or_else(|_| unreachable!("scheduler is only ever set once, here"));

        let io = IOManager { scheduler, shared };
        let io_for_hook = io.clone();
        io.scheduler
            .add_thread_start_hook(Arc::new(move || IOManager::set_current(Some(io_for_hook.clone()))));

        Ok(io)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn start(&self) -> Vec<std::thread::JoinHandle<()>> {
        self.scheduler.start()
    }

    pub fn run(&self) {
        self.scheduler.run()
    }

    pub fn stop(&self) {
        self.scheduler.stop()
    }

    /// `true` once [`IOManager::stop`] has been requested, there are no
    /// pending timers or fd events left, and the underlying scheduler has
    /// drained. Does not consume the timer manager's tickle latch, unlike
    /// the internal idle-loop check.
    pub fn stopping(&self) -> bool {
        !self.shared.timers.has_timer()
            && self.shared.pending_event_count.load(Ordering::Relaxed) == 0
            && self.scheduler.stopping()
    }

    pub fn timers(&self) -> &TimerManager {
        &self.shared.timers
    }

    /// Registers interest in `event` on `fd`. When `cb` is `None`, the
    /// *currently executing* fiber is parked and resumed when the event
    /// fires (the typical hook-layer usage: call `add_event`, then
    /// `Fiber::yield_hold()`); when `Some`, that callback runs instead and
    /// no fiber is involved.
    ///
    /// `event` must be exactly [`Event::READ`] or [`Event::WRITE`], and
    /// must not already be registered on `fd` — both are programmer errors,
    /// matching the assertions in the original's `addEvent`.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        cb: Option<Box<dyn FnMut() + Send>>,
    ) -> Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "event must be exactly READ or WRITE, got {event:?}"
        );
        let slot = self.shared.ensure_fd_slot(fd);
        let mut state = slot.state.lock().unwrap();
        assert!(
            !state.events.contains(event),
            "fd {fd} already has {event:?} registered"
        );

        let new_events = state.events | event;
        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: new_events.bits() | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.shared.epoll_fd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(Error::EpollCtl {
                op: if op == libc::EPOLL_CTL_ADD { "ADD" } else { "MOD" },
                fd,
                source: std::io::Error::last_os_error(),
            });
        }

        state.events = new_events;
        self.shared.pending_event_count.fetch_add(1, Ordering::Relaxed);

        let ctx = Shared::event_ctx(&mut state, event);
        ctx.scheduler = Scheduler::current().or_else(|| self.shared.scheduler.get().cloned());
        match cb {
            Some(cb) => ctx.cb = Some(cb),
            None => ctx.fiber = Some(Fiber::current()),
        }
        Ok(())
    }

    /// Removes interest in `event` on `fd` without resuming whatever was
    /// waiting on it. Returns `false` if `fd`/`event` wasn't registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(slot) = self.shared.fd_slot(fd) else { return false };
        let mut state = slot.state.lock().unwrap();
        if !state.events.contains(event) {
            return false;
        }
        let remaining = state.events & !event;
        if !self.rearm(fd, remaining) {
            return false;
        }
        state.events = remaining;
        self.shared.pending_event_count.fetch_sub(1, Ordering::Relaxed);
        *Shared::event_ctx(&mut state, event) = EventContext::default();
        true
    }

    /// Removes interest in `event` on `fd` and immediately resumes whatever
    /// was waiting on it, as if the event had actually fired. Returns
    /// `false` if `fd`/`event` wasn't registered.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(slot) = self.shared.fd_slot(fd) else { return false };
        let mut state = slot.state.lock().unwrap();
        if !state.events.contains(event) {
            return false;
        }
        let remaining = state.events & !event;
        if !self.rearm(fd, remaining) {
            return false;
        }
        state.events = remaining;
        self.shared.trigger(&mut state, event);
        self.shared.pending_event_count.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Cancels every event registered on `fd`, resuming anything waiting on
    /// either half. Returns `false` if nothing was registered.
    pub fn cancel_all_event(&self, fd: RawFd) -> bool {
        let Some(slot) = self.shared.fd_slot(fd) else { return false };
        let mut state = slot.state.lock().unwrap();
        if state.events.is_empty() {
            return false;
        }
        let rc = unsafe {
            libc::epoll_ctl(self.shared.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc != 0 {
            log::warn!(
                "epoll_ctl(DEL) on fd {fd} failed: {}",
                std::io::Error::last_os_error()
            );
            return false;
        }
        if state.events.contains(Event::READ) {
            self.shared.trigger(&mut state, Event::READ);
            self.shared.pending_event_count.fetch_sub(1, Ordering::Relaxed);
        }
        if state.events.contains(Event::WRITE) {
            self.shared.trigger(&mut state, Event::WRITE);
            self.shared.pending_event_count.fetch_sub(1, Ordering::Relaxed);
        }
        state.events = Event::NONE;
        true
    }

    fn rearm(&self, fd: RawFd, remaining: Event) -> bool {
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: remaining.bits() | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.shared.epoll_fd, op, fd, &mut ev) };
        if rc != 0 {
            log::warn!(
                "epoll_ctl re-arm on fd {fd} failed: {}",
                std::io::Error::last_os_error()
            );
        }
        rc == 0
    }
}
