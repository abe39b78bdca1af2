//! N:M scheduling: a pool of OS worker threads cooperatively running
//! [`crate::fiber::Fiber`]s.
//!
//! Grounded in `original_source`'s `Scheduler` (`include/scheduler.h`,
//! `src/scheduler.cpp`): the task queue, the `use_caller` thread, the
//! `run()` dispatch loop and its READY/HOLD handling, and `tickle`/`idle`
//! as overridable hooks are all carried over. The two differences are
//! forced by the fact that this scheduler is genuinely multi-threaded
//! (the original only ever ran inside a single Tarantool process thread):
//! the task queue is `std::sync::Mutex`-protected instead of the
//! original's fiber-cooperative `Mutex`, and `tickle`/`idle` are an
//! injected [`Idle`] trait object instead of a virtual method, since
//! [`crate::io::IOManager`] composes a `Scheduler` rather than inheriting
//! from it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::fiber::Fiber;

/// Either a constructed [`Fiber`] or a plain closure to wrap in one, plus an
/// optional thread affinity — the original's `FiberAndThread`.
enum Task {
    Fiber(Fiber),
    Callback(Box<dyn FnMut() + Send>),
}

struct QueuedTask {
    task: Task,
    /// `None` means "any worker thread may run this"; `Some(n)` pins it to
    /// worker thread index `n` (the `use_caller` thread is index
    /// `thread_count - 1` when present).
    thread: Option<usize>,
}

/// Hooks a [`Scheduler`] calls when it has nothing to do (`idle`) or wants
/// to wake a sleeping worker up early (`tickle`). `IOManager` implements
/// this to park workers in `epoll_wait` instead of busy-yielding.
pub trait Idle: Send + Sync {
    /// Called once by every scheduler thread whenever the task queue runs
    /// dry. Should return (i.e. yield back to the scheduler fiber) as soon
    /// as there's reason to believe new work might be available.
    fn idle(&self, scheduler: &Scheduler);

    /// Called after a task is queued for a thread that isn't the one
    /// queuing it, so that thread's `idle()` call can wake up promptly.
    fn tickle(&self) {}
}

struct DefaultIdle;

impl Idle for DefaultIdle {
    fn idle(&self, scheduler: &Scheduler) {
        while !scheduler.stopping() {
            Fiber::yield_hold();
        }
    }
}

struct Shared {
    name: String,
    queue: Mutex<Vec<QueuedTask>>,
    thread_count: usize,
    use_caller: bool,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stopping: AtomicBool,
    idle: Arc<dyn Idle>,
    /// Run once, in order, the first time each scheduler thread touches
    /// `run_indexed` — the extension point [`crate::io::IOManager`] uses to
    /// register its own thread-local "current IO manager" and that
    /// `corovisor-hook` uses to flip on its thread-local hook-enabled flag,
    /// without either of those crates being a dependency of this one.
    thread_start_hooks: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Scheduler>> = std::cell::RefCell::new(None);
    /// This thread's worker index within its scheduler, if any — the
    /// pin target `schedule_on(fiber, Some(n))` compares against. Set for
    /// the duration of `run_indexed`.
    static WORKER_INDEX: std::cell::Cell<Option<usize>> = std::cell::Cell::new(None);
}

/// An N:M scheduler: `worker_threads` OS threads, each running fibers
/// pulled off one shared task queue.
///
/// Cloning a `Scheduler` is cheap — it's a handle onto the same shared
/// state, the same way every worker thread in the original saw the same
/// `Scheduler*` through `GetThis()`.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// `worker_threads` must be at least 1. When `use_caller` is `true`,
    /// one of those threads is the thread calling [`Scheduler::run`]
    /// itself (typically the program's main thread) rather than a spawned
    /// one — matching the original's `use_caller` constructor argument.
    pub fn new(worker_threads: usize, use_caller: bool, name: impl Into<String>) -> Self {
        Self::with_idle(worker_threads, use_caller, name, Arc::new(DefaultIdle))
    }

    /// Like [`Scheduler::new`], but with a custom [`Idle`] implementation —
    /// used by [`crate::io::IOManager`] to park idle workers in
    /// `epoll_wait` instead of spin-yielding.
    pub fn with_idle(
        worker_threads: usize,
        use_caller: bool,
        name: impl Into<String>,
        idle: Arc<dyn Idle>,
    ) -> Self {
        assert!(worker_threads > 0, "a scheduler needs at least one thread");
        Scheduler {
            shared: Arc::new(Shared {
                name: name.into(),
                queue: Mutex::new(Vec::new()),
                thread_count: worker_threads,
                use_caller,
                active_count: AtomicUsize::new(0),
                idle_count: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                idle,
                thread_start_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn active_count(&self) -> usize {
        self.shared.active_count.load(Ordering::Relaxed)
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle_count.load(Ordering::Relaxed)
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_count() > 0
    }

    /// Returns the [`Scheduler`] currently running on this thread, if
    /// [`Scheduler::run`] (directly, or via a spawned worker) is on the
    /// call stack.
    pub fn current() -> Option<Scheduler> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// This thread's worker index within whichever scheduler is running on
    /// it, if any — the value [`Scheduler::schedule_on`]'s pin is matched
    /// against. `None` off a scheduler thread.
    pub fn current_thread_index() -> Option<usize> {
        WORKER_INDEX.with(|c| c.get())
    }

    fn set_current(scheduler: Option<Scheduler>) {
        CURRENT.with(|c| *c.borrow_mut() = scheduler);
    }

    /// Queues `fiber` for execution on any worker thread. Must be in
    /// `Init`, `Ready`, or `Hold` state, mirroring the assertion in the
    /// original's `run()` loop.
    pub fn schedule(&self, fiber: Fiber) {
        self.schedule_on(fiber, None);
    }

    /// Like [`Scheduler::schedule`], but pinned to worker thread index
    /// `thread`.
    pub fn schedule_on(&self, fiber: Fiber, thread: Option<usize>) {
        self.enqueue(Task::Fiber(fiber), thread);
    }

    /// Wraps `cb` in a new fiber and queues it, the way the original wraps
    /// a bare `std::function<void()>` task in a fiber inside `run()`.
    pub fn schedule_callback<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.enqueue(Task::Callback(Box::new(cb)), None);
    }

    /// Queues every item of `fibers` in one locked batch, tickling other
    /// threads at most once — the original's iterator-range `scheduler()`
    /// overload.
    pub fn schedule_batch(&self, fibers: impl IntoIterator<Item = Fiber>) {
        let mut need_tickle = false;
        {
            let mut queue = self.shared.queue.lock().unwrap();
            for fiber in fibers {
                need_tickle = Self::enqueue_locked(&mut queue, Task::Fiber(fiber), None) || need_tickle;
            }
        }
        if need_tickle {
            self.tickle();
        }
    }

    fn enqueue(&self, task: Task, thread: Option<usize>) {
        let need_tickle = {
            let mut queue = self.shared.queue.lock().unwrap();
            Self::enqueue_locked(&mut queue, task, thread)
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn enqueue_locked(queue: &mut Vec<QueuedTask>, task: Task, thread: Option<usize>) -> bool {
        let need_tickle = queue.is_empty();
        queue.push(QueuedTask { task, thread });
        need_tickle
    }

    /// Starts `worker_threads - 1` background worker threads (or all of
    /// them, if this scheduler was built with `use_caller = false`). The
    /// caller is still responsible for calling [`Scheduler::run`] itself
    /// when `use_caller` is `true`.
    ///
    /// Spawned workers take indices `0..spawned`; when `use_caller` is
    /// `true`, the caller thread that later calls [`Scheduler::run`] takes
    /// the remaining index `thread_count - 1`. [`Scheduler::schedule_on`]'s
    /// thread-affinity pin is matched against this index.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let spawned = if self.shared.use_caller {
            self.shared.thread_count.saturating_sub(1)
        } else {
            self.shared.thread_count
        };
        let mut handles = Vec::with_capacity(spawned);
        for i in 0..spawned {
            let scheduler = self.clone();
            let name = format!("{}_{}", scheduler.name(), i);
            handles.push(
                std::thread::Builder::new()
                    .name(name)
                    .spawn(move || scheduler.run_indexed(i))
                    .expect("failed to spawn a scheduler worker thread"),
            );
        }
        handles
    }

    /// Runs the dispatch loop on the calling thread until the scheduler
    /// stops and the task queue drains — the original's `Scheduler::run`.
    /// Called directly by the `use_caller` thread; workers spawned by
    /// [`Scheduler::start`] run it through `run_indexed` instead so each
    /// gets its own pin index.
    pub fn run(&self) {
        let index = self.shared.thread_count.saturating_sub(1);
        self.run_indexed(index);
    }

    fn run_indexed(&self, index: usize) {
        WORKER_INDEX.with(|c| c.set(Some(index)));
        for hook in self.shared.thread_start_hooks.lock().unwrap().iter() {
            hook();
        }
        self.run_inner();
        WORKER_INDEX.with(|c| c.set(None));
    }

    /// Registers `hook` to run once on every scheduler thread (spawned
    /// workers and, when `use_caller` is true, the caller thread), right
    /// before that thread's dispatch loop starts. Hooks run in registration
    /// order. Used by [`crate::io::IOManager`] to install its thread-local
    /// "current reactor" handle, and by the separate `corovisor-hook` crate
    /// to flip on its thread-local hook-enabled flag.
    pub fn add_thread_start_hook(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        self.shared.thread_start_hooks.lock().unwrap().push(hook);
    }

    fn run_inner(&self) {
        log::debug!("scheduler '{}' running on this thread", self.shared.name);
        assert!(
            !Fiber::is_scheduler_fiber_registered(),
            "a thread may only run one scheduler's dispatch loop at a time"
        );
        Self::set_current(Some(self.clone()));
        // Task fibers are constructed with `run_in_scheduler = true`
        // (`Fiber::new`'s default), so their `yield_ready`/`yield_hold`
        // always hands control back here — register whichever fiber is
        // already current (the thread-main fiber, since `run` executes
        // directly on it rather than a nested fiber of its own) as that
        // target, mirroring the original's `t_scheduler_fiber`.
        Fiber::set_scheduler_fiber(Fiber::current());

        let idle_fiber = Fiber::new({
            let scheduler = self.clone();
            move || scheduler.shared.idle.idle(&scheduler)
        })
        .expect("failed to create the idle fiber");

        let mut cb_fiber: Option<Fiber> = None;

        loop {
            let picked = self.pick_task();

            match picked {
                Some(Task::Fiber(fiber)) => {
                    self.shared.active_count.fetch_add(1, Ordering::Relaxed);
                    fiber.resume();
                    self.shared.active_count.fetch_sub(1, Ordering::Relaxed);
                    self.requeue_if_ready(&fiber);
                }
                Some(Task::Callback(cb)) => {
                    let fiber = match cb_fiber.take() {
                        Some(existing) => {
                            existing
                                .reset(cb)
                                .expect("failed to reset the scratch callback fiber");
                            existing
                        }
                        None => Fiber::new(cb).expect("failed to create a callback fiber"),
                    };
                    self.shared.active_count.fetch_add(1, Ordering::Relaxed);
                    fiber.resume();
                    self.shared.active_count.fetch_sub(1, Ordering::Relaxed);
                    self.requeue_if_ready(&fiber);
                    // Only a terminal fiber's stack is actually idle and
                    // safe to hand to `reset` next time around; one that
                    // yielded Ready/Hold is still suspended mid-callback
                    // (possibly parked on a hooked I/O wait) and must be
                    // left alone, the same way the original drops its
                    // scratch fiber handle instead of reusing it in that case.
                    if fiber.state().is_terminal() {
                        cb_fiber = Some(fiber);
                    }
                }
                None => {
                    if idle_fiber.state().is_terminal() {
                        log::info!("scheduler '{}' idle fiber terminated, stopping", self.shared.name);
                        break;
                    }
                    self.shared.idle_count.fetch_add(1, Ordering::Relaxed);
                    idle_fiber.resume();
                    self.shared.idle_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        Fiber::clear_scheduler_fiber();
        Self::set_current(None);
    }

    /// Pulls the next runnable task meant for this thread off the queue,
    /// tickling other workers if anything was left behind for them —
    /// mirrors the locked scan in the original's `run()`.
    fn pick_task(&self) -> Option<Task> {
        let current_index = WORKER_INDEX.with(|c| c.get());
        let picked;
        let tickle_others;
        {
            let mut queue = self.shared.queue.lock().unwrap();
            let index = queue
                .iter()
                .position(|queued| Self::thread_matches(queued, current_index));
            picked = index.map(|i| queue.remove(i).task);
            // Only worth tickling if something is left behind that this
            // thread can't take itself (i.e. pinned elsewhere); an
            // unpinned leftover will get picked up by this same thread's
            // next loop iteration.
            tickle_others = queue
                .iter()
                .any(|queued| !Self::thread_matches(queued, current_index));
        }
        if tickle_others {
            self.tickle();
        }
        picked
    }

    /// Thread-affinity pinning is expressed as an opaque `usize` index (see
    /// `schedule_on`/`start`), matched against this thread's own
    /// `WORKER_INDEX` rather than an OS thread id the way the original
    /// compares `getThreadId()` — Rust's `ThreadId` carries no ordinal a
    /// caller could have picked in advance.
    fn thread_matches(queued: &QueuedTask, current_index: Option<usize>) -> bool {
        match queued.thread {
            None => true,
            Some(n) => current_index == Some(n),
        }
    }

    fn requeue_if_ready(&self, fiber: &Fiber) {
        use crate::fiber::State;
        match fiber.state() {
            State::Ready => self.schedule(fiber.clone()),
            State::Term | State::Except => {}
            _ => { /* yielded to Hold: the fiber re-queued itself if it wants to run again */ }
        }
    }

    /// Wakes any worker parked in [`Idle::idle`], e.g. because new work
    /// just arrived. The default [`DefaultIdle`] busy-yields and ignores
    /// this; [`crate::io::IOManager`] overrides it to write to its
    /// self-pipe.
    pub fn tickle(&self) {
        self.shared.idle.tickle();
    }

    /// `true` once [`Scheduler::stop`] has been called and both the task
    /// queue and the active-thread count have drained.
    pub fn stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Relaxed)
            && self.shared.queue.lock().unwrap().is_empty()
            && self.active_count() == 0
    }

    /// Requests a graceful stop: flips the stopping flag and tickles every
    /// worker so its `idle()` loop notices and its dispatch loop drains.
    /// Does not join worker threads; callers that spawned workers via
    /// [`Scheduler::start`] should join the returned handles afterward.
    pub fn stop(&self) {
        log::debug!("scheduler '{}' stopping", self.shared.name);
        self.shared.stopping.store(true, Ordering::Relaxed);
        for _ in 0..self.shared.thread_count {
            self.tickle();
        }
    }
}
