//! Stackful user-space coroutines.
//!
//! With the fiber module you can create, run, and manage [`Fiber`]s: units
//! of cooperative multitasking that each carry their own machine context and
//! heap-allocated stack. A fiber holds its OS thread until it explicitly
//! [`yield_ready`] or [`yield_hold`]s (or a [hooked][crate] syscall does so
//! on its behalf); there is no preemption.
//!
//! Three thread-local references exist per OS thread: the *current fiber*,
//! the *thread-main fiber* (the bootstrap context adopting the OS-provided
//! stack, created lazily on first use), and the *scheduler fiber* (set by
//! [`crate::scheduler::Scheduler::run`] while its dispatch loop is active).
//! A fiber's [`yield_ready`]/[`yield_hold`] always hands control back to
//! exactly one of the latter two, chosen by its `run_in_scheduler` flag.
//!
//! See also: [`crate::scheduler`], [`crate::timer`], [`crate::io`].

mod context;

use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use context::RawContext;

use crate::config::DEFAULT_STACK_SIZE;
use crate::error::Result;

/// A fiber's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed (or reset), not yet resumed.
    Init,
    /// Yielded and self-re-enqueued; expected to run again soon.
    Ready,
    /// Currently executing on some OS thread.
    Exec,
    /// Yielded without being re-enqueued; something else (an event, a
    /// timer) is responsible for scheduling it again.
    Hold,
    /// The callable returned normally.
    Term,
    /// The callable panicked.
    Except,
}

impl State {
    /// `true` for INIT/TERM/EXCEPT, the states from which [`Fiber::reset`]
    /// is permitted.
    pub fn is_resettable(self) -> bool {
        matches!(self, State::Init | State::Term | State::Except)
    }

    /// `true` for TERM/EXCEPT: the fiber ran its callable to completion (one
    /// way or another) and will not run again without a `reset`.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Term | State::Except)
    }
}

struct Inner {
    id: u64,
    state: Cell<State>,
    run_in_scheduler: Cell<bool>,
    /// `None` for the thread-main fiber, which adopts the OS stack instead
    /// of owning one.
    stack: RefCell<Option<Box<[u8]>>>,
    ctx: UnsafeCell<RawContext>,
    callable: RefCell<Option<Box<dyn FnMut() + Send>>>,
}

/// A stackful coroutine. Cheaply cloneable (it's a handle; the underlying
/// stack and context are shared, never copied).
///
/// A `Fiber` is movable between OS threads — [`crate::scheduler::Scheduler`]
/// is N:M, so a fiber parked in its task queue may be popped and resumed by
/// whichever worker thread gets to it, same as the original's
/// `shared_ptr<Fiber>` tasks. It is deliberately *not* `Sync`: nothing about
/// a fiber's state is safe to touch from two threads at once, only to hand
/// off from one to another.
#[derive(Clone)]
pub struct Fiber(Arc<Inner>);

// SAFETY: `Inner`'s interior mutability (`Cell`/`RefCell`/`UnsafeCell`) is
// only ever touched by whichever single OS thread currently holds a live,
// executing reference to this fiber (the thread running `resume()`/
// `yield_ready()`/`yield_hold()` on it, or mutating it from `reset()` while
// it's provably idle in Init/Term/Except). A queued-but-not-running `Fiber`
// handle has no outstanding aliases on another thread, so moving it wholesale
// into a new owning thread via `Send` never creates concurrent access; that
// is precisely what `Sync` (deliberately not implemented) would permit and
// what this type must forbid.
unsafe impl Send for Fiber {}

impl Debug for Fiber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.0.id)
            .field("state", &self.0.state.get())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Fiber {}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static TOTAL_FIBERS: AtomicU64 = AtomicU64::new(0);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static CURRENT: RefCell<Option<Fiber>> = RefCell::new(None);
    static THREAD_MAIN: RefCell<Option<Fiber>> = RefCell::new(None);
    static SCHEDULER_FIBER: RefCell<Option<Fiber>> = RefCell::new(None);
}

/// Lazily constructs the thread-main fiber the first time a thread touches
/// the fiber subsystem, per the bootstrap rule in the data model.
fn ensure_bootstrap() {
    THREAD_MAIN.with(|slot| {
        if slot.borrow().is_some() {
            return;
        }
        let main = Fiber(Arc::new(Inner {
            id: next_id(),
            state: Cell::new(State::Exec),
            run_in_scheduler: Cell::new(false),
            stack: RefCell::new(None),
            ctx: UnsafeCell::new(RawContext::uninit()),
            callable: RefCell::new(None),
        }));
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        *slot.borrow_mut() = Some(main.clone());
        CURRENT.with(|c| *c.borrow_mut() = Some(main));
    });
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

extern "C" fn trampoline() {
    // `resume()` set CURRENT to this fiber before swapping in, so it's
    // always correctly populated the first time control reaches here.
    let fiber = CURRENT
        .with(|c| c.borrow().clone())
        .expect("trampoline entered without a current fiber");

    let cb = fiber.0.callable.borrow_mut().take();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        if let Some(mut cb) = cb {
            cb();
        }
    }));

    match outcome {
        Ok(()) => fiber.0.state.set(State::Term),
        Err(payload) => {
            log::error!(
                "fiber {} terminated with an exception: {}",
                fiber.0.id,
                panic_message(&payload)
            );
            fiber.0.state.set(State::Except);
        }
    }

    swap_out_to_caller(&fiber);
    unreachable!("a terminated fiber must not be resumed again without reset()");
}

/// Swaps execution away from `cur` into whichever of the thread-main or
/// scheduler fiber `cur.run_in_scheduler` designates, per spec. Does not
/// touch `cur`'s state; callers set that first.
fn swap_out_to_caller(cur: &Fiber) {
    let target = if cur.0.run_in_scheduler.get() {
        SCHEDULER_FIBER
            .with(|c| c.borrow().clone())
            .expect("no scheduler fiber registered on this thread")
    } else {
        ensure_bootstrap();
        THREAD_MAIN.with(|c| c.borrow().clone()).unwrap()
    };
    CURRENT.with(|c| *c.borrow_mut() = Some(target.clone()));
    CSW.with(|c| c.set(c.get() + 1));
    // SAFETY: each Fiber's context is only ever touched by the resume/yield
    // pair that is actively switching into or out of it; a fiber cannot be
    // resumed while it (or anything it transitively resumed) is executing,
    // so `cur` and `target` never alias the same context concurrently from
    // two different Rust call frames despite the switch being reentrant at
    // the machine-context level.
    unsafe {
        let cur_ctx = &mut *cur.0.ctx.get();
        let target_ctx = &*target.0.ctx.get();
        RawContext::swap(cur_ctx, target_ctx);
    }
}

impl Fiber {
    /// Creates a new fiber with the default stack size
    /// ([`crate::config::DEFAULT_STACK_SIZE`]).
    pub fn new<F>(callable: F) -> Result<Fiber>
    where
        F: FnMut() + Send + 'static,
    {
        Fiber::with_stack_size(callable, DEFAULT_STACK_SIZE, true)
    }

    /// Creates a new fiber with an explicit stack size and
    /// `run_in_scheduler` flag (see the module docs).
    pub fn with_stack_size<F>(callable: F, stack_size: usize, run_in_scheduler: bool) -> Result<Fiber>
    where
        F: FnMut() + Send + 'static,
    {
        ensure_bootstrap();
        let mut stack = vec![0u8; stack_size].into_boxed_slice();
        let fiber = Fiber(Arc::new(Inner {
            id: next_id(),
            state: Cell::new(State::Init),
            run_in_scheduler: Cell::new(run_in_scheduler),
            stack: RefCell::new(None),
            ctx: UnsafeCell::new(RawContext::uninit()),
            callable: RefCell::new(Some(Box::new(callable))),
        }));
        unsafe {
            (*fiber.0.ctx.get()).init(&mut stack, trampoline)?;
        }
        *fiber.0.stack.borrow_mut() = Some(stack);
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        Ok(fiber)
    }

    /// Rebinds `callable` and reinitializes the machine context over the
    /// same stack buffer. Requires `state()` to be one of INIT, TERM, EXCEPT.
    pub fn reset<F>(&self, callable: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let state = self.0.state.get();
        assert!(
            state.is_resettable(),
            "cannot reset fiber {} in state {:?}",
            self.0.id,
            state
        );
        let mut stack_slot = self.0.stack.borrow_mut();
        let stack = stack_slot
            .as_mut()
            .expect("the thread-main fiber cannot be reset");
        unsafe {
            (*self.0.ctx.get()).init(stack, trampoline)?;
        }
        *self.0.callable.borrow_mut() = Some(Box::new(callable));
        self.0.state.set(State::Init);
        Ok(())
    }

    /// Transfers control from the caller (the thread-main fiber or the
    /// scheduler fiber, whichever is currently executing) into this fiber.
    /// Requires `state() != Exec`.
    pub fn resume(&self) {
        ensure_bootstrap();
        let state = self.0.state.get();
        assert_ne!(
            state,
            State::Exec,
            "fiber {} is already executing",
            self.0.id
        );
        let prev = CURRENT
            .with(|c| c.borrow().clone())
            .expect("current fiber not initialized");
        self.0.state.set(State::Exec);
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        CSW.with(|c| c.set(c.get() + 1));
        // SAFETY: see the comment in `swap_out_to_caller`.
        unsafe {
            let prev_ctx = &mut *prev.0.ctx.get();
            let this_ctx = &*self.0.ctx.get();
            RawContext::swap(prev_ctx, this_ctx);
        }
    }

    /// This fiber's unique, monotonically assigned id.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// This fiber's current lifecycle state.
    pub fn state(&self) -> State {
        self.0.state.get()
    }

    /// Yields the *current* fiber back to its caller, marking it READY (it
    /// is the caller's job to resume it again soon; the scheduler does this
    /// automatically for queued tasks).
    pub fn yield_ready() {
        ensure_bootstrap();
        let cur = CURRENT.with(|c| c.borrow().clone()).unwrap();
        cur.0.state.set(State::Ready);
        swap_out_to_caller(&cur);
    }

    /// Yields the *current* fiber back to its caller, marking it HOLD (it
    /// will not be resumed again until some event or timer re-enqueues it).
    pub fn yield_hold() {
        ensure_bootstrap();
        let cur = CURRENT.with(|c| c.borrow().clone()).unwrap();
        cur.0.state.set(State::Hold);
        swap_out_to_caller(&cur);
    }

    /// Returns a handle to the fiber currently executing on this thread,
    /// constructing the thread-main fiber if this thread hasn't touched the
    /// fiber subsystem yet.
    pub fn current() -> Fiber {
        ensure_bootstrap();
        CURRENT.with(|c| c.borrow().clone().unwrap())
    }

    /// Shorthand for `Fiber::current().id()`.
    pub fn current_id() -> u64 {
        Fiber::current().id()
    }

    /// The total number of fibers ever constructed in this process
    /// (including thread-main fibers), for diagnostics and tests.
    pub fn total_count() -> u64 {
        TOTAL_FIBERS.load(Ordering::Relaxed)
    }

    /// Registers `fiber` as the scheduler fiber for the calling thread.
    /// Called by [`crate::scheduler::Scheduler::run`].
    pub(crate) fn set_scheduler_fiber(fiber: Fiber) {
        SCHEDULER_FIBER.with(|c| *c.borrow_mut() = Some(fiber));
    }

    /// Clears the scheduler-fiber registration for the calling thread.
    pub(crate) fn clear_scheduler_fiber() {
        SCHEDULER_FIBER.with(|c| *c.borrow_mut() = None);
    }

    pub(crate) fn is_scheduler_fiber_registered() -> bool {
        SCHEDULER_FIBER.with(|c| c.borrow().is_some())
    }
}

/// The number of context switches the calling thread has performed, tracked
/// purely for tests (mirrors the teacher crate's `fiber::csw`, itself
/// standing in for the original's `Fiber::TotalFibers`/csw diagnostics).
pub fn csw() -> u64 {
    CSW.with(|c| c.get())
}

thread_local! {
    static CSW: Cell<u64> = Cell::new(0);
}

/// Calls `f` and reports whether it caused the calling fiber to yield (i.e.
/// a context switch occurred), for tests.
pub fn check_yield<F, T>(f: F) -> (T, bool)
where
    F: FnOnce() -> T,
{
    let before = csw();
    let result = f();
    (result, csw() != before)
}
