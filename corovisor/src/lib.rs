//! `corovisor`: an N:M stackful-coroutine scheduling core.
//!
//! The crate is built up in the same layers the original C++ framework
//! used, each one a thin module:
//!
//! - [`fiber`] — stackful coroutines switched with `ucontext`.
//! - [`timer`] — a deadline-ordered heap of one-shot/recurring timers.
//! - [`scheduler`] — an N:M pool of OS worker threads running [`fiber::Fiber`]s.
//! - [`io`] — an epoll reactor built on [`scheduler::Scheduler`] and
//!   [`timer::TimerManager`], the thing that actually suspends a fiber on a
//!   file descriptor.
//! - [`fdmanager`] — process-wide bookkeeping of per-fd state (is this a
//!   socket, has the user asked for non-blocking mode, what's the read/write
//!   timeout).
//!
//! None of these modules know about `LD_PRELOAD` or libc symbol
//! interception; that lives in the separate `corovisor-hook` crate, built on
//! top of this one.
//!
//! # Error handling
//! Fallible operations return [`Result`]/[`Error`] (see [`error`]).
//! Programmer misuse (resuming an executing fiber, scheduling after
//! `stop()`) is reported with `assert!`/`panic!` instead, matching the
//! invariants documented on each type.
//!
//! # Logging
//! The crate only depends on the `log` facade and never installs a logger;
//! binaries embedding it should initialize one (`env_logger`, etc.) the same
//! way a Tarantool module leaves logger wiring to its host process.

pub mod config;
pub mod error;
pub mod fdmanager;
pub mod fiber;
pub mod io;
pub mod scheduler;
pub mod timer;

pub use config::Config;
pub use error::{Error, Result};
