//! Runtime-wide configuration.
//!
//! Deliberately small: this crate's Non-goals keep YAML/env parsing out of
//! scope, so [`Config`] is plain data, built either with [`Default`] or the
//! [`Builder`].

use std::time::Duration;

/// Default stack size for a newly created [`crate::fiber::Fiber`] (128 KiB,
/// per the data model).
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Maximum number of events drained from a single `epoll_wait` call.
pub const MAX_EPOLL_EVENTS: usize = 256;

/// Upper bound on how long `idle()` may block in `epoll_wait`, even if no
/// timer is due sooner. Bounds the staleness of a `tickle()` that raced the
/// self-pipe registration.
pub const MAX_IDLE_TIMEOUT_MS: u64 = 3_000;

/// Default global TCP connect timeout used by `connect_with_timeout` when
/// the caller doesn't override it.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Process/scheduler-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) default_stack_size: usize,
    pub(crate) worker_threads: usize,
    pub(crate) use_caller: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) max_epoll_events: usize,
    pub(crate) max_idle_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_stack_size: DEFAULT_STACK_SIZE,
            worker_threads: 1,
            use_caller: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_epoll_events: MAX_EPOLL_EVENTS,
            max_idle_timeout_ms: MAX_IDLE_TIMEOUT_MS,
        }
    }
}

impl Config {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn default_stack_size(&self) -> usize {
        self.default_stack_size
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn use_caller(&self) -> bool {
        self.use_caller
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

/// Builder for [`Config`]. Methods can be chained, one setting per call.
#[derive(Debug, Default)]
pub struct Builder {
    inner: Config,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            inner: Config::default(),
        }
    }

    pub fn default_stack_size(mut self, size: usize) -> Self {
        self.inner.default_stack_size = size;
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "a scheduler needs at least one worker thread");
        self.inner.worker_threads = n;
        self
    }

    pub fn use_caller(mut self, yes: bool) -> Self {
        self.inner.use_caller = yes;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.inner.connect_timeout = timeout;
        self
    }

    pub fn max_epoll_events(mut self, n: usize) -> Self {
        assert!(n > 0);
        self.inner.max_epoll_events = n;
        self
    }

    pub fn max_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.inner.max_idle_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.inner
    }
}
