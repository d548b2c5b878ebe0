//! User-level tasks ("uthreads"), spec.md §3, §4.1.
//!
//! A uthread is a stackful coroutine bound to exactly one worker for its
//! whole life. Suspension is cooperative: the running uthread calls one of
//! the `wait_*` functions, which records why it's waiting in
//! [`UthreadState`] and yields control back to the worker loop. The worker
//! decides what's runnable again using the predicate from spec.md §4.1; it
//! never inspects *why* a uthread yielded beyond that state.
//!
//! Context switching itself is delegated to [`corosensei`], a stackful
//! coroutine library, rather than a hand-written per-architecture
//! `ucontext`/`asm!` port.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::config::Config;

pub type TaskId = u64;

/// Why a uthread yielded control to its worker. Mirrors spec.md §3's state
/// set; `Uninitialised`/`NotStarted` are not yield reasons (a uthread only
/// yields after it has started running).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UthreadState {
    Uninitialised = 0,
    NotStarted = 1,
    Running = 2,
    WaitingData = 3,
    WaitingMtasks = 4,
    WaitingHandle = 5,
    Throttling = 6,
    Finished = 7,
}

impl UthreadState {
    fn from_u8(v: u8) -> UthreadState {
        match v {
            0 => UthreadState::Uninitialised,
            1 => UthreadState::NotStarted,
            2 => UthreadState::Running,
            3 => UthreadState::WaitingData,
            4 => UthreadState::WaitingMtasks,
            5 => UthreadState::WaitingHandle,
            6 => UthreadState::Throttling,
            _ => UthreadState::Finished,
        }
    }
}

/// Internal signal a suspended uthread yields up to its worker. Carries no
/// payload: the worker re-derives runnability from the uthread's counters,
/// it does not need to interpret the reason to decide what to do next
/// (beyond bookkeeping/metrics).
#[derive(Debug, Clone, Copy)]
pub enum YieldSignal {
    Data,
    Mtasks,
    Handle,
    Throttle,
    Yield,
}

type Body = Coroutine<(), YieldSignal, ()>;

/// Per-uthread bookkeeping shared between the running coroutine and the
/// worker that schedules it. Fields are atomics because the comm-server /
/// helper threads update `received_bytes` and the mtask-completion counters
/// from other OS threads while this uthread's worker is deciding whether to
/// resume it.
pub struct UthreadCounters {
    pub requested_bytes: AtomicU64,
    pub received_bytes: AtomicU64,
    /// Indexed by nesting level, spec.md §3 "created_mtasks[nl]".
    pub created_mtasks: Vec<AtomicU64>,
    pub terminated_mtasks: Vec<AtomicU64>,
}

impl UthreadCounters {
    pub fn fresh(max_nesting: u32) -> Self {
        UthreadCounters {
            requested_bytes: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            created_mtasks: (0..=max_nesting).map(|_| AtomicU64::new(0)).collect(),
            terminated_mtasks: (0..=max_nesting).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn data_satisfied(&self) -> bool {
        self.received_bytes.load(Ordering::Acquire) >= self.requested_bytes.load(Ordering::Acquire)
    }

    fn mtasks_satisfied(&self, nesting_level: u32) -> bool {
        let nl = nesting_level as usize;
        self.terminated_mtasks[nl].load(Ordering::Acquire) >= self.created_mtasks[nl].load(Ordering::Acquire)
    }
}

/// A single worker-owned uthread slot. `None` body means the slot is free.
pub struct Uthread {
    pub id: TaskId,
    pub worker_id: u32,
    state: AtomicU8,
    pub nesting_level: u32,
    pub max_nesting: u32,
    pub counters: Arc<UthreadCounters>,
    pub waiting_spawn_handle: Cell<Option<u64>>,
    body: Option<Body>,
}

// SAFETY: a `Uthread` is only ever touched from the single worker thread
// that owns it; the `Send` bound is needed only so the owning `Worker`
// struct (itself thread-confined) can live in a `Vec` constructed on the
// main thread before being moved into the worker's `std::thread::spawn`.
unsafe impl Send for Uthread {}

impl Uthread {
    pub fn new_empty(id: TaskId, worker_id: u32, cfg: &Config) -> Self {
        Uthread {
            id,
            worker_id,
            state: AtomicU8::new(UthreadState::Uninitialised as u8),
            nesting_level: 0,
            max_nesting: cfg.max_nesting,
            counters: Arc::new(UthreadCounters::fresh(cfg.max_nesting)),
            waiting_spawn_handle: Cell::new(None),
            body: None,
        }
    }

    pub fn state(&self) -> UthreadState {
        UthreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: UthreadState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Install a fresh coroutine body and mark the slot `NotStarted`.
    /// `stack_floor`/`stack_ceiling` bound the guarded stack region
    /// (spec.md §4.1 expandable-stacks mode); `corosensei`'s `DefaultStack`
    /// reserves the ceiling up front and grows physical backing lazily, so
    /// "shrink back to an initial floor" is modelled by dropping and
    /// recreating the stack on retirement rather than an explicit madvise.
    pub fn spawn(
        &mut self,
        nesting_level: u32,
        stack_ceiling: usize,
        body: impl FnOnce(&Yielder<(), YieldSignal>) + 'static,
    ) {
        self.nesting_level = nesting_level;
        for c in &self.counters.created_mtasks {
            c.store(0, Ordering::Relaxed);
        }
        for c in &self.counters.terminated_mtasks {
            c.store(0, Ordering::Relaxed);
        }
        self.counters.requested_bytes.store(0, Ordering::Relaxed);
        self.counters.received_bytes.store(0, Ordering::Relaxed);
        let stack = DefaultStack::new(stack_ceiling).expect("failed to reserve uthread stack");
        self.body = Some(Coroutine::with_stack(stack, move |yielder, ()| body(yielder)));
        self.set_state(UthreadState::NotStarted);
    }

    pub fn is_free(&self) -> bool {
        self.body.is_none() && matches!(self.state(), UthreadState::Uninitialised)
    }

    pub fn retire(&mut self) {
        self.body = None;
        self.set_state(UthreadState::Uninitialised);
        self.waiting_spawn_handle.set(None);
    }

    /// spec.md §4.1 "Ready-to-run predicate".
    pub fn runnable(&self) -> bool {
        match self.state() {
            UthreadState::Running | UthreadState::NotStarted | UthreadState::Throttling | UthreadState::WaitingHandle => true,
            UthreadState::WaitingData => {
                self.nesting_level < self.max_nesting || self.counters.data_satisfied()
            }
            UthreadState::WaitingMtasks => {
                self.nesting_level < self.max_nesting || self.counters.mtasks_satisfied(self.nesting_level)
            }
            UthreadState::Uninitialised | UthreadState::Finished => false,
        }
    }

    /// Resume the coroutine for one scheduling quantum. Returns `true` if
    /// the uthread finished.
    pub fn resume_once(&mut self) -> bool {
        self.set_state(UthreadState::Running);
        let body = self.body.as_mut().expect("resume_once on empty slot");
        match body.resume(()) {
            CoroutineResult::Yield(signal) => {
                let next = match signal {
                    YieldSignal::Data => UthreadState::WaitingData,
                    YieldSignal::Mtasks => UthreadState::WaitingMtasks,
                    YieldSignal::Handle => UthreadState::WaitingHandle,
                    YieldSignal::Throttle => UthreadState::Throttling,
                    YieldSignal::Yield => UthreadState::Running,
                };
                self.set_state(next);
                false
            }
            CoroutineResult::Return(()) => {
                self.set_state(UthreadState::Finished);
                true
            }
        }
    }
}

thread_local! {
    /// The `Yielder` of whichever uthread this worker thread is currently
    /// resuming, for `wait_data`/`wait_mtasks`/etc. to suspend through.
    static CURRENT_YIELDER: Cell<*const Yielder<(), YieldSignal>> = Cell::new(std::ptr::null());
    /// The currently-running uthread's counters, for `api.rs` to register
    /// with [`crate::reply::ReplyTable`].
    static CURRENT_COUNTERS: RefCell<Option<Arc<UthreadCounters>>> = RefCell::new(None);
}

pub fn bind_current_counters(counters: Arc<UthreadCounters>) {
    CURRENT_COUNTERS.with(|c| *c.borrow_mut() = Some(counters));
}

pub fn current_counters() -> Option<Arc<UthreadCounters>> {
    CURRENT_COUNTERS.with(|c| c.borrow().clone())
}

/// Install `yielder` as current for the duration of `f`. Called once, from
/// inside the coroutine body trampoline, before running user/task code.
pub fn with_current_yielder<R>(yielder: &Yielder<(), YieldSignal>, f: impl FnOnce() -> R) -> R {
    let prev = CURRENT_YIELDER.with(|c| c.replace(yielder as *const _));
    let r = f();
    CURRENT_YIELDER.with(|c| c.set(prev));
    r
}

/// Suspend the currently-running uthread with the given reason, returning
/// once the worker resumes it. Panics if called outside a uthread body.
/// Callers in non-preemptable contexts must check [`in_uthread`] first and
/// raise `GmtError::NonPreemptableCalledGlobalOp` instead (spec.md §7).
pub fn suspend_current(signal: YieldSignal) {
    let ptr = CURRENT_YIELDER.with(|c| c.get());
    assert!(!ptr.is_null(), "suspend_current called outside a uthread body");
    // SAFETY: `ptr` is only ever non-null while `with_current_yielder` has
    // borrowed a live `Yielder` further up this same OS thread's stack.
    let yielder = unsafe { &*ptr };
    yielder.suspend(signal);
}

pub fn in_uthread() -> bool {
    CURRENT_YIELDER.with(|c| !c.get().is_null())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::default()
    }

    #[test]
    fn runs_to_completion_without_suspending() {
        let mut u = Uthread::new_empty(1, 0, &cfg());
        u.spawn(0, 64 * 1024, |_y| {});
        assert_eq!(u.state(), UthreadState::NotStarted);
        assert!(u.runnable());
        let done = u.resume_once();
        assert!(done);
        assert_eq!(u.state(), UthreadState::Finished);
    }

    #[test]
    fn suspends_and_resumes_on_data_wait() {
        let mut u = Uthread::new_empty(2, 0, &cfg());
        u.counters.requested_bytes.store(8, Ordering::Relaxed);
        u.spawn(0, 64 * 1024, |yielder| {
            yielder.suspend(YieldSignal::Data);
        });
        let done = u.resume_once();
        assert!(!done);
        assert_eq!(u.state(), UthreadState::WaitingData);
        assert!(!u.runnable());
        u.counters.received_bytes.store(8, Ordering::Relaxed);
        assert!(u.runnable());
        let done = u.resume_once();
        assert!(done);
    }

    #[test]
    fn depth_exemption_makes_waiting_data_runnable_below_max_nesting() {
        // spec.md §4.1: "waiting-data is runnable only if either nesting
        // depth is below maximum or all requested bytes have arrived" — the
        // exemption exists so a task nested below the limit is never
        // permanently stuck behind a sibling stalled at the limit.
        let mut cfg = cfg();
        cfg.max_nesting = 2;
        let mut u = Uthread::new_empty(3, 0, &cfg);
        u.nesting_level = 1; // < max_nesting
        u.counters.requested_bytes.store(100, Ordering::Relaxed);
        u.spawn(1, 64 * 1024, |yielder| {
            yielder.suspend(YieldSignal::Data);
        });
        u.resume_once();
        assert_eq!(u.state(), UthreadState::WaitingData);
        // received (0) < requested (100), but nesting_level < max_nesting
        // so the depth exemption makes it runnable anyway.
        assert!(u.runnable());
    }
}
