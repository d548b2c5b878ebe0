//! Per-process node runtime: the singleton that owns every other
//! subsystem and the introspection ops of spec.md §6 (`node_id`,
//! `num_nodes`, `worker_id`, `num_workers`, `task_id`, `rand`, `srand`,
//! `timer`).
//!
//! A single `lazy_static` global: a lazily-constructed, process-wide slot
//! that starts empty and is filled exactly once by `init`, per spec.md §9
//! "initialised exactly once during init, lives until destroy".

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lazy_static::lazy_static;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::aggregation::Destination;
use crate::comm::server::CommHandle;
use crate::config::Config;
use crate::helper::SlabRegistry;
use crate::memory::ArrayTable;
use crate::mtask::MtaskPool;
use crate::registry::FnRegistry;
use crate::reply::ReplyTable;
use crate::reservation::ReservationTable;
use crate::spawn_handle::SpawnHandleTable;
use crate::worker::WorkerInbox;

pub struct NodeRuntime {
    pub cfg: Arc<Config>,
    pub arrays: ArrayTable,
    pub mtasks: MtaskPool,
    pub spawn_handles: SpawnHandleTable,
    pub reservations: ReservationTable,
    pub destinations: Vec<Destination>,
    pub comm: Arc<CommHandle>,
    pub slabs: Arc<SlabRegistry>,
    pub replies: ReplyTable,
    pub fn_registry: FnRegistry,
    /// One inbox per worker, shared between this node's own `api.rs` callers
    /// and `helper.rs`'s dispatch of incoming `ForLoop`/`Execute*` commands
    /// (the all-to-all topology's consumer side, spec.md §4.2).
    worker_inboxes: Vec<Arc<WorkerInbox>>,
    next_inbox: AtomicUsize,
    next_task_id: AtomicU64,
    start: Instant,
}

impl NodeRuntime {
    pub fn node_id(&self) -> u32 {
        self.cfg.node_id
    }

    pub fn num_nodes(&self) -> u32 {
        self.cfg.num_nodes()
    }

    pub fn num_workers(&self) -> u32 {
        self.cfg.num_workers
    }

    pub fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Seconds since this node's `init`, per spec.md §6 `timer()`.
    pub fn timer(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn slabs(&self) -> &Arc<SlabRegistry> {
        &self.slabs
    }

    pub fn worker_inboxes(&self) -> &[Arc<WorkerInbox>] {
        &self.worker_inboxes
    }

    /// Hand an mtask index to one worker's lane, round-robin. Which worker
    /// actually claims the iterations inside it is decided later by
    /// `Worker::try_start_from_queue`; this only picks which SPSC lane the
    /// reference travels down.
    pub fn enqueue_mtask(&self, idx: u32) {
        let n = self.worker_inboxes.len().max(1);
        let i = self.next_inbox.fetch_add(1, Ordering::Relaxed) % n;
        let _ = self.worker_inboxes[i].mtask_indices.try_push(idx as u64);
    }
}

lazy_static! {
    static ref NODE: spin::Mutex<Option<Arc<NodeRuntime>>> = spin::Mutex::new(None);
}

/// Bring up every per-node subsystem exactly once (spec.md §9). Errors if
/// called twice — a second `init` within one process is a programming
/// error, not a recoverable runtime condition.
pub fn init(cfg: Config) -> Result<(), crate::error::GmtError> {
    cfg.validate()?;
    let mut slot = NODE.lock();
    if slot.is_some() {
        return Err(crate::error::GmtError::InvalidConfig("node already initialised".into()));
    }
    let cfg = Arc::new(cfg);
    let comm = crate::comm::server::spawn(Arc::clone(&cfg))?;
    let reservations = ReservationTable::new(cfg.num_nodes(), cfg.mtasks_res_block_rem);
    reservations.bootstrap(cfg.node_id);
    let destinations = (0..cfg.num_nodes())
        .map(|_| Destination::new(cfg.cmd_block_size, cfg.comm_buffer_size))
        .collect();
    let worker_inboxes = (0..cfg.num_workers)
        .map(|_| Arc::new(WorkerInbox::new(cfg.mtasks_per_queue as usize)))
        .collect();
    let runtime = NodeRuntime {
        arrays: ArrayTable::new(cfg.node_id, cfg.num_nodes(), cfg.max_handles_per_node),
        mtasks: MtaskPool::new((cfg.mtasks_per_queue * cfg.num_mtasks_queues) as usize),
        spawn_handles: SpawnHandleTable::new(cfg.node_id, cfg.max_handles_per_node),
        reservations,
        destinations,
        comm,
        slabs: Arc::new(SlabRegistry::new()),
        replies: ReplyTable::new(),
        fn_registry: FnRegistry::new(),
        worker_inboxes,
        next_inbox: AtomicUsize::new(0),
        next_task_id: AtomicU64::new(1),
        start: Instant::now(),
        cfg,
    };
    *slot = Some(Arc::new(runtime));
    Ok(())
}

pub fn current() -> Arc<NodeRuntime> {
    Arc::clone(NODE.lock().as_ref().expect("node::init must run before any global op"))
}

pub fn is_initialised() -> bool {
    NODE.lock().is_some()
}

/// Tear the node down, releasing the shared runtime (spec.md §9 "lives
/// until destroy"). Any `Arc<NodeRuntime>` handles already held by running
/// tasks stay valid until they're dropped; this only stops new callers from
/// reaching it via [`current`].
pub fn destroy() {
    *NODE.lock() = None;
}

thread_local! {
    static WORKER_ID: Cell<Option<u32>> = Cell::new(None);
    static TASK_ID: Cell<Option<u64>> = Cell::new(None);
    static NESTING_LEVEL: Cell<u32> = Cell::new(0);
    static RNG: Cell<Option<ChaCha8Rng>> = Cell::new(None);
}

/// Called once by each worker/helper thread's entry point before it starts
/// running uthreads, so `worker_id()`/`task_id()` can answer without
/// threading context through every call.
pub fn bind_worker(worker_id: u32) {
    WORKER_ID.with(|c| c.set(Some(worker_id)));
}

pub fn bind_task(task_id: u64) {
    TASK_ID.with(|c| c.set(Some(task_id)));
}

/// Called by `worker.rs`'s `spawn_iteration` before handing control to an
/// iteration body, so nested `for_loop`/`execute_*` calls issued from inside
/// it stamp the correct nesting level on their outgoing commands.
pub fn bind_nesting_level(level: u32) {
    NESTING_LEVEL.with(|c| c.set(level));
}

pub fn current_nesting_level() -> u32 {
    NESTING_LEVEL.with(|c| c.get())
}

/// `task_id()` without the "must be bound" panic, for call sites (like
/// outgoing command headers) that are fine falling back to task `0` when
/// issued from an OS thread that never bound one.
pub fn task_id_or_zero() -> u64 {
    TASK_ID.with(|c| c.get()).unwrap_or(0)
}

pub fn worker_id() -> u32 {
    WORKER_ID.with(|c| c.get()).expect("worker_id() called outside a bound worker thread")
}

pub fn task_id() -> u64 {
    TASK_ID.with(|c| c.get()).expect("task_id() called outside a running task")
}

/// `rand()`/`srand(seed)` (spec.md §6): per-task-thread `ChaCha8Rng`.
/// Unseeded threads self-seed from entropy on first use.
pub fn rand_u64() -> u64 {
    RNG.with(|c| {
        let mut rng = c.take().unwrap_or_else(ChaCha8Rng::from_entropy);
        let v = rng.next_u64();
        c.set(Some(rng));
        v
    })
}

pub fn srand(seed: u64) {
    RNG.with(|c| c.set(Some(ChaCha8Rng::seed_from_u64(seed))));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srand_is_deterministic_per_thread() {
        srand(42);
        let a = rand_u64();
        srand(42);
        let b = rand_u64();
        assert_eq!(a, b);
    }

    #[test]
    fn worker_id_panics_before_bind() {
        let result = std::panic::catch_unwind(|| {
            std::thread::spawn(worker_id).join()
        });
        // the panic happens inside the spawned thread; either the outer
        // catch or the join's Err tells us it didn't silently succeed
        assert!(result.is_err() || result.unwrap().is_err());
    }
}
