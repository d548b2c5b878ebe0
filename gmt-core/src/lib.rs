//! GMT: a Partitioned Global Address Space execution substrate (spec.md
//! §OVERVIEW). This crate is the library half — `gmt-runtime` is the
//! `clap` binary that boots one node of it.
//!
//! [`Runtime::start`] is the single entry point an embedder needs: it runs
//! [`node::init`], stands up the comm server (inside `init`), then spawns
//! one OS thread per worker and helper and hands back a handle whose `Drop`
//! stops them. Everything else in this crate — `api`, `handle`, `mtask`,
//! `spawn_handle` — is reached through the free functions in [`api`] once a
//! `Runtime` is live.

pub mod aggregation;
pub mod api;
pub mod comm;
pub mod command;
pub mod config;
pub mod error;
pub mod handle;
pub mod helper;
pub mod logging;
pub mod memory;
pub mod mtask;
pub mod node;
pub mod queue;
pub mod registry;
pub mod reply;
pub mod reservation;
pub mod spawn_handle;
pub mod uthread;
pub mod worker;

pub use api::SpawnPolicy;
pub use config::Config;
pub use error::{GmtError, Result};
pub use handle::{Distribution, GlobalHandle};
pub use mtask::{ExecFn, ForFn, Preemption};
pub use spawn_handle::SpawnHandleId;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use helper::SlabRegistry;
use worker::Worker;

/// A booted node: owns the worker/helper OS threads for as long as it's
/// alive. Dropping it (or calling [`Runtime::shutdown`] explicitly) stops
/// the scheduler loops and tears down [`node::NodeRuntime`] via
/// [`node::destroy`].
pub struct Runtime {
    running: Arc<AtomicBool>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl Runtime {
    /// Bring up one node: `node::init`, then `cfg.num_workers` worker
    /// threads and `cfg.num_helpers` helper threads, all reading from the
    /// same [`node::NodeRuntime`] singleton `api.rs` talks to.
    pub fn start(cfg: Config) -> Result<Runtime> {
        logging::init(cfg.node_id);
        let node_id = cfg.node_id;
        node::init(cfg)?;
        let node = node::current();
        let running = Arc::new(AtomicBool::new(true));
        let slabs = Arc::clone(node.slabs());

        let mut threads = Vec::new();
        for (id, inbox) in node.worker_inboxes().iter().cloned().enumerate() {
            let node = Arc::clone(&node);
            let running = Arc::clone(&running);
            let handle = std::thread::Builder::new()
                .name(format!("gmt-worker-{id}"))
                .spawn(move || {
                    let _span = logging::role_span(node_id, "worker", id as u32).entered();
                    let mut worker = Worker::new(id as u32, Arc::clone(&node), inbox);
                    worker.run(&running);
                })
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }

        for id in 0..node.cfg.num_helpers {
            let node = Arc::clone(&node);
            let slabs = Arc::clone(&slabs);
            let running = Arc::clone(&running);
            let handle = std::thread::Builder::new()
                .name(format!("gmt-helper-{id}"))
                .spawn(move || {
                    let _span = logging::role_span(node_id, "helper", id).entered();
                    helper::run_supervised(node, slabs, id, 8, &running);
                })
                .expect("failed to spawn helper thread");
            threads.push(handle);
        }

        Ok(Runtime { running, threads })
    }

    /// Stop every worker/helper loop and release the global node handle.
    /// Blocks until each thread has observed `running == false` and
    /// returned; callers whose scheduler loops are themselves stuck (e.g. a
    /// `wait_handle` that never resolves) will block here too — that is the
    /// same "stuck handle hangs the caller" contract spec.md §5 documents
    /// for `wait_handle` itself.
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Relaxed);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        node::destroy();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.running.store(false, Ordering::Relaxed);
            for t in self.threads.drain(..) {
                let _ = t.join();
            }
            node::destroy();
        }
    }
}
