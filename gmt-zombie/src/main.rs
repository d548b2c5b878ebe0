//! Demonstration client exercising the public GMT API: the fill-and-reduce
//! scenario from spec.md §8 (scenario 1) and a single BFS horizon adapted in
//! idiom from `original_source/algorithms/zombie/bfs.cc`'s `MarkBadGuys`.
//!
//! Contains no runtime logic of its own — every call here goes through
//! `gmt_core::api`, the same surface any embedder uses.

use std::sync::{Condvar, Mutex, OnceLock};

use gmt_core::api;
use gmt_core::{Config, Distribution, GlobalHandle, Preemption, Runtime, SpawnPolicy};

const FILL_COUNT: u64 = 100_000;
const NUM_VERTICES: u64 = 64;
const NO_HOPS: u64 = u64::MAX;

/// `get`/`for_loop`/`for_each` only actually suspend their caller when
/// called from inside a uthread (`api::wait_data`/`wait_mtasks` are no-ops
/// off one) — `main` itself runs on a plain OS thread, so the scenarios
/// are submitted as a single preemptable task and driven through the
/// worker pool instead of being called directly. `ExecFn` is a bare
/// function pointer (no closures), so the completion signal back to
/// `main` has to live in a static rather than be captured.
fn demo_done_cell() -> &'static (Mutex<bool>, Condvar) {
    static DEMO_DONE: OnceLock<(Mutex<bool>, Condvar)> = OnceLock::new();
    DEMO_DONE.get_or_init(|| (Mutex::new(false), Condvar::new()))
}

fn main() {
    let cfg = Config::default().merge_env();
    let node_id = cfg.node_id;
    let runtime = Runtime::start(cfg).unwrap_or_else(|e| {
        eprintln!("gmt-zombie: failed to start node {node_id}: {e}");
        std::process::exit(1);
    });

    api::execute_on_node_nb(api::node_id(), fn_run_demo, Vec::new(), Preemption::Preemptable)
        .expect("submit demo task");

    let (lock, cvar) = demo_done_cell();
    let mut done = lock.lock().unwrap();
    while !*done {
        done = cvar.wait(done).unwrap();
    }
    drop(done);

    runtime.shutdown();
}

/// Runs as a preemptable mtask on a worker's uthread, so the blocking
/// scenario code below can actually wait on its global ops.
fn fn_run_demo(_args: &[u8], _ret: &mut [u8]) -> usize {
    fill_and_reduce();
    bfs_one_horizon();

    let (lock, cvar) = demo_done_cell();
    *lock.lock().unwrap() = true;
    cvar.notify_one();
    0
}

/// Scenario 1: fill a partitioned array with `i*3+7` via a distributed
/// `for_loop`, then reduce it back with plain `get`s and check the closed
/// form sum.
fn fill_and_reduce() {
    let h = api::alloc(FILL_COUNT, 8, Distribution::PartitionFromZero, Some("fill".into()), false)
        .expect("alloc fill array");

    let args = h.0.to_le_bytes().to_vec();
    api::for_loop(FILL_COUNT, 1024, fn_fill, args, SpawnPolicy::Spread).expect("for_loop fill");

    if api::node_id() == 0 {
        let mut sum: u128 = 0;
        let mut buf = [0u8; 8];
        for i in 0..FILL_COUNT {
            api::get(h, i, &mut buf).expect("get");
            sum += u64::from_le_bytes(buf) as u128;
        }
        let expected: u128 = (0..FILL_COUNT).map(|i| (i * 3 + 7) as u128).sum();
        tracing::info!(sum = sum as u64, expected = expected as u64, "fill-and-reduce done");
        assert_eq!(sum, expected, "fill-and-reduce checksum mismatch");
    }

    api::free(h).expect("free fill array");
}

fn fn_fill(start_it: u64, num_it: u64, args: &[u8]) {
    let h = GlobalHandle(u64::from_le_bytes(args[..8].try_into().unwrap()));
    for i in start_it..start_it + num_it {
        let _ = api::put_value_nb(h, i, i * 3 + 7);
    }
}

/// A single BFS horizon: a root vertex is marked `hops = 0`, its direct
/// neighbours (a small fixed ring graph, in place of `bfs.cc`'s sorted edge
/// table) are visited in parallel via `for_each` and marked `hops = 1` if
/// they hadn't already been reached.
fn bfs_one_horizon() {
    let vertices = api::alloc(NUM_VERTICES, 8, Distribution::PartitionFromZero, Some("bfs_hops".into()), false)
        .expect("alloc vertices");
    for i in 0..NUM_VERTICES {
        let _ = api::put_value_nb(vertices, i, NO_HOPS);
    }
    let root = 0u64;
    let _ = api::put_value_nb(vertices, root, 0);

    let args = vertices.0.to_le_bytes().to_vec();
    api::for_each(vertices, 1, 0, NUM_VERTICES, fn_mark_neighbour_of_root, args).expect("for_each bfs horizon");

    if api::node_id() == 0 {
        let mut buf = [0u8; 8];
        api::get(vertices, ring_neighbour(root), &mut buf).expect("get");
        let hops = u64::from_le_bytes(buf);
        tracing::info!(hops, "bfs horizon 1 reached root's ring neighbour");
        assert_eq!(hops, 1, "ring neighbour of root should be one hop away");
    }

    api::free(vertices).expect("free vertices");
}

/// This demo's stand-in for `bfs.cc`'s adjacency table: vertex `v`'s only
/// neighbour is `(v + 1) % NUM_VERTICES`, a ring, so "mark the root's
/// neighbour" has a single deterministic answer to assert against.
fn ring_neighbour(v: u64) -> u64 {
    (v + 1) % NUM_VERTICES
}

fn fn_mark_neighbour_of_root(start_it: u64, num_it: u64, args: &[u8]) {
    let h = GlobalHandle(u64::from_le_bytes(args[..8].try_into().unwrap()));
    for i in start_it..start_it + num_it {
        let mut buf = [0u8; 8];
        if api::get(h, i, &mut buf).is_err() {
            continue;
        }
        if u64::from_le_bytes(buf) != 0 {
            continue; // only the root (hops == 0) expands this horizon
        }
        let neighbour = ring_neighbour(i);
        let mut nbuf = [0u8; 8];
        if api::get(h, neighbour, &mut nbuf).is_err() {
            continue;
        }
        if u64::from_le_bytes(nbuf) > 1 {
            let _ = api::put_value_nb(h, neighbour, 1);
        }
    }
}
