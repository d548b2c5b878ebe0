//! Multi-scenario integration coverage over the public API (spec.md §8).
//!
//! `node::NODE` is a single process-wide slot, so only one node can be
//! live in this process at a time —
//! there's no in-process way to stand up several nodes on separate threads
//! the way a real cluster deploys them. Every scenario below therefore runs
//! single-node (`num_nodes == 1`), which still drives the full
//! worker/helper/mtask/uthread pipeline end to end; it just never takes the
//! remote branch of `put_nb`/`get_nb`/`atomic_*_nb`. Wire-level coverage of
//! those remote branches (command encode/decode, aggregation pack triggers)
//! lives in the `#[cfg(test)]` modules next to `command.rs` and
//! `aggregation.rs`; real cross-node behaviour is exercised by running
//! `gmt-runtime`/`gmt-zombie` as separate OS processes, one per node.
//!
//! All scenarios run from a single `#[test]` function so they execute
//! strictly in sequence — `node::init` errors if called while a node is
//! already up, and `cargo test` otherwise runs `#[test]` functions on
//! separate threads in parallel.

use std::panic::catch_unwind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};

use gmt_core::api;
use gmt_core::{Config, Distribution, GlobalHandle, Preemption, Runtime, SpawnPolicy};

fn completion_cell() -> &'static (Mutex<bool>, Condvar) {
    static CELL: OnceLock<(Mutex<bool>, Condvar)> = OnceLock::new();
    CELL.get_or_init(|| (Mutex::new(false), Condvar::new()))
}

fn scenario_failed() -> &'static AtomicBool {
    static FAILED: OnceLock<AtomicBool> = OnceLock::new();
    FAILED.get_or_init(|| AtomicBool::new(false))
}

/// Marks the running scenario done, recording whether its body's asserts
/// survived. Called from the worker thread the scenario body runs on.
fn signal_done(ok: bool) {
    if !ok {
        scenario_failed().store(true, Ordering::SeqCst);
    }
    let (lock, cvar) = completion_cell();
    *lock.lock().unwrap() = true;
    cvar.notify_one();
}

/// Boots a single-node runtime on `port`, submits `body` as a preemptable
/// task so its blocking `api::*` calls actually suspend (the same pattern
/// `gmt-zombie`'s `main` uses — plain OS threads aren't uthreads, so
/// `wait_data`/`wait_mtasks` would otherwise be no-ops), waits for it to
/// finish, then tears the node down.
fn run_scenario(port: u16, body: gmt_core::ExecFn, label: &str) {
    let (lock, cvar) = completion_cell();
    *lock.lock().unwrap() = false;
    scenario_failed().store(false, Ordering::SeqCst);

    let cfg = Config {
        addresses: vec![format!("127.0.0.1:{port}")],
        node_id: 0,
        ..Config::default()
    };
    let runtime = Runtime::start(cfg).expect("runtime start");

    api::execute_on_node_nb(0, body, Vec::new(), Preemption::Preemptable).expect("submit scenario task");

    let mut done = lock.lock().unwrap();
    while !*done {
        done = cvar.wait(done).unwrap();
    }
    drop(done);

    runtime.shutdown();
    assert!(!scenario_failed().load(Ordering::SeqCst), "scenario `{label}` failed");
}

#[test]
fn end_to_end_scenarios() {
    run_scenario(17101, body_fill_and_reduce, "fill-and-reduce");
    run_scenario(17102, body_execute_on_node_square, "execute_on_node square");
    run_scenario(17103, body_atomics, "atomic add/cas round trip");
    run_scenario(17104, body_for_each_replicate, "for_each over a replicated array");
    run_scenario(17105, body_memcpy, "memcpy between two local arrays");
}

// ---------------------------------------------------------------------
// Scenario 1: fill-and-reduce (spec.md §8 scenario 1)
// ---------------------------------------------------------------------

fn body_fill_and_reduce(_args: &[u8], _ret: &mut [u8]) -> usize {
    const COUNT: u64 = 4096;
    let ok = catch_unwind(|| {
        let h = api::alloc(COUNT, 8, Distribution::PartitionFromZero, Some("fill".into()), false).unwrap();
        let args = h.0.to_le_bytes().to_vec();
        api::for_loop(COUNT, 256, fn_fill, args, SpawnPolicy::Spread).unwrap();

        let mut sum: u128 = 0;
        let mut buf = [0u8; 8];
        for i in 0..COUNT {
            api::get(h, i, &mut buf).unwrap();
            sum += u64::from_le_bytes(buf) as u128;
        }
        let expected: u128 = (0..COUNT).map(|i| (i * 3 + 7) as u128).sum();
        assert_eq!(sum, expected);
        api::free(h).unwrap();
    })
    .is_ok();
    signal_done(ok);
    0
}

fn fn_fill(start_it: u64, num_it: u64, args: &[u8]) {
    let h = GlobalHandle(u64::from_le_bytes(args[..8].try_into().unwrap()));
    for i in start_it..start_it + num_it {
        let _ = api::put_value_nb(h, i, i * 3 + 7);
    }
}

// ---------------------------------------------------------------------
// Scenario 2: execute_on_node (spec.md §8 scenario 3, here targeting self
// since this process only ever has one node up)
// ---------------------------------------------------------------------

fn body_execute_on_node_square(_args: &[u8], _ret: &mut [u8]) -> usize {
    let ok = catch_unwind(|| {
        let args = 5i64.to_le_bytes().to_vec();
        let mut ret = [0u8; 8];
        let n = api::execute_on_node(api::node_id(), fn_square, args, &mut ret, Preemption::NonPreemptable).unwrap();
        assert_eq!(n, 8);
        assert_eq!(i64::from_le_bytes(ret), 25);
    })
    .is_ok();
    signal_done(ok);
    0
}

fn fn_square(args: &[u8], ret: &mut [u8]) -> usize {
    let x = i64::from_le_bytes(args[..8].try_into().unwrap());
    ret[..8].copy_from_slice(&(x * x).to_le_bytes());
    8
}

// ---------------------------------------------------------------------
// Scenario 3: atomic_add / atomic_cas round trip
// ---------------------------------------------------------------------

fn body_atomics(_args: &[u8], _ret: &mut [u8]) -> usize {
    let ok = catch_unwind(|| {
        let h = api::alloc(1, 8, Distribution::Local, None, true).unwrap();

        let prev = api::atomic_add(h, 0, 5).unwrap();
        assert_eq!(prev, 0);
        let prev = api::atomic_add(h, 0, 10).unwrap();
        assert_eq!(prev, 5);

        let prev = api::atomic_cas(h, 0, 15, 100).unwrap();
        assert_eq!(prev, 15);
        let prev = api::atomic_cas(h, 0, 15, 200).unwrap();
        assert_eq!(prev, 100, "cas with a stale `old` must not swap");

        let mut buf = [0u8; 8];
        api::get(h, 0, &mut buf).unwrap();
        assert_eq!(i64::from_le_bytes(buf), 100);

        api::free(h).unwrap();
    })
    .is_ok();
    signal_done(ok);
    0
}

// ---------------------------------------------------------------------
// Scenario 4: for_each over a replicated array, driven through an explicit
// spawn handle (spec.md §8 scenario 2/6; also exercises the
// `Distribution::Replicate` special case in `for_each_nb`)
// ---------------------------------------------------------------------

fn body_for_each_replicate(_args: &[u8], _ret: &mut [u8]) -> usize {
    const COUNT: u64 = 16;
    let ok = catch_unwind(|| {
        let h = api::alloc(COUNT, 8, Distribution::Replicate, None, true).unwrap();
        let args = h.0.to_le_bytes().to_vec();

        let handle = api::get_handle();
        api::for_loop_with_handle(COUNT, 1, fn_fill, args, SpawnPolicy::Spread, handle).unwrap();
        api::wait_handle(handle).unwrap();

        let mut sum: u128 = 0;
        let mut buf = [0u8; 8];
        for i in 0..COUNT {
            api::get(h, i, &mut buf).unwrap();
            sum += u64::from_le_bytes(buf) as u128;
        }
        let expected: u128 = (0..COUNT).map(|i| (i * 3 + 7) as u128).sum();
        assert_eq!(sum, expected);

        api::free(h).unwrap();
    })
    .is_ok();
    signal_done(ok);
    0
}

// ---------------------------------------------------------------------
// Scenario 5: memcpy between two distinct global arrays
// ---------------------------------------------------------------------

fn body_memcpy(_args: &[u8], _ret: &mut [u8]) -> usize {
    let ok = catch_unwind(|| {
        let src = api::alloc(1, 8, Distribution::Local, None, true).unwrap();
        let dst = api::alloc(1, 8, Distribution::Local, None, true).unwrap();

        api::put_value_nb(src, 0, 424_242).unwrap();
        api::memcpy(src, 0, dst, 0, 8).unwrap();

        let mut buf = [0u8; 8];
        api::get(dst, 0, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 424_242);

        api::free(src).unwrap();
        api::free(dst).unwrap();
    })
    .is_ok();
    signal_done(ok);
    0
}
