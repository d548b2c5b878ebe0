//! Mtask reservation protocol (spec.md §4.9).
//!
//! Bounds how many remote mtasks this node may have in flight against each
//! other node, so a destination's fixed-size mtask pool can never be
//! over-subscribed by the rest of the cluster.

use std::sync::atomic::{AtomicI64, Ordering};

/// One counter per remote node: how many of *that* node's mtask-pool slots
/// this node has been granted permission to use.
pub struct ReservationTable {
    /// `num_mtasks_res_array[r]`.
    per_node: Vec<AtomicI64>,
    /// Per-destination lock so at most one in-flight reservation-request is
    /// outstanding to a given node at a time (spec.md §4.9).
    request_in_flight: Vec<spin::Mutex<()>>,
    block_rem: i64,
}

impl ReservationTable {
    pub fn new(num_nodes: u32, block_rem: u32) -> Self {
        let n = num_nodes as usize;
        ReservationTable {
            per_node: (0..n).map(|_| AtomicI64::new(0)).collect(),
            request_in_flight: (0..n).map(|_| spin::Mutex::new(())).collect(),
            block_rem: block_rem as i64,
        }
    }

    /// Pre-reserve one block per remote node at startup so the first remote
    /// `for_loop`/`execute` to each peer never blocks on a synchronous
    /// round trip (spec.md §4.9 "Bootstrap").
    pub fn bootstrap(&self, self_node: u32) {
        for (r, counter) in self.per_node.iter().enumerate() {
            if r as u32 != self_node {
                counter.fetch_add(self.block_rem, Ordering::AcqRel);
            }
        }
    }

    /// Attempt to claim one reservation against node `r`. On success the
    /// counter is decremented and the caller may enqueue a remote mtask
    /// immediately; on failure the counter is restored and the caller must
    /// either send a reservation-request (if it wins `request_in_flight`) or
    /// self-execute and retry (spec.md §4.9, and §7 "reservation starvation
    /// — not an error; caller self-executes and retries").
    pub fn acquire(&self, r: u32) -> bool {
        let counter = &self.per_node[r as usize];
        let prev = counter.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            counter.fetch_add(1, Ordering::AcqRel);
            false
        } else {
            true
        }
    }

    /// Returns a guard if this caller won the right to send a
    /// reservation-request to `r`; `None` if another local thread already
    /// has one in flight.
    pub fn try_begin_request(&self, r: u32) -> Option<spin::MutexGuard<'_, ()>> {
        self.request_in_flight[r as usize].try_lock()
    }

    /// Apply a reservation-reply's granted amount.
    pub fn grant(&self, r: u32, granted: u32) {
        self.per_node[r as usize].fetch_add(granted as i64, Ordering::AcqRel);
    }

    /// How large a block the *local* pool can satisfy for an incoming
    /// reservation-request from `requested`, bounded by `block_rem`
    /// (spec.md §4.9: "replies with the largest block size it can satisfy").
    pub fn reply_grant(&self, requested: u32, locally_available: u32) -> u32 {
        requested.min(locally_available).min(self.block_rem as u32)
    }

    pub fn outstanding(&self, r: u32) -> i64 {
        self.per_node[r as usize].load(Ordering::Acquire)
    }
}

/// Local amortisation of MPMC pops against the node's own mtask pool
/// (spec.md §4.9, final paragraph: "workers reserve blocks of mtasks from
/// the pool ... to amortise MPMC pops").
pub struct LocalAvailability {
    num_mtasks_avail: AtomicI64,
    block_loc: i64,
}

impl LocalAvailability {
    pub fn new(block_loc: u32) -> Self {
        LocalAvailability {
            num_mtasks_avail: AtomicI64::new(0),
            block_loc: block_loc as i64,
        }
    }

    /// Claim one local slot, topping up from `pool_free_count` in blocks of
    /// `block_loc` when the local counter runs dry.
    pub fn acquire(&self, pool_has_free: impl Fn() -> bool) -> bool {
        loop {
            let prev = self.num_mtasks_avail.fetch_sub(1, Ordering::AcqRel);
            if prev > 0 {
                return true;
            }
            self.num_mtasks_avail.fetch_add(1, Ordering::AcqRel);
            if pool_has_free() {
                self.num_mtasks_avail.fetch_add(self.block_loc, Ordering::AcqRel);
            } else {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_skips_self_node() {
        let t = ReservationTable::new(4, 16);
        t.bootstrap(1);
        assert_eq!(t.outstanding(1), 0);
        assert_eq!(t.outstanding(0), 16);
        assert_eq!(t.outstanding(2), 16);
    }

    #[test]
    fn acquire_fails_and_restores_when_exhausted() {
        let t = ReservationTable::new(2, 1);
        t.bootstrap(0);
        assert!(t.acquire(1));
        assert!(!t.acquire(1), "pool exhausted, must refuse rather than go negative");
        assert_eq!(t.outstanding(1), 0);
    }

    #[test]
    fn grant_replenishes_counter() {
        let t = ReservationTable::new(2, 1);
        t.bootstrap(0);
        t.acquire(1);
        t.grant(1, 5);
        assert_eq!(t.outstanding(1), 5);
    }

    #[test]
    fn only_one_request_in_flight_per_destination() {
        let t = ReservationTable::new(2, 1);
        let g1 = t.try_begin_request(1);
        assert!(g1.is_some());
        let g2 = t.try_begin_request(1);
        assert!(g2.is_none(), "a second local thread must not also send a reservation-request");
    }

    #[test]
    fn reply_grant_is_bounded_by_block_rem() {
        let t = ReservationTable::new(2, 4);
        assert_eq!(t.reply_grant(100, 100), 4);
        assert_eq!(t.reply_grant(2, 100), 2);
    }
}
