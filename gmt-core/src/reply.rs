//! Per-task reply delivery (spec.md §4.5/§6).
//!
//! A uthread that issues a remote `get`/`atomic_add`/`atomic_cas`/
//! `execute_*` registers its [`crate::uthread::UthreadCounters`] here under
//! its task id before suspending. When the matching `Reply*` command comes
//! back — on a helper thread, which has no idea which worker owns that
//! task's uthread — it looks the task up here, stashes the payload, and
//! flips the counter that makes `Uthread::runnable` true again.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::uthread::UthreadCounters;

pub struct ReplyTable {
    counters: spin::Mutex<HashMap<u64, Arc<UthreadCounters>>>,
    values: spin::Mutex<HashMap<u64, u64>>,
    bytes: spin::Mutex<HashMap<u64, Vec<u8>>>,
}

impl ReplyTable {
    pub fn new() -> Self {
        ReplyTable {
            counters: spin::Mutex::new(HashMap::new()),
            values: spin::Mutex::new(HashMap::new()),
            bytes: spin::Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in task `task`'s next reply. Resets the counters to
    /// "one thing outstanding" so `wait_data` blocks until [`Self::deliver_*`]
    /// flips it.
    pub fn register(&self, task: u64, counters: Arc<UthreadCounters>) {
        counters.requested_bytes.store(1, Ordering::Relaxed);
        counters.received_bytes.store(0, Ordering::Relaxed);
        self.counters.lock().insert(task, counters);
    }

    pub fn unregister(&self, task: u64) {
        self.counters.lock().remove(&task);
        self.values.lock().remove(&task);
        self.bytes.lock().remove(&task);
    }

    fn wake(&self, task: u64) {
        if let Some(c) = self.counters.lock().get(&task) {
            c.received_bytes.store(1, Ordering::Release);
        }
    }

    pub fn deliver_value(&self, task: u64, value: u64) {
        self.values.lock().insert(task, value);
        self.wake(task);
    }

    pub fn deliver_bytes(&self, task: u64, bytes: Vec<u8>) {
        self.bytes.lock().insert(task, bytes);
        self.wake(task);
    }

    pub fn deliver_ack(&self, task: u64) {
        self.wake(task);
    }

    pub fn take_value(&self, task: u64) -> Option<u64> {
        self.values.lock().remove(&task)
    }

    pub fn take_bytes(&self, task: u64) -> Option<Vec<u8>> {
        self.bytes.lock().remove(&task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn deliver_value_wakes_registered_counters() {
        let table = ReplyTable::new();
        let counters = Arc::new(UthreadCounters::fresh(Config::default().max_nesting));
        table.register(7, Arc::clone(&counters));
        assert!(!counters.data_satisfied());
        table.deliver_value(7, 99);
        assert!(counters.data_satisfied());
        assert_eq!(table.take_value(7), Some(99));
        table.unregister(7);
        assert_eq!(table.take_value(7), None);
    }
}
