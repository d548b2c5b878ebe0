//! Stable op ids for `for_loop`/`execute_*` bodies (spec.md §6 "fn_ptr").
//!
//! GMT is SPMD: the same binary runs on every node, but a raw function
//! pointer isn't portable across processes — ASLR gives each one a
//! different base address even when every node booted from an identical
//! binary. Call sites register their bodies once; the small integer id that
//! comes back is what actually travels as a command's `fn_ptr` field, and
//! every node resolves it back to its own local copy of the same function.

use std::collections::HashMap;

use crate::mtask::{ExecFn, ForFn};

pub struct FnRegistry {
    for_fns: spin::Mutex<Vec<ForFn>>,
    for_ids: spin::Mutex<HashMap<usize, u64>>,
    exec_fns: spin::Mutex<Vec<ExecFn>>,
    exec_ids: spin::Mutex<HashMap<usize, u64>>,
}

impl FnRegistry {
    pub fn new() -> Self {
        FnRegistry {
            for_fns: spin::Mutex::new(Vec::new()),
            for_ids: spin::Mutex::new(HashMap::new()),
            exec_fns: spin::Mutex::new(Vec::new()),
            exec_ids: spin::Mutex::new(HashMap::new()),
        }
    }

    pub fn register_for(&self, f: ForFn) -> u64 {
        let key = f as usize;
        if let Some(&id) = self.for_ids.lock().get(&key) {
            return id;
        }
        let mut fns = self.for_fns.lock();
        fns.push(f);
        let id = (fns.len() - 1) as u64;
        self.for_ids.lock().insert(key, id);
        id
    }

    pub fn register_exec(&self, f: ExecFn) -> u64 {
        let key = f as usize;
        if let Some(&id) = self.exec_ids.lock().get(&key) {
            return id;
        }
        let mut fns = self.exec_fns.lock();
        fns.push(f);
        let id = (fns.len() - 1) as u64;
        self.exec_ids.lock().insert(key, id);
        id
    }

    pub fn for_fn(&self, id: u64) -> Option<ForFn> {
        self.for_fns.lock().get(id as usize).copied()
    }

    pub fn exec_fn(&self, id: u64) -> Option<ExecFn> {
        self.exec_fns.lock().get(id as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(_start_it: u64, _num_it: u64, _args: &[u8]) {}

    #[test]
    fn registering_the_same_fn_twice_returns_the_same_id() {
        let reg = FnRegistry::new();
        let a = reg.register_for(body);
        let b = reg.register_for(body);
        assert_eq!(a, b);
        assert!(reg.for_fn(a).is_some());
    }
}
