//! `put`/`get`/atomic/`memcpy` local-path logic (spec.md §4.6, §6).
//!
//! Everything here operates on already-resolved local byte ranges. Callers
//! that discover a range lives on a remote node hand it off to
//! `aggregation`/`comm` instead of calling into this module.

use crate::error::{GmtError, Result};

/// A node's raw local storage for one array: a flat byte buffer, indexed by
/// the local offsets `memory::ranges_for` computes. Real deployments back
/// this with the array's `Media` (RAM today; SSD/disk-backed media are
/// carried in the handle for forward compatibility but not implemented,
/// per spec.md's Non-goals).
pub struct LocalSlab {
    bytes: spin::Mutex<Vec<u8>>,
}

impl LocalSlab {
    pub fn new(len: u64, zero_init: bool) -> Self {
        let buf = if zero_init {
            vec![0u8; len as usize]
        } else {
            Vec::with_capacity(len as usize).into_iter().collect::<Vec<u8>>()
        };
        let mut buf = buf;
        buf.resize(len as usize, 0);
        LocalSlab {
            bytes: spin::Mutex::new(buf),
        }
    }

    fn check_range(&self, guard: &[u8], offset: u64, len: usize) -> Result<()> {
        let end = offset as usize + len;
        if end > guard.len() {
            return Err(GmtError::OutOfRange { offset, len: len as u64 });
        }
        Ok(())
    }

    pub fn put(&self, local_offset: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.bytes.lock();
        self.check_range(&guard, local_offset, data.len())?;
        let start = local_offset as usize;
        guard[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn get(&self, local_offset: u64, len: usize, out: &mut [u8]) -> Result<()> {
        let guard = self.bytes.lock();
        self.check_range(&guard, local_offset, len)?;
        let start = local_offset as usize;
        out[..len].copy_from_slice(&guard[start..start + len]);
        Ok(())
    }

    /// `atomic_add` over a little-endian integer cell of width `elem_bytes`
    /// (one of 1/2/4/8, spec.md §6); returns the pre-add value sign-extended
    /// to `i64`, per spec.md §6 "atomic_add returns the previous value".
    pub fn atomic_add_i64(&self, local_offset: u64, elem_bytes: usize, delta: i64) -> Result<i64> {
        let mut guard = self.bytes.lock();
        self.check_range(&guard, local_offset, elem_bytes)?;
        let start = local_offset as usize;
        let prev = match elem_bytes {
            1 => {
                let prev = guard[start] as i8;
                guard[start] = prev.wrapping_add(delta as i8) as u8;
                prev as i64
            }
            2 => {
                let prev = i16::from_le_bytes(guard[start..start + 2].try_into().unwrap());
                let next = prev.wrapping_add(delta as i16);
                guard[start..start + 2].copy_from_slice(&next.to_le_bytes());
                prev as i64
            }
            4 => {
                let prev = i32::from_le_bytes(guard[start..start + 4].try_into().unwrap());
                let next = prev.wrapping_add(delta as i32);
                guard[start..start + 4].copy_from_slice(&next.to_le_bytes());
                prev as i64
            }
            8 => {
                let prev = i64::from_le_bytes(guard[start..start + 8].try_into().unwrap());
                let next = prev.wrapping_add(delta);
                guard[start..start + 8].copy_from_slice(&next.to_le_bytes());
                prev
            }
            _ => return Err(GmtError::BadAtomicElementSize(elem_bytes)),
        };
        Ok(prev)
    }

    /// `atomic_cas` over a cell of width `elem_bytes` (1/2/4/8); `expected`
    /// and `new` are truncated to that width before compare/swap. Returns
    /// the value observed before the (possibly no-op) swap, sign-extended
    /// to `i64`.
    pub fn atomic_cas_i64(&self, local_offset: u64, elem_bytes: usize, expected: i64, new: i64) -> Result<i64> {
        let mut guard = self.bytes.lock();
        self.check_range(&guard, local_offset, elem_bytes)?;
        let start = local_offset as usize;
        let observed = match elem_bytes {
            1 => {
                let observed = guard[start] as i8;
                if observed == expected as i8 {
                    guard[start] = new as u8;
                }
                observed as i64
            }
            2 => {
                let observed = i16::from_le_bytes(guard[start..start + 2].try_into().unwrap());
                if observed == expected as i16 {
                    guard[start..start + 2].copy_from_slice(&(new as i16).to_le_bytes());
                }
                observed as i64
            }
            4 => {
                let observed = i32::from_le_bytes(guard[start..start + 4].try_into().unwrap());
                if observed == expected as i32 {
                    guard[start..start + 4].copy_from_slice(&(new as i32).to_le_bytes());
                }
                observed as i64
            }
            8 => {
                let observed = i64::from_le_bytes(guard[start..start + 8].try_into().unwrap());
                if observed == expected {
                    guard[start..start + 8].copy_from_slice(&new.to_le_bytes());
                }
                observed
            }
            _ => return Err(GmtError::BadAtomicElementSize(elem_bytes)),
        };
        Ok(observed)
    }

    /// Local-to-local `memcpy` between two offsets of the *same* slab
    /// (array-to-itself copy). Cross-array copies go through `put`+`get` at
    /// the call site since they may hold different locks.
    pub fn memcpy_within(&self, dst_offset: u64, src_offset: u64, len: usize) -> Result<()> {
        let mut guard = self.bytes.lock();
        self.check_range(&guard, dst_offset, len)?;
        self.check_range(&guard, src_offset, len)?;
        // overlapping ranges must behave like memmove
        let mut tmp = vec![0u8; len];
        tmp.copy_from_slice(&guard[src_offset as usize..src_offset as usize + len]);
        guard[dst_offset as usize..dst_offset as usize + len].copy_from_slice(&tmp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_roundtrips() {
        let slab = LocalSlab::new(64, true);
        slab.put(8, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        slab.get(8, 4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let slab = LocalSlab::new(16, true);
        assert!(matches!(slab.put(10, &[0u8; 16]), Err(GmtError::OutOfRange { .. })));
    }

    #[test]
    fn atomic_add_returns_previous_value() {
        let slab = LocalSlab::new(16, true);
        assert_eq!(slab.atomic_add_i64(0, 8, 5).unwrap(), 0);
        assert_eq!(slab.atomic_add_i64(0, 8, 5).unwrap(), 5);
        let mut out = [0u8; 8];
        slab.get(0, 8, &mut out).unwrap();
        assert_eq!(i64::from_le_bytes(out), 10);
    }

    #[test]
    fn atomic_cas_only_swaps_on_match() {
        let slab = LocalSlab::new(16, true);
        slab.atomic_add_i64(0, 8, 7).unwrap();
        assert_eq!(slab.atomic_cas_i64(0, 8, 100, 999).unwrap(), 7);
        let mut out = [0u8; 8];
        slab.get(0, 8, &mut out).unwrap();
        assert_eq!(i64::from_le_bytes(out), 7, "mismatched expected must not swap");
        assert_eq!(slab.atomic_cas_i64(0, 8, 7, 999).unwrap(), 7);
        slab.get(0, 8, &mut out).unwrap();
        assert_eq!(i64::from_le_bytes(out), 999);
    }

    #[test]
    fn atomic_add_on_4_byte_element_does_not_touch_neighbour() {
        let slab = LocalSlab::new(16, true);
        slab.put(4, &9i32.to_le_bytes()).unwrap();
        assert_eq!(slab.atomic_add_i64(0, 4, 3).unwrap(), 0);
        let mut out = [0u8; 4];
        slab.get(0, 4, &mut out).unwrap();
        assert_eq!(i32::from_le_bytes(out), 3);
        slab.get(4, 4, &mut out).unwrap();
        assert_eq!(i32::from_le_bytes(out), 9, "neighbouring element must be untouched");
    }

    #[test]
    fn atomic_cas_on_1_byte_element_at_end_of_slab() {
        let slab = LocalSlab::new(1, true);
        assert_eq!(slab.atomic_cas_i64(0, 1, 0, 42).unwrap(), 0);
        let mut out = [0u8; 1];
        slab.get(0, 1, &mut out).unwrap();
        assert_eq!(out[0], 42);
    }

    #[test]
    fn memcpy_within_handles_overlap() {
        let slab = LocalSlab::new(16, true);
        slab.put(0, &[1, 2, 3, 4]).unwrap();
        slab.memcpy_within(1, 0, 4).unwrap();
        let mut out = [0u8; 5];
        slab.get(0, 5, &mut out).unwrap();
        assert_eq!(out, [1, 1, 2, 3, 4]);
    }
}
