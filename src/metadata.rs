//! Appendable/finalizable metadata protocol (spec §4.5/§11).
//!
//! Records, per allocation, an optional used-capacity watermark and an
//! optional finalizer, without a per-object header: large extents
//! carry both inline, slab slots carry them in their owning `Bin`'s
//! side map (see `bin::BinState::meta`). This module is the dispatcher
//! that picks which of the two an allocation uses and enforces the
//! "last-slice-wins" gating spec.md §4.5 requires of `get_capacity`/
//! `extend` — a caller only gets a non-zero answer (or permission to
//! extend) by naming a slice whose end matches the last recorded
//! capacity exactly.

use crate::arena::Arena;
use crate::config::{appendable_small_class, pages_for, MAX_ALLOCATION_SIZE};
use crate::error::{HpError, HpResult};
use crate::extent::Finalizer;

/// Allocates `requested_size` bytes with capacity/finalizer tracking,
/// choosing the smallest size class that can hold both the object and
/// the protocol's own bookkeeping, or falling back to a large
/// allocation when no small class fits (spec §11 step 5).
pub fn alloc_appendable(arena: &Arena, requested_size: usize, zero: bool, finalizer: Option<Finalizer>) -> HpResult<usize> {
    if requested_size == 0 {
        return Err(HpError::InvalidArgument);
    }
    if requested_size > MAX_ALLOCATION_SIZE {
        return Err(HpError::CapacityExceeded);
    }

    match appendable_small_class(requested_size, finalizer.is_some()) {
        Some((sc, _max_capacity)) => {
            let (ptr, extent_idx) = arena.alloc_small(sc as u8)?;
            let bin = arena.bin(sc as u8);
            let slot = bin.slot_of(extent_idx, ptr);
            if zero {
                unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, requested_size) };
            }
            bin.set_capacity(extent_idx, slot, requested_size);
            if let Some(f) = finalizer {
                bin.set_finalizer(extent_idx, slot, Some(f));
            }
            Ok(ptr)
        }
        None => {
            let ptr = arena.alloc_large(requested_size)?;
            let extent_idx = arena.emap().lookup(ptr).extent_index().expect("alloc_large always maps its base page");
            if zero {
                unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, requested_size) };
            }
            arena.with_large_extent(extent_idx, |e| {
                e.set_used_capacity(requested_size);
                e.set_finalizer(finalizer);
            });
            Ok(ptr)
        }
    }
}

/// `getCapacity(ptr[slice_start..slice_end])`: 0 unless `slice_end`
/// equals the allocation's recorded used capacity and that capacity
/// is non-zero, in which case it returns the room remaining from
/// `slice_start` to the end of the underlying slot.
pub fn get_capacity(arena: &Arena, ptr: usize, slice_start: usize, slice_end: usize) -> usize {
    let pd = arena.emap().lookup(ptr);
    if pd.is_empty() {
        return 0;
    }
    if pd.is_slab() {
        let sc = pd.size_class().expect("slab page descriptor carries a size class");
        let extent_idx = pd.extent_index().expect("slab page descriptor carries an extent index");
        let bin = arena.bin(sc);
        let slot = bin.slot_of(extent_idx, ptr);
        match bin.used_capacity(extent_idx, slot) {
            Some(used) if used != 0 && slice_end == used => bin.item_size() - slice_start,
            _ => 0,
        }
    } else {
        let extent_idx = pd.extent_index().expect("large page descriptor carries an extent index");
        let info = arena.with_large_extent(extent_idx, |e| (e.used_capacity(), e.size));
        match info {
            Some((used, size)) if used != 0 && slice_end == used => size - slice_start,
            _ => 0,
        }
    }
}

/// `extend(ptr[slice_start..slice_end], delta)`: grows the recorded
/// used capacity by `delta` if `slice_end` names the current
/// watermark and the new length fits — for a large extent this may
/// first try `resize_large` to grow into adjacent free pages (spec
/// §4.5/S6).
pub fn extend(arena: &Arena, ptr: usize, slice_start: usize, slice_end: usize, delta: usize) -> bool {
    let pd = arena.emap().lookup(ptr);
    if pd.is_empty() {
        return false;
    }
    let new_capacity = slice_end + delta;

    if pd.is_slab() {
        let sc = pd.size_class().expect("slab page descriptor carries a size class");
        let extent_idx = pd.extent_index().expect("slab page descriptor carries an extent index");
        let bin = arena.bin(sc);
        let slot = bin.slot_of(extent_idx, ptr);
        let gated = matches!(bin.used_capacity(extent_idx, slot), Some(used) if used != 0 && slice_end == used);
        if !gated || new_capacity > bin.item_size() {
            return false;
        }
        bin.set_capacity(extent_idx, slot, new_capacity);
        true
    } else {
        let extent_idx = pd.extent_index().expect("large page descriptor carries an extent index");
        let current = arena.with_large_extent(extent_idx, |e| (e.used_capacity(), e.size));
        let (used, size) = match current {
            Some(v) => v,
            None => return false,
        };
        if used == 0 || slice_end != used {
            return false;
        }
        if new_capacity <= size {
            arena.with_large_extent(extent_idx, |e| e.set_used_capacity(new_capacity));
            return true;
        }
        let new_pages = pages_for(new_capacity);
        if arena.resize_large(extent_idx, new_pages) {
            arena.with_large_extent(extent_idx, |e| e.set_used_capacity(new_capacity));
            true
        } else {
            false
        }
    }
}

/// `destroy(ptr)`: runs the recorded finalizer, if any, then frees.
pub fn destroy(arena: &Arena, ptr: usize) -> HpResult<()> {
    let pd = arena.emap().lookup(ptr);
    if pd.is_empty() {
        return Err(HpError::InvalidArgument);
    }

    if pd.is_slab() {
        let sc = pd.size_class().expect("slab page descriptor carries a size class");
        let extent_idx = pd.extent_index().expect("slab page descriptor carries an extent index");
        let bin = arena.bin(sc);
        let slot = bin.slot_of(extent_idx, ptr);
        if let Some(f) = bin.finalizer(extent_idx, slot) {
            let used = bin.used_capacity(extent_idx, slot).unwrap_or(0);
            f(ptr as *mut u8, used);
        }
    } else {
        let extent_idx = pd.extent_index().expect("large page descriptor carries an extent index");
        let finalizer_and_used = arena.with_large_extent(extent_idx, |e| (e.finalizer(), e.used_capacity()));
        if let Some((Some(f), used)) = finalizer_and_used {
            f(ptr as *mut u8, used);
        }
    }

    arena.free(ptr, pd);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{build_small_class_table, NUM_SMALL_CLASSES};
    use crate::emap::Emap;
    use crate::region::SystemRegionProvider;
    use once_cell::sync::Lazy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static REGION: Lazy<SystemRegionProvider> = Lazy::new(SystemRegionProvider::default);
    static EMAP: Lazy<Emap> = Lazy::new(Emap::new);
    static CLASSES: Lazy<[crate::config::SmallClassInfo; NUM_SMALL_CLASSES]> = Lazy::new(build_small_class_table);

    fn test_arena(index: u8) -> Arena {
        Arena::new(index, &*REGION, &*EMAP, &*CLASSES)
    }

    #[test]
    fn capacity_law_holds_for_small_appendable() {
        let arena = test_arena(10);
        // requested_size 5 lands in the 8-byte class (smallest class
        // that fits both the 5 user bytes and the 1-byte length field).
        let ptr = alloc_appendable(&arena, 5, false, None).unwrap();
        assert_eq!(get_capacity(&arena, ptr, 0, 5), 8);
        assert_eq!(get_capacity(&arena, ptr, 0, 6), 0, "wrong slice end must read as zero capacity");
        assert_eq!(get_capacity(&arena, ptr, 5, 5), 3, "zero-length slice at the watermark reports room to slot end");
    }

    #[test]
    fn extend_grows_small_capacity_within_slot() {
        let arena = test_arena(11);
        let ptr = alloc_appendable(&arena, 5, false, None).unwrap();
        assert!(extend(&arena, ptr, 0, 5, 1));
        assert_eq!(get_capacity(&arena, ptr, 0, 6), 8, "capacity watermark moved to 6");
        assert!(!extend(&arena, ptr, 0, 5, 1), "stale slice_end should be rejected after the watermark moved");
    }

    #[test]
    fn destroy_invokes_finalizer_with_used_capacity() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        fn record(_ptr: *mut u8, used: usize) {
            SEEN.store(used, Ordering::SeqCst);
        }
        let arena = test_arena(12);
        let ptr = alloc_appendable(&arena, 45, false, Some(record)).unwrap();
        destroy(&arena, ptr).unwrap();
        assert_eq!(SEEN.load(Ordering::SeqCst), 45);
    }

    #[test]
    fn large_appendable_extends_via_resize() {
        let arena = test_arena(13);
        let ptr = alloc_appendable(&arena, 16384, false, None).unwrap();
        assert!(get_capacity(&arena, ptr, 0, 16384) >= 16384);
        assert!(extend(&arena, ptr, 0, 16384, 1));
    }
}
