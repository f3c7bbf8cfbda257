//! Arena — the per-CPU allocation domain (spec §3/§4.1).
//!
//! Owns a pool of huge-page descriptors (HPDs), a slot table of large
//! (and huge) extents, and one `Bin` per small size class. All HPD/
//! large-extent bookkeeping is guarded by a single arena mutex;
//! per-size-class slab bookkeeping is guarded separately inside each
//! `Bin`, so a small alloc/free never contends with a large one.
//!
//! Grounded on the teacher's `ZoneAllocator` (`zone.rs`): an array of
//! per-class allocators behind one front door, generalized with the
//! HPD/best-fit-heap layer the teacher's single-page-provider design
//! didn't need.

use crate::bin::{Bin, BinFreeOutcome};
use crate::config::{alloc_class, pages_for, SmallClassInfo, HUGE_PAGE_SIZE, MAX_ALLOCATION_SIZE, NUM_ALLOC_CLASSES, NUM_SMALL_CLASSES, PAGES_IN_HUGE_PAGE, PAGE_SIZE};
use crate::emap::{Emap, PageDescriptor};
use crate::error::{HpError, HpResult};
use crate::extent::Extent;
use crate::hpd::HugePageDescriptor;
use crate::primitives::{IndexHeap, SlotTable};
use crate::region::RegionProvider;
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A freshly carved page run backing one slab, handed from `Arena` to
/// `Bin` and back again on release. Not itself stored anywhere; it is
/// reconstructed from an `Extent`'s fields when a slab empties.
pub struct SlabPages {
    pub base: usize,
    pub hpd_index: Option<u32>,
    pub pages: usize,
    pub slots: u32,
}

/// Side bookkeeping for a huge (multi-huge-page) allocation's leading,
/// HPD-less whole huge pages (spec §4.1's huge-allocation split).
struct HugeExtentInfo {
    leading_huge_pages: usize,
    tail_hpd_index: u32,
}

struct ArenaState {
    hpds: SlotTable<HugePageDescriptor>,
    /// Best-fit heaps keyed by `alloc_class(longest_free_range)`; an
    /// HPD sits in exactly one heap (or none, if full), keyed by epoch
    /// so the oldest usable HPD in a class is always tried first.
    heaps: [IndexHeap<u64, u32>; NUM_ALLOC_CLASSES],
    /// Bit `i` set iff `heaps[i]` is non-empty, so the best-fit search
    /// is a single masked `trailing_zeros` rather than a linear scan.
    filter: u64,
    /// Large and huge extents only; slab extents live inside their `Bin`.
    extents: SlotTable<Extent>,
    huge_info: HashMap<u32, HugeExtentInfo>,
}

pub struct Arena {
    index: u8,
    region: &'static dyn RegionProvider,
    emap: &'static Emap,
    next_epoch: AtomicU64,
    state: Mutex<ArenaState>,
    bins: [Bin; NUM_SMALL_CLASSES],
}

impl Arena {
    pub fn new(index: u8, region: &'static dyn RegionProvider, emap: &'static Emap, class_table: &[SmallClassInfo; NUM_SMALL_CLASSES]) -> Self {
        let bins: Vec<Bin> = class_table
            .iter()
            .enumerate()
            .map(|(i, info)| Bin::new(i as u8, *info))
            .collect();
        Arena {
            index,
            region,
            emap,
            next_epoch: AtomicU64::new(0),
            state: Mutex::new(ArenaState {
                hpds: SlotTable::new(),
                heaps: std::array::from_fn(|_| IndexHeap::new()),
                filter: 0,
                extents: SlotTable::new(),
                huge_info: HashMap::new(),
            }),
            bins,
        }
    }

    #[inline]
    pub fn index(&self) -> u8 {
        self.index
    }

    #[inline]
    pub fn emap(&self) -> &'static Emap {
        self.emap
    }

    // ----- HPD best-fit pool (spec §4.1) -----

    /// Looks up the HPD currently sitting at `hpd_idx` and, if it isn't
    /// full, (re)inserts it into the heap matching its *current*
    /// `longest_free_range`. Called after every mutation that might
    /// move an HPD between classes.
    fn reinsert_hpd(&self, guard: &mut ArenaState, hpd_idx: u32) {
        let (is_full, epoch, longest) = {
            let hpd = guard.hpds.get(hpd_idx).expect("reinsert_hpd: unknown hpd index");
            (hpd.is_full(), hpd.epoch, hpd.longest_free_range())
        };
        if !is_full {
            let class = alloc_class(longest as usize) as usize;
            guard.heaps[class].push(epoch, hpd_idx);
            guard.filter |= 1 << class;
        }
    }

    /// Removes `hpd_idx` from whichever heap its *current*
    /// `longest_free_range` says it belongs to. A no-op if the HPD was
    /// full (and therefore in no heap at all).
    fn unlink_hpd(&self, guard: &mut ArenaState, hpd_idx: u32) {
        let longest = guard.hpds.get(hpd_idx).expect("unlink_hpd: unknown hpd index").longest_free_range();
        let class = alloc_class(longest as usize) as usize;
        guard.heaps[class].remove_value(hpd_idx);
        if guard.heaps[class].is_empty() {
            guard.filter &= !(1 << class);
        }
    }

    /// Reserves `pages` contiguous base pages somewhere, creating a
    /// fresh HPD via the region provider if no existing one has room.
    /// Implements spec §4.1's best-fit-then-allocate-new-HPD algorithm.
    fn reserve_pages_locked(&self, guard: &mut ArenaState, pages: usize) -> HpResult<(usize, u32)> {
        debug_assert!(pages > 0 && pages <= PAGES_IN_HUGE_PAGE);
        // Round the request up to the next power of two before bucketing:
        // a heap bucket only guarantees `longest_free_range >= 2^class`, so
        // matching on `alloc_class(pages)` (a floor) can hand back an HPD
        // whose longest run is smaller than `pages` for non-power-of-two
        // sizes. Rounding up guarantees every HPD in the masked buckets
        // actually has room.
        let want_class = alloc_class(pages.next_power_of_two()) as usize;
        let candidate_mask = guard.filter & (u64::MAX << want_class);
        if candidate_mask != 0 {
            let bucket = candidate_mask.trailing_zeros() as usize;
            let (_, hpd_idx) = guard.heaps[bucket].pop().expect("filter bit implies a non-empty heap");
            if guard.heaps[bucket].is_empty() {
                guard.filter &= !(1 << bucket);
            }
            let (start, base) = {
                let hpd = guard.hpds.get_mut(hpd_idx).expect("hpd named by heap must be live");
                let start = hpd.find_free_run(pages).expect("best-fit bucket guarantees a large-enough run");
                hpd.reserve(start, pages);
                (start, hpd.base)
            };
            self.reinsert_hpd(guard, hpd_idx);
            trace!("arena[{}]: reserved {} page(s) from existing hpd {}", self.index, pages, hpd_idx);
            return Ok((base + start * PAGE_SIZE, hpd_idx));
        }

        let base = self.region.acquire(1)?;
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let mut hpd = HugePageDescriptor::new(base, epoch);
        hpd.reserve(0, pages);
        let hpd_idx = guard.hpds.insert(hpd);
        self.reinsert_hpd(guard, hpd_idx);
        debug!("arena[{}]: acquired fresh huge page at {:#x} for {} page(s)", self.index, base, pages);
        Ok((base, hpd_idx))
    }

    /// Releases `[base, base+pages)` back to `hpd_idx`. If the HPD
    /// becomes fully empty its huge page is returned to the region
    /// provider and the descriptor's slot is freed; otherwise the HPD
    /// is reinserted at its new free-space class.
    fn release_pages_locked(&self, guard: &mut ArenaState, hpd_idx: u32, base: usize, pages: usize) {
        self.unlink_hpd(guard, hpd_idx);
        let (offset_pages, hpd_base) = {
            let hpd = guard.hpds.get(hpd_idx).expect("release_pages_locked: unknown hpd index");
            ((base - hpd.base) / PAGE_SIZE, hpd.base)
        };
        let hpd = guard.hpds.get_mut(hpd_idx).expect("release_pages_locked: unknown hpd index");
        hpd.release(offset_pages, pages);
        if hpd.is_empty() {
            guard.hpds.remove(hpd_idx);
            debug!("arena[{}]: hpd {} emptied, releasing huge page at {:#x}", self.index, hpd_idx, hpd_base);
            unsafe { self.region.release(hpd_base, 1) };
        } else {
            self.reinsert_hpd(guard, hpd_idx);
        }
    }

    // ----- Slab (small-class) page runs, used by `Bin` -----

    pub(crate) fn alloc_slab(&self, class_index: u8) -> HpResult<SlabPages> {
        let info = self.bins[class_index as usize].info;
        let mut guard = self.state.lock();
        let (base, hpd_idx) = self.reserve_pages_locked(&mut guard, info.needs_pages)?;
        Ok(SlabPages {
            base,
            hpd_index: Some(hpd_idx),
            pages: info.needs_pages,
            slots: info.slots as u32,
        })
    }

    pub(crate) fn free_slab(&self, pages: SlabPages) {
        let mut guard = self.state.lock();
        let hpd_idx = pages.hpd_index.expect("a slab's pages always came from an hpd");
        self.release_pages_locked(&mut guard, hpd_idx, pages.base, pages.pages);
    }

    // ----- Public allocation surface -----

    pub fn alloc_small(&self, class_index: u8) -> HpResult<(usize, u32)> {
        self.bins[class_index as usize].alloc(self, self.emap)
    }

    pub fn alloc_large(&self, size: usize) -> HpResult<usize> {
        debug_assert!(size <= MAX_ALLOCATION_SIZE);
        let pages = pages_for(size);
        if pages > PAGES_IN_HUGE_PAGE {
            return self.alloc_huge(pages);
        }

        let mut guard = self.state.lock();
        let (base, hpd_idx) = self.reserve_pages_locked(&mut guard, pages)?;
        let extent = Extent::new_large(self.index as u16, base, pages * PAGE_SIZE, Some(hpd_idx));
        let idx = guard.extents.insert(extent);
        let pd = PageDescriptor::new(idx, self.index, 0, None);
        if let Err(e) = self.emap.map(base, pages, pd) {
            guard.extents.remove(idx);
            self.release_pages_locked(&mut guard, hpd_idx, base, pages);
            return Err(e);
        }
        Ok(base)
    }

    /// A huge allocation spans one or more whole huge pages (left
    /// untracked by any HPD, released directly to the region provider)
    /// plus a tail huge page whose leftover pages are tracked by a
    /// fresh HPD like any other (spec §4.1).
    fn alloc_huge(&self, pages: usize) -> HpResult<usize> {
        let leading_huge_pages = (pages - 1) / PAGES_IN_HUGE_PAGE;
        let tail_pages = pages - leading_huge_pages * PAGES_IN_HUGE_PAGE;
        let total_huge_pages = leading_huge_pages + 1;

        let region_base = self.region.acquire(total_huge_pages)?;
        let tail_base = region_base + leading_huge_pages * HUGE_PAGE_SIZE;

        let mut guard = self.state.lock();
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let mut tail_hpd = HugePageDescriptor::new(tail_base, epoch);
        tail_hpd.set(0, tail_pages);
        let tail_hpd_idx = guard.hpds.insert(tail_hpd);
        self.reinsert_hpd(&mut guard, tail_hpd_idx);

        let extent = Extent::new_large(self.index as u16, region_base, pages * PAGE_SIZE, None);
        let extent_idx = guard.extents.insert(extent);
        guard.huge_info.insert(
            extent_idx,
            HugeExtentInfo {
                leading_huge_pages,
                tail_hpd_index: tail_hpd_idx,
            },
        );

        let pd = PageDescriptor::new(extent_idx, self.index, 0, None);
        if let Err(e) = self.emap.map(region_base, pages, pd) {
            guard.huge_info.remove(&extent_idx);
            guard.extents.remove(extent_idx);
            self.release_pages_locked(&mut guard, tail_hpd_idx, tail_base, tail_pages);
            if leading_huge_pages > 0 {
                unsafe { self.region.release(region_base, leading_huge_pages) };
            }
            return Err(e);
        }
        debug!(
            "arena[{}]: huge alloc of {} page(s): {} leading huge page(s) + tail hpd {}",
            self.index, pages, leading_huge_pages, tail_hpd_idx
        );
        Ok(region_base)
    }

    /// Grows or shrinks a live large (non-huge) extent in place.
    /// Returns `false` if there isn't room to grow (the caller must
    /// fall back to alloc+copy+free).
    pub fn resize_large(&self, extent_index: u32, new_pages: usize) -> bool {
        let mut guard = self.state.lock();
        let (old_pages, hpd_index, base) = {
            let e = guard.extents.get(extent_index).expect("resize_large: unknown extent");
            (e.size / PAGE_SIZE, e.hpd_index, e.base)
        };
        if new_pages == old_pages {
            return true;
        }
        let hpd_idx = match hpd_index {
            Some(h) => h,
            None => return false, // huge extents are never resized in place
        };
        if new_pages < old_pages {
            let delta = old_pages - new_pages;
            let trailing_base = base + new_pages * PAGE_SIZE;
            self.emap.clear(trailing_base, delta);
            self.release_pages_locked(&mut guard, hpd_idx, trailing_base, delta);
            guard.extents.get_mut(extent_index).unwrap().size = new_pages * PAGE_SIZE;
            true
        } else {
            self.grow_large_locked(&mut guard, extent_index, base, hpd_idx, old_pages, new_pages)
        }
    }

    fn grow_large_locked(&self, guard: &mut ArenaState, extent_index: u32, base: usize, hpd_idx: u32, old_pages: usize, new_pages: usize) -> bool {
        let delta = new_pages - old_pages;
        let start_of_new = {
            let hpd = guard.hpds.get(hpd_idx).expect("grow_large_locked: unknown hpd index");
            (base - hpd.base) / PAGE_SIZE + old_pages
        };

        self.unlink_hpd(guard, hpd_idx);
        let granted = {
            let hpd = guard.hpds.get_mut(hpd_idx).expect("grow_large_locked: unknown hpd index");
            hpd.try_extend(start_of_new, delta)
        };
        self.reinsert_hpd(guard, hpd_idx);
        if !granted {
            return false;
        }

        let pd = PageDescriptor::new(extent_index, self.index, old_pages as u16, None);
        match self.emap.map(base + old_pages * PAGE_SIZE, delta, pd) {
            Ok(()) => {
                guard.extents.get_mut(extent_index).unwrap().size = new_pages * PAGE_SIZE;
                true
            }
            Err(_) => {
                // The hpd still holds the rest of this same extent's
                // pages, so undoing the grow can never empty it.
                self.unlink_hpd(guard, hpd_idx);
                guard.hpds.get_mut(hpd_idx).unwrap().release(start_of_new, delta);
                self.reinsert_hpd(guard, hpd_idx);
                false
            }
        }
    }

    /// Dispatches a free by consulting `pd` (already looked up by the
    /// caller from the emap). Returns `false` if `pd` doesn't name a
    /// live extent in this arena — a defensive check, not part of the
    /// normal path.
    pub fn free(&self, ptr: usize, pd: PageDescriptor) -> bool {
        let extent_index = match pd.extent_index() {
            Some(i) => i,
            None => return false,
        };
        if pd.arena_index() != self.index {
            return false;
        }

        if pd.is_slab() {
            let sc = pd.size_class().expect("slab page descriptor always carries a size class");
            match self.bins[sc as usize].free(ptr, pd) {
                BinFreeOutcome::StillInUse => {}
                BinFreeOutcome::ExtentEmptied(pages) => {
                    self.emap.clear(pages.base, pages.pages);
                    self.free_slab(pages);
                }
            }
            return true;
        }

        let mut guard = self.state.lock();
        let (base, size, hpd_index) = {
            let e = guard.extents.get(extent_index).expect("emap points at a live extent");
            (e.base, e.size, e.hpd_index)
        };
        debug_assert_eq!(ptr, base, "large free must use the extent's exact base");
        self.emap.clear(base, size / PAGE_SIZE);
        guard.extents.remove(extent_index);

        if let Some(huge_info) = guard.huge_info.remove(&extent_index) {
            let tail_base = base + huge_info.leading_huge_pages * HUGE_PAGE_SIZE;
            let tail_pages = size / PAGE_SIZE - huge_info.leading_huge_pages * PAGES_IN_HUGE_PAGE;
            self.release_pages_locked(&mut guard, huge_info.tail_hpd_index, tail_base, tail_pages);
            if huge_info.leading_huge_pages > 0 {
                unsafe { self.region.release(base, huge_info.leading_huge_pages) };
            }
        } else {
            let hpd_idx = hpd_index.expect("non-huge large extents always have an hpd");
            self.release_pages_locked(&mut guard, hpd_idx, base, size / PAGE_SIZE);
        }
        true
    }

    // ----- Collaborators used by `metadata.rs` -----

    pub fn bin(&self, class_index: u8) -> &Bin {
        &self.bins[class_index as usize]
    }

    /// Runs `f` against the live large/huge extent at `extent_index`
    /// under the arena mutex, for the appendable/finalizable protocol.
    pub fn with_large_extent<R>(&self, extent_index: u32, f: impl FnOnce(&mut Extent) -> R) -> Option<R> {
        let mut guard = self.state.lock();
        let e = guard.extents.get_mut(extent_index)?;
        Some(f(e))
    }

    /// Calls `is_live` for every extent the GC hook (spec §10.7) might
    /// ask about, without exposing the arena's internal slot tables.
    pub fn is_live_extent(&self, extent_index: u32) -> bool {
        let guard = self.state.lock();
        guard.extents.get(extent_index).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::build_small_class_table;
    use crate::region::SystemRegionProvider;
    use once_cell::sync::Lazy;

    static REGION: Lazy<SystemRegionProvider> = Lazy::new(SystemRegionProvider::default);
    static EMAP: Lazy<Emap> = Lazy::new(Emap::new);
    static CLASSES: Lazy<[SmallClassInfo; NUM_SMALL_CLASSES]> = Lazy::new(build_small_class_table);

    fn test_arena(index: u8) -> Arena {
        Arena::new(index, &*REGION, &*EMAP, &*CLASSES)
    }

    #[test]
    fn alloc_small_then_free_round_trips() {
        let arena = test_arena(0);
        let (ptr, _) = arena.alloc_small(3).expect("alloc_small should succeed");
        let pd = arena.emap().lookup(ptr);
        assert!(pd.is_slab());
        assert!(arena.free(ptr, pd));
        assert!(arena.emap().lookup(ptr).is_empty() || arena.emap().lookup(ptr).extent_index() != pd.extent_index());
    }

    #[test]
    fn alloc_large_reserves_exact_pages_and_frees() {
        let arena = test_arena(1);
        let ptr = arena.alloc_large(3 * PAGE_SIZE).expect("alloc_large should succeed");
        let pd = arena.emap().lookup(ptr);
        assert!(!pd.is_slab());
        assert_eq!(pd.arena_index(), 1);
        assert!(arena.free(ptr, pd));
    }

    #[test]
    fn alloc_huge_splits_into_leading_pages_and_tail_hpd() {
        let arena = test_arena(2);
        let pages = PAGES_IN_HUGE_PAGE + 10;
        let ptr = arena.alloc_huge(pages).expect("alloc_huge should succeed");
        let pd = arena.emap().lookup(ptr);
        assert_eq!(pd.extent_index(), pd.extent_index());
        assert!(arena.free(ptr, pd));
    }

    #[test]
    fn resize_large_shrink_then_grow() {
        let arena = test_arena(3);
        let ptr = arena.alloc_large(8 * PAGE_SIZE).expect("alloc_large should succeed");
        let pd = arena.emap().lookup(ptr);
        let idx = pd.extent_index().unwrap();
        assert!(arena.resize_large(idx, 4));
        assert!(arena.resize_large(idx, 6));
        assert!(arena.free(ptr, arena.emap().lookup(ptr)));
    }

    #[test]
    fn reused_hpd_is_preferred_over_a_fresh_one() {
        let arena = test_arena(4);
        let a = arena.alloc_small(0).expect("alloc_small should succeed");
        let b = arena.alloc_small(0).expect("alloc_small should succeed");
        let pd_a = arena.emap().lookup(a.0);
        let pd_b = arena.emap().lookup(b.0);
        // Both tiny slabs should have landed in the same hpd's free space
        // rather than each forcing a fresh region acquisition.
        assert_eq!(pd_a.arena_index(), pd_b.arena_index());
    }
}
