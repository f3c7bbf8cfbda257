//! Bin — per small-size-class slab allocator within an arena (spec §4.2).
//!
//! Grounded on the teacher's `SCAllocator` (`sc.rs`): a current slab
//! plus a pool of other partial slabs, generalized from the teacher's
//! three owned linked lists (empty/partial/full) to the spec's
//! current+heap model, where full slabs are simply untracked (they
//! need no list — `free` finds them again through the emap, not
//! through bin bookkeeping).
//!
//! # Index-math note
//! Spec §4.2 writes the slot-offset formula as
//! `align_down(ptr, PageSize) - slab_base + pd.page_index * PageSize`.
//! Taken literally this discards the sub-page remainder of `ptr`,
//! which cannot be right for any slot that doesn't start on a page
//! boundary. This implementation uses the equivalent-when-correct and
//! always-exact `ptr - extent.base`, which needs neither `align_down`
//! nor the page index and is what every slab implementation we
//! grounded this on (teacher's `pages.rs`, single-page case) actually
//! computes. See DESIGN.md's open-question log.

use crate::arena::{Arena, SlabPages};
use crate::config::{SmallClassInfo, PAGE_SIZE};
use crate::emap::{Emap, PageDescriptor};
use crate::error::HpResult;
use crate::extent::{Extent, Finalizer, SlotMeta};
use crate::primitives::{IndexHeap, SlotTable};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Outcome of `Bin::free`, telling the caller (always `Arena::free`)
/// whether the underlying slab's pages must be released.
pub enum BinFreeOutcome {
    StillInUse,
    ExtentEmptied(SlabPages),
}

struct BinState {
    /// Slab extents owned by this bin (spec §9: referenced "by raw
    /// index-pointer", never shared with the arena or the emap).
    slots: SlotTable<Extent>,
    /// The slab currently being allocated from, if any. Invariant (a):
    /// whenever the bin mutex is not held, `current` (if `Some`) names
    /// a slab with at least one free slot.
    current: Option<u32>,
    /// Other partial slabs, keyed by base address for determinism.
    /// Invariant (b): entries here are non-full, non-empty, except
    /// those with `slots == 1` (never inserted — they flip straight
    /// from full to empty with no partial state in between).
    partial: IndexHeap<usize, u32>,
    /// Appendable/finalizable side data for slots whose extent's
    /// `has_meta` bit is set. Absent entries mean "plain allocation",
    /// not "zero capacity" — see `Bin::capacity`.
    meta: HashMap<(u32, usize), SlotMeta>,
}

pub struct Bin {
    pub(crate) class_index: u8,
    pub(crate) info: SmallClassInfo,
    state: Mutex<BinState>,
}

impl Bin {
    pub fn new(class_index: u8, info: SmallClassInfo) -> Self {
        Bin {
            class_index,
            info,
            state: Mutex::new(BinState {
                slots: SlotTable::new(),
                current: None,
                partial: IndexHeap::new(),
                meta: HashMap::new(),
            }),
        }
    }

    /// Allocates one object. Returns the pointer and the bin-local
    /// extent slot id, which the caller packs into the emap's page
    /// descriptor alongside the arena index.
    pub fn alloc(&self, arena: &Arena, emap: &Emap) -> HpResult<(usize, u32)> {
        loop {
            let mut guard = self.state.lock();

            if let Some(idx) = guard.current {
                if guard.slots.get(idx).map(|e| e.has_free_slots()).unwrap_or(false) {
                    let extent = guard.slots.get_mut(idx).unwrap();
                    let slot = extent.allocate();
                    let ptr = extent.base + slot * self.info.item_size;
                    if !extent.has_free_slots() {
                        guard.current = None;
                    }
                    trace!("bin[{}]: allocated {:#x} from extent {}", self.info.item_size, ptr, idx);
                    return Ok((ptr, idx));
                }
            }

            if let Some((_, idx)) = guard.partial.pop() {
                guard.current = Some(idx);
                continue;
            }

            // Slow path (spec §4.2 step 3/§5): release the bin mutex
            // before the potentially slow, lock-acquiring arena call.
            drop(guard);
            let fresh = arena.alloc_slab(self.class_index)?;

            let mut guard = self.state.lock();
            let race_winner_installed = guard
                .current
                .map(|idx| guard.slots.get(idx).map(|e| e.has_free_slots()).unwrap_or(false))
                .unwrap_or(false);
            if race_winner_installed {
                debug!(
                    "bin[{}]: lost the slab-acquisition race, returning spare slab",
                    self.info.item_size
                );
                arena.free_slab(fresh);
            } else {
                match self.install_fresh_slab(&mut guard, arena, emap, fresh) {
                    Ok(()) => {}
                    Err(e) => {
                        arena.free_slab(fresh);
                        return Err(e);
                    }
                }
            }
            drop(guard);
            // Loop back to top: current is now guaranteed usable.
        }
    }

    fn install_fresh_slab(&self, guard: &mut BinState, arena: &Arena, emap: &Emap, fresh: SlabPages) -> HpResult<()> {
        let extent = Extent::new_slab(
            arena.index() as u16,
            fresh.base,
            fresh.pages * PAGE_SIZE,
            self.class_index,
            fresh.hpd_index,
            fresh.slots,
        );
        let idx = guard.slots.insert(extent);
        let pd = PageDescriptor::new(idx, arena.index(), 0, Some(self.class_index));
        if let Err(e) = emap.map(fresh.base, fresh.pages, pd) {
            guard.slots.remove(idx);
            return Err(e);
        }
        guard.current = Some(idx);
        Ok(())
    }

    /// Frees the slot addressed by `ptr`/`pd`. `pd` must be a slab
    /// descriptor previously produced by this bin (the caller, `Arena::free`,
    /// has already verified this via the emap lookup).
    pub fn free(&self, ptr: usize, pd: PageDescriptor) -> BinFreeOutcome {
        let idx = pd.extent_index().expect("slab page descriptor always carries an extent index");
        let mut guard = self.state.lock();

        let base = guard
            .slots
            .get(idx)
            .expect("freed ptr names a live slab extent")
            .base;
        let offset = ptr - base;
        let slot = ((offset as u64 * self.info.mul) >> self.info.shift) as usize;

        let (became_empty, was_full) = {
            let extent = guard.slots.get_mut(idx).expect("freed ptr names a live slab extent");
            let was_full = extent.is_slab_full();
            extent.free(slot);
            (extent.is_slab_empty(), was_full)
        };

        guard.meta.remove(&(idx, slot));

        if became_empty {
            if guard.current == Some(idx) {
                guard.current = None;
            } else if guard.slots.get(idx).map(|e| e.slots() > 1).unwrap_or(false) {
                guard.partial.remove_value(idx);
            }
            let extent = guard.slots.remove(idx);
            debug!("bin[{}]: extent {} fully emptied, releasing pages", self.info.item_size, idx);
            BinFreeOutcome::ExtentEmptied(SlabPages {
                base: extent.base,
                hpd_index: extent.hpd_index,
                pages: extent.size / PAGE_SIZE,
                slots: extent.slots(),
            })
        } else {
            if was_full && guard.current != Some(idx) {
                guard.partial.push(base, idx);
            }
            BinFreeOutcome::StillInUse
        }
    }

    /// Used by the appendable/finalizable protocol (`metadata.rs`) to
    /// read/write per-slot side data without re-deriving the slot index.
    pub fn with_extent<R>(&self, extent_index: u32, f: impl FnOnce(&mut Extent, usize, &SmallClassInfo) -> R) -> Option<R> {
        let mut guard = self.state.lock();
        let base = guard.slots.get(extent_index)?.base;
        let extent = guard.slots.get_mut(extent_index)?;
        Some(f(extent, base, &self.info))
    }

    /// The recorded used capacity for an appendable slot, or `None` if
    /// this slot was never made appendable (spec §4.5's `getCapacity`
    /// returns 0 unconditionally for such slots).
    pub fn used_capacity(&self, extent_index: u32, slot: usize) -> Option<usize> {
        let guard = self.state.lock();
        guard.meta.get(&(extent_index, slot)).map(|m| m.used_capacity)
    }

    /// Starts or updates appendable tracking for a slot, recording the
    /// logical length currently in use. Also flips the extent's
    /// `has_meta` bit so `destroy` knows to consult this map.
    pub fn set_capacity(&self, extent_index: u32, slot: usize, used_capacity: usize) {
        debug_assert!(used_capacity <= self.info.item_size);
        let mut guard = self.state.lock();
        guard.meta.entry((extent_index, slot)).or_default().used_capacity = used_capacity;
        if let Some(extent) = guard.slots.get_mut(extent_index) {
            extent.set_has_meta(slot);
        }
    }

    pub fn finalizer(&self, extent_index: u32, slot: usize) -> Option<Finalizer> {
        let guard = self.state.lock();
        guard.meta.get(&(extent_index, slot)).and_then(|m| m.finalizer)
    }

    pub fn set_finalizer(&self, extent_index: u32, slot: usize, f: Option<Finalizer>) {
        let mut guard = self.state.lock();
        guard.meta.entry((extent_index, slot)).or_default().finalizer = f;
        if let Some(extent) = guard.slots.get_mut(extent_index) {
            extent.set_has_meta(slot);
        }
    }

    #[inline]
    pub fn item_size(&self) -> usize {
        self.info.item_size
    }

    /// Recovers the slot-within-extent index for `ptr`, the same
    /// magic-division computation `free` uses, exposed for the
    /// appendable/finalizable protocol which needs it to key `meta`.
    pub fn slot_of(&self, extent_index: u32, ptr: usize) -> usize {
        let guard = self.state.lock();
        let base = guard.slots.get(extent_index).expect("slot_of: unknown extent").base;
        let offset = ptr - base;
        ((offset as u64 * self.info.mul) >> self.info.shift) as usize
    }
}
