//! Extent — a contiguous page-run and its slab/large metadata (spec §3/§4.3).

const BITMAP_WORDS: usize = 8; // 512 bits

/// What an extent's pages hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    /// A slab of equal-sized objects in size class `size_class`
    /// (index into `config::SMALL_CLASS_SIZES`).
    Slab { size_class: u8 },
    /// A single large (whole-extent) allocation.
    Large,
}

/// Optional finalizer callback invoked by `destroy` (spec §4.5).
pub type Finalizer = fn(*mut u8, usize);

/// Per-object appendable/finalizable side data (spec §4.5/§11). Large
/// extents hold one of these inline (`used_capacity`/`finalizer`
/// below); slab slots hold one in their owning `Bin`'s side map,
/// keyed by slot index, since a slab extent has many objects sharing
/// one set of per-extent fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotMeta {
    pub used_capacity: usize,
    pub finalizer: Option<Finalizer>,
}

/// Per-page-run descriptor. One of these per extent the arena has
/// carved out, for as long as the extent is live.
#[derive(Debug)]
pub struct Extent {
    pub arena_index: u16,
    pub base: usize,
    /// Size in bytes, always a page multiple.
    pub size: usize,
    /// Index of the backing HPD within the owning arena's HPD slot
    /// array, or `None` for a huge extent (which spans multiple whole
    /// huge pages plus a tail huge page tracked separately — see
    /// `Arena`'s huge-allocation bookkeeping and DESIGN.md's open
    /// question decision on this field).
    pub hpd_index: Option<u32>,
    pub kind: ExtentKind,

    // --- slab-only fields ---
    occupancy: [u64; BITMAP_WORDS],
    has_meta: [u64; BITMAP_WORDS],
    free_slots: u32,
    slots: u32,

    // --- large-only fields ---
    used_capacity: usize,
    finalizer: Option<Finalizer>,
}

impl Extent {
    pub fn new_slab(arena_index: u16, base: usize, size: usize, size_class: u8, hpd_index: Option<u32>, slots: u32) -> Self {
        Extent {
            arena_index,
            base,
            size,
            hpd_index,
            kind: ExtentKind::Slab { size_class },
            occupancy: [0u64; BITMAP_WORDS],
            has_meta: [0u64; BITMAP_WORDS],
            free_slots: slots,
            slots,
            used_capacity: 0,
            finalizer: None,
        }
    }

    pub fn new_large(arena_index: u16, base: usize, size: usize, hpd_index: Option<u32>) -> Self {
        Extent {
            arena_index,
            base,
            size,
            hpd_index,
            kind: ExtentKind::Large,
            occupancy: [0u64; BITMAP_WORDS],
            has_meta: [0u64; BITMAP_WORDS],
            free_slots: 0,
            slots: 0,
            used_capacity: 0,
            finalizer: None,
        }
    }

    #[inline]
    pub fn is_slab(&self) -> bool {
        matches!(self.kind, ExtentKind::Slab { .. })
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        matches!(self.kind, ExtentKind::Large)
    }

    #[inline]
    pub fn size_class(&self) -> Option<u8> {
        match self.kind {
            ExtentKind::Slab { size_class } => Some(size_class),
            ExtentKind::Large => None,
        }
    }

    #[inline]
    pub fn contains(&self, ptr: usize) -> bool {
        ptr >= self.base && ptr < self.base + self.size
    }

    #[inline]
    pub fn free_slots(&self) -> u32 {
        self.free_slots
    }

    #[inline]
    pub fn slots(&self) -> u32 {
        self.slots
    }

    #[inline]
    pub fn has_free_slots(&self) -> bool {
        self.free_slots > 0
    }

    #[inline]
    pub fn is_slab_full(&self) -> bool {
        debug_assert!(self.is_slab());
        self.free_slots == 0
    }

    #[inline]
    pub fn is_slab_empty(&self) -> bool {
        debug_assert!(self.is_slab());
        self.free_slots == self.slots
    }

    #[inline]
    fn bit(bitmap: &[u64; BITMAP_WORDS], idx: usize) -> bool {
        bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    #[inline]
    fn set_bit(bitmap: &mut [u64; BITMAP_WORDS], idx: usize) {
        bitmap[idx / 64] |= 1 << (idx % 64);
    }

    #[inline]
    fn clear_bit(bitmap: &mut [u64; BITMAP_WORDS], idx: usize) {
        bitmap[idx / 64] &= !(1 << (idx % 64));
    }

    /// Sets the first free bit in the occupancy bitmap and returns its
    /// index. Panics if the slab is full (callers must check
    /// `has_free_slots` first).
    pub fn allocate(&mut self) -> usize {
        debug_assert!(self.is_slab());
        debug_assert!(self.free_slots > 0, "allocate on a full slab");
        for (word_idx, word) in self.occupancy.iter().enumerate() {
            if *word != u64::MAX {
                let bit_idx = (!*word).trailing_zeros() as usize;
                let idx = word_idx * 64 + bit_idx;
                if idx >= self.slots as usize {
                    continue;
                }
                Self::set_bit(&mut self.occupancy, idx);
                self.free_slots -= 1;
                self.check_bitmap_coherent();
                return idx;
            }
        }
        unreachable!("free_slots > 0 but no free bit found");
    }

    /// Clears the occupancy bit for `index`. Asserts the bit was set
    /// (spec §4.3: "assert the bit was set").
    pub fn free(&mut self, index: usize) {
        debug_assert!(self.is_slab());
        assert!(
            Self::bit(&self.occupancy, index),
            "double free or corrupt index {}",
            index
        );
        Self::clear_bit(&mut self.occupancy, index);
        Self::clear_bit(&mut self.has_meta, index);
        self.free_slots += 1;
        self.check_bitmap_coherent();
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        Self::bit(&self.occupancy, index)
    }

    pub fn set_has_meta(&mut self, index: usize) {
        Self::set_bit(&mut self.has_meta, index);
    }

    pub fn clear_has_meta(&mut self, index: usize) {
        Self::clear_bit(&mut self.has_meta, index);
    }

    pub fn has_meta(&self, index: usize) -> bool {
        Self::bit(&self.has_meta, index)
    }

    fn check_bitmap_coherent(&self) {
        if cfg!(debug_assertions) {
            let set_bits: u32 = self.occupancy.iter().map(|w| w.count_ones()).sum();
            debug_assert_eq!(set_bits + self.free_slots, self.slots);
        }
    }

    // --- large-only accessors ---

    pub fn used_capacity(&self) -> usize {
        debug_assert!(self.is_large());
        self.used_capacity
    }

    pub fn set_used_capacity(&mut self, n: usize) {
        debug_assert!(self.is_large());
        debug_assert!(n <= self.size);
        self.used_capacity = n;
    }

    pub fn finalizer(&self) -> Option<Finalizer> {
        debug_assert!(self.is_large());
        self.finalizer
    }

    pub fn set_finalizer(&mut self, f: Option<Finalizer>) {
        debug_assert!(self.is_large());
        self.finalizer = f;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slab(slots: u32) -> Extent {
        Extent::new_slab(0, 0x10000, 4096, 3, Some(0), slots)
    }

    #[test]
    fn allocate_sets_first_free_bit() {
        let mut e = slab(4);
        assert_eq!(e.allocate(), 0);
        assert_eq!(e.allocate(), 1);
        assert!(e.is_allocated(0));
        assert!(e.is_allocated(1));
        assert!(!e.is_allocated(2));
        assert_eq!(e.free_slots(), 2);
    }

    #[test]
    fn free_clears_bit_and_meta() {
        let mut e = slab(4);
        let idx = e.allocate();
        e.set_has_meta(idx);
        assert!(e.has_meta(idx));
        e.free(idx);
        assert!(!e.is_allocated(idx));
        assert!(!e.has_meta(idx));
        assert_eq!(e.free_slots(), 4);
    }

    #[test]
    #[should_panic]
    fn double_free_panics() {
        let mut e = slab(4);
        let idx = e.allocate();
        e.free(idx);
        e.free(idx);
    }

    #[test]
    fn full_and_empty_states() {
        let mut e = slab(2);
        assert!(e.is_slab_empty());
        e.allocate();
        e.allocate();
        assert!(e.is_slab_full());
        assert!(!e.has_free_slots());
    }

    #[test]
    fn contains_respects_bounds() {
        let e = slab(4);
        assert!(e.contains(0x10000));
        assert!(e.contains(0x10fff));
        assert!(!e.contains(0xffff));
        assert!(!e.contains(0x11000));
    }

    #[test]
    fn large_extent_tracks_capacity_and_finalizer() {
        let mut e = Extent::new_large(0, 0x20000, 3 * 4096, Some(1));
        assert!(e.is_large());
        e.set_used_capacity(100);
        assert_eq!(e.used_capacity(), 100);
        fn noop(_p: *mut u8, _n: usize) {}
        e.set_finalizer(Some(noop));
        assert!(e.finalizer().is_some());
    }

    #[test]
    fn popcount_plus_free_slots_matches_total() {
        let mut e = slab(64);
        for _ in 0..10 {
            e.allocate();
        }
        let popcount: u32 = (0..64).filter(|&i| e.is_allocated(i)).count() as u32;
        assert_eq!(popcount + e.free_slots(), e.slots());
    }
}
