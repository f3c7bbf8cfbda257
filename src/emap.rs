//! Page-to-descriptor map (emap) — spec §3/§4.4.
//!
//! A two-level radix trie from page-aligned address to a packed
//! [`PageDescriptor`]. Leaf entries are single atomic words; readers
//! never take a lock. Only a writer that must allocate a fresh leaf
//! (the interior node of the trie) takes `alloc_lock`, mirroring
//! `rstcmalloc`'s `PageMap`/`register_span` shape (`examples/other_examples`)
//! generalized from a flat array to a two-level trie sized for a
//! 48-bit address space.

use crate::config::{ADDRESS_SPACE_BITS, PAGE_SIZE};
use crate::error::{HpError, HpResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

const PAGE_SHIFT: u32 = 12; // log2(PAGE_SIZE); config asserts this matches below.
const L2_BITS: u32 = 16;
const L1_BITS: u32 = ADDRESS_SPACE_BITS - PAGE_SHIFT - L2_BITS;
const L1_LEN: usize = 1 << L1_BITS;
const L2_LEN: usize = 1 << L2_BITS;
const L2_MASK: u64 = (L2_LEN as u64) - 1;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// A 64-bit packed page descriptor (spec §3 "Page descriptor").
///
/// Layout (low to high bit):
/// - `[0..32)`  extent slot index, biased by +1 so that an all-zero
///   word means "no extent" (the "zero sentinel" spec §4.4 calls for)
/// - `[32..40)` arena index
/// - `[40..56)` page index within the extent
/// - `[56)`     is-slab flag
/// - `[57..62)` size class (only meaningful when is-slab is set)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDescriptor(u64);

impl PageDescriptor {
    pub fn empty() -> Self {
        PageDescriptor(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn new(extent_index: u32, arena_index: u8, page_index_in_extent: u16, slab_size_class: Option<u8>) -> Self {
        let biased = extent_index as u64 + 1;
        let mut raw = biased;
        raw |= (arena_index as u64) << 32;
        raw |= (page_index_in_extent as u64) << 40;
        if let Some(sc) = slab_size_class {
            raw |= 1u64 << 56;
            raw |= (sc as u64) << 57;
        }
        PageDescriptor(raw)
    }

    pub fn extent_index(&self) -> Option<u32> {
        let biased = self.0 & 0xFFFF_FFFF;
        if biased == 0 {
            None
        } else {
            Some((biased - 1) as u32)
        }
    }

    pub fn arena_index(&self) -> u8 {
        ((self.0 >> 32) & 0xFF) as u8
    }

    pub fn page_index_in_extent(&self) -> u16 {
        ((self.0 >> 40) & 0xFFFF) as u16
    }

    pub fn is_slab(&self) -> bool {
        (self.0 >> 56) & 1 != 0
    }

    pub fn size_class(&self) -> Option<u8> {
        if self.is_slab() {
            Some(((self.0 >> 57) & 0x1F) as u8)
        } else {
            None
        }
    }

    /// Returns a copy with the embedded page index advanced by `k`,
    /// per spec §4.4's `map` contract ("the descriptor for page `i`
    /// from base is `starting_pd.next(i)`").
    pub fn next(&self, k: u16) -> Self {
        let cleared = self.0 & !(0xFFFFu64 << 40);
        let new_page_index = self.page_index_in_extent().wrapping_add(k);
        PageDescriptor(cleared | ((new_page_index as u64) << 40))
    }

    fn to_raw(self) -> u64 {
        self.0
    }

    fn from_raw(raw: u64) -> Self {
        PageDescriptor(raw)
    }
}

struct Leaf {
    entries: Box<[AtomicU64]>,
}

impl Leaf {
    fn new() -> Box<Leaf> {
        let mut v = Vec::with_capacity(L2_LEN);
        for _ in 0..L2_LEN {
            v.push(AtomicU64::new(0));
        }
        Box::new(Leaf {
            entries: v.into_boxed_slice(),
        })
    }
}

/// The concurrent radix trie itself.
pub struct Emap {
    l1: Box<[AtomicPtr<Leaf>]>,
    alloc_lock: Mutex<()>,
}

fn split(addr: usize) -> (usize, usize) {
    let page_idx = (addr >> PAGE_SHIFT) as u64;
    let l1_idx = (page_idx >> L2_BITS) as usize;
    let l2_idx = (page_idx & L2_MASK) as usize;
    (l1_idx, l2_idx)
}

impl Emap {
    pub fn new() -> Self {
        let mut l1 = Vec::with_capacity(L1_LEN);
        for _ in 0..L1_LEN {
            l1.push(AtomicPtr::new(std::ptr::null_mut()));
        }
        Emap {
            l1: l1.into_boxed_slice(),
            alloc_lock: Mutex::new(()),
        }
    }

    /// Rounds `addr` down to page alignment and returns the stored
    /// descriptor, or the empty sentinel if the page is unmapped.
    /// Lock-free: a single atomic load per level after the (cached)
    /// leaf pointer.
    pub fn lookup(&self, addr: usize) -> PageDescriptor {
        let addr = addr & !(PAGE_SIZE - 1);
        let (l1_idx, l2_idx) = split(addr);
        if l1_idx >= self.l1.len() {
            return PageDescriptor::empty();
        }
        let leaf_ptr = self.l1[l1_idx].load(Ordering::Acquire);
        if leaf_ptr.is_null() {
            return PageDescriptor::empty();
        }
        // SAFETY: leaf pointers are only ever set to a live, never-freed
        // `Box<Leaf>` (until the whole `Emap` drops) by `ensure_leaf`.
        let leaf = unsafe { &*leaf_ptr };
        PageDescriptor::from_raw(leaf.entries[l2_idx].load(Ordering::Acquire))
    }

    fn ensure_leaf(&self, l1_idx: usize) -> HpResult<&Leaf> {
        if l1_idx >= self.l1.len() {
            return Err(HpError::InvalidArgument);
        }
        let existing = self.l1[l1_idx].load(Ordering::Acquire);
        if !existing.is_null() {
            return Ok(unsafe { &*existing });
        }
        let _guard = self.alloc_lock.lock();
        // Re-check under the lock: another writer may have raced us.
        let existing = self.l1[l1_idx].load(Ordering::Acquire);
        if !existing.is_null() {
            return Ok(unsafe { &*existing });
        }
        let leaf = Box::into_raw(Leaf::new());
        self.l1[l1_idx].store(leaf, Ordering::Release);
        Ok(unsafe { &*leaf })
    }

    /// Sets the descriptors for pages `[base, base + page_count * PAGE_SIZE)`.
    /// The descriptor for page `i` from `base` is `starting_pd.next(i)`.
    pub fn map(&self, base: usize, page_count: usize, starting_pd: PageDescriptor) -> HpResult<()> {
        debug_assert_eq!(base % PAGE_SIZE, 0);
        for i in 0..page_count {
            let addr = base + i * PAGE_SIZE;
            let (l1_idx, l2_idx) = split(addr);
            let leaf = self.ensure_leaf(l1_idx)?;
            let pd = starting_pd.next(i as u16);
            leaf.entries[l2_idx].store(pd.to_raw(), Ordering::Release);
        }
        Ok(())
    }

    /// Resets the descriptors for `[base, base + page_count * PAGE_SIZE)`
    /// to the empty sentinel.
    pub fn clear(&self, base: usize, page_count: usize) {
        debug_assert_eq!(base % PAGE_SIZE, 0);
        for i in 0..page_count {
            let addr = base + i * PAGE_SIZE;
            let (l1_idx, l2_idx) = split(addr);
            if l1_idx >= self.l1.len() {
                continue;
            }
            let leaf_ptr = self.l1[l1_idx].load(Ordering::Acquire);
            if leaf_ptr.is_null() {
                continue;
            }
            let leaf = unsafe { &*leaf_ptr };
            leaf.entries[l2_idx].store(0, Ordering::Release);
        }
    }

    /// Calls `f` for every currently-mapped page, passing its address
    /// and descriptor. This is the entire lookup surface the
    /// tracing-GC collaborator needs (spec §9/§10.7) — no scanning or
    /// marking logic lives here.
    pub fn for_each_mapped_extent(&self, mut f: impl FnMut(usize, PageDescriptor)) {
        for (l1_idx, slot) in self.l1.iter().enumerate() {
            let leaf_ptr = slot.load(Ordering::Acquire);
            if leaf_ptr.is_null() {
                continue;
            }
            let leaf = unsafe { &*leaf_ptr };
            for (l2_idx, entry) in leaf.entries.iter().enumerate() {
                let raw = entry.load(Ordering::Acquire);
                if raw == 0 {
                    continue;
                }
                let page_idx = ((l1_idx as u64) << L2_BITS) | l2_idx as u64;
                let addr = (page_idx << PAGE_SHIFT) as usize;
                f(addr, PageDescriptor::from_raw(raw));
            }
        }
    }
}

impl Default for Emap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Emap {
    fn drop(&mut self) {
        for slot in self.l1.iter() {
            let leaf_ptr = slot.load(Ordering::Acquire);
            if !leaf_ptr.is_null() {
                // SAFETY: each non-null slot owns exactly one leaf,
                // never shared or double-freed.
                unsafe {
                    drop(Box::from_raw(leaf_ptr));
                }
            }
        }
    }
}

// Safety: all mutable access to leaves is through atomics; the `Box`
// pointers in `l1` are only read/written via `AtomicPtr`.
unsafe impl Send for Emap {}
unsafe impl Sync for Emap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_on_empty_trie_is_sentinel() {
        let emap = Emap::new();
        assert!(emap.lookup(0x1000).is_empty());
    }

    #[test]
    fn map_then_lookup_round_trips() {
        let emap = Emap::new();
        let base = 4 * PAGE_SIZE * L2_LEN; // land in a fresh leaf
        let pd = PageDescriptor::new(7, 2, 0, Some(3));
        emap.map(base, 4, pd).unwrap();
        for i in 0..4u16 {
            let got = emap.lookup(base + i as usize * PAGE_SIZE);
            assert_eq!(got.extent_index(), Some(7));
            assert_eq!(got.arena_index(), 2);
            assert_eq!(got.page_index_in_extent(), i);
            assert_eq!(got.size_class(), Some(3));
        }
    }

    #[test]
    fn clear_resets_to_sentinel() {
        let emap = Emap::new();
        let base = 10 * PAGE_SIZE * L2_LEN;
        let pd = PageDescriptor::new(1, 0, 0, None);
        emap.map(base, 2, pd).unwrap();
        emap.clear(base, 2);
        assert!(emap.lookup(base).is_empty());
        assert!(emap.lookup(base + PAGE_SIZE).is_empty());
    }

    #[test]
    fn lookup_rounds_down_to_page_boundary() {
        let emap = Emap::new();
        let base = 20 * PAGE_SIZE * L2_LEN;
        let pd = PageDescriptor::new(5, 0, 0, None);
        emap.map(base, 1, pd).unwrap();
        let got = emap.lookup(base + 37);
        assert_eq!(got.extent_index(), Some(5));
    }

    #[test]
    fn page_descriptor_packs_and_unpacks_large_extent() {
        let pd = PageDescriptor::new(123, 9, 5, None);
        assert_eq!(pd.extent_index(), Some(123));
        assert_eq!(pd.arena_index(), 9);
        assert_eq!(pd.page_index_in_extent(), 5);
        assert!(!pd.is_slab());
        assert_eq!(pd.size_class(), None);
    }

    #[test]
    fn for_each_mapped_extent_visits_every_live_page() {
        let emap = Emap::new();
        let base = 30 * PAGE_SIZE * L2_LEN;
        emap.map(base, 3, PageDescriptor::new(2, 0, 0, None)).unwrap();
        let mut seen = 0;
        emap.for_each_mapped_extent(|_addr, pd| {
            if pd.extent_index() == Some(2) {
                seen += 1;
            }
        });
        assert_eq!(seen, 3);
    }
}
