//! A thread-caching, per-CPU-arena memory allocator.
//!
//! # Overview
//!
//! The organization is as follows:
//!
//!  * A fixed-size pool of [`arena::Arena`]s, one per `(cpu, contains_pointers)`
//!    pair, each owning a set of huge-page descriptors and large extents.
//!  * Each arena in turn owns one [`bin::Bin`] per small size class, which
//!    carves huge pages into slabs of equal-sized objects.
//!  * A page-to-descriptor map ([`emap::Emap`]) lets any pointer be routed
//!    back to its owning arena/extent without walking any list.
//!  * The [`metadata`] module layers an appendable/finalizable protocol on
//!    top, so callers can track a used-capacity watermark and an optional
//!    destructor without a per-object header.
//!
//! The thin [`thread_cache`] front-end is the only thing a caller touches
//! directly through the free functions below; it picks an arena for fresh
//! allocations and otherwise defers entirely to the emap.
//!
//! # Implementing `GlobalAlloc`
//! See [`HpGlobalAlloc`] for a ready-made `#[global_allocator]` wrapper.

mod arena;
mod bin;
mod config;
mod emap;
mod error;
mod extent;
mod hpd;
mod metadata;
mod primitives;
mod region;
mod thread_cache;

#[cfg(test)]
mod tests;

pub use config::{MAX_ALLOCATION_SIZE, PAGE_SIZE};
pub use emap::PageDescriptor;
pub use error::{HpError, HpResult};
pub use extent::Finalizer;
pub use region::RegionProvider;

use arena::Arena;
use config::{build_small_class_table, pages_for, small_class_index, NUM_SMALL_CLASSES};
use emap::Emap;
use log::{error, warn};
use once_cell::sync::{Lazy, OnceCell};
use region::SystemRegionProvider;
use std::alloc::{GlobalAlloc, Layout};

static REGION_PROVIDER: OnceCell<Box<dyn RegionProvider>> = OnceCell::new();
static EMAP: Lazy<Emap> = Lazy::new(Emap::new);
static CLASS_TABLE: Lazy<[config::SmallClassInfo; NUM_SMALL_CLASSES]> = Lazy::new(build_small_class_table);
static NUM_CPUS: Lazy<usize> = Lazy::new(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

/// One arena per `(cpu_id, contains_pointers)` pair, `contains_pointers`
/// as the low bit. Built once, on first use.
static ARENAS: Lazy<Vec<Arena>> = Lazy::new(|| {
    let n = *NUM_CPUS * 2;
    (0..n)
        .map(|i| Arena::new(i as u8, region_provider(), &*EMAP, &*CLASS_TABLE))
        .collect()
});

fn region_provider() -> &'static dyn RegionProvider {
    REGION_PROVIDER.get_or_init(|| Box::new(SystemRegionProvider::default())).as_ref()
}

/// Installs a custom region provider (e.g. a kernel's physical-page
/// allocator instead of `mmap`). Must be called before the first
/// allocation; returns `Err(())` if a provider (or the default) is
/// already in place.
pub fn set_region_provider(provider: Box<dyn RegionProvider>) -> Result<(), ()> {
    REGION_PROVIDER.set(provider).map_err(|_| ())
}

fn arena_by_index(idx: u8) -> &'static Arena {
    &ARENAS[idx as usize]
}

pub(crate) fn num_cpus() -> usize {
    *NUM_CPUS
}

fn arena_for_ptr(addr: usize) -> Option<(&'static Arena, PageDescriptor)> {
    let pd = EMAP.lookup(addr);
    if pd.is_empty() {
        None
    } else {
        Some((arena_by_index(pd.arena_index()), pd))
    }
}

fn arena_for_alloc(contains_pointers: bool) -> &'static Arena {
    thread_cache::with_arena(contains_pointers, |arena| arena)
}

/// Allocates `size` bytes, zeroing them first if `zero` is set.
/// `contains_pointers` steers the request to the arena pool a tracing
/// collector would scan, per spec §9's arena-selection design note.
/// Returns null on any failure (zero size, size above
/// [`MAX_ALLOCATION_SIZE`], or out of memory).
pub fn alloc(size: usize, contains_pointers: bool, zero: bool) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }
    if size > MAX_ALLOCATION_SIZE {
        warn!("alloc: requested size {} exceeds MaxAllocationSize", size);
        return std::ptr::null_mut();
    }
    let arena = arena_for_alloc(contains_pointers);
    let result = match small_class_index(size) {
        Some(sc) => arena.alloc_small(sc as u8).map(|(ptr, _)| ptr),
        None => arena.alloc_large(size),
    };
    match result {
        Ok(ptr) => {
            if zero {
                unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, size) };
            }
            ptr as *mut u8
        }
        Err(e) => {
            error!("alloc({}) failed: {}", size, e);
            std::ptr::null_mut()
        }
    }
}

/// Like [`alloc`], but records `used_capacity = size` and (if
/// `finalizer` is set) a destructor to be run by [`destroy`], choosing
/// a size class large enough to carry both (spec §4.5/§11).
pub fn alloc_appendable(size: usize, contains_pointers: bool, zero: bool, finalizer: Option<Finalizer>) -> *mut u8 {
    let arena = arena_for_alloc(contains_pointers);
    match metadata::alloc_appendable(arena, size, zero, finalizer) {
        Ok(ptr) => ptr as *mut u8,
        Err(e) => {
            error!("alloc_appendable({}) failed: {}", size, e);
            std::ptr::null_mut()
        }
    }
}

/// Frees `ptr`, which must be the exact base address of a live
/// allocation. Freeing a null pointer is a no-op; freeing any other
/// invalid pointer is undefined behavior (spec §7).
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    match arena_for_ptr(ptr as usize) {
        Some((arena, pd)) => {
            arena.free(ptr as usize, pd);
        }
        None => error!("free: {:p} is not a live allocation", ptr),
    }
}

/// Runs the allocation's finalizer (if any), then frees it. `ptr` must
/// be a live allocation's exact base address (spec §4.5).
pub fn destroy(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    match arena_for_ptr(ptr as usize) {
        Some((arena, _)) => {
            if let Err(e) = metadata::destroy(arena, ptr as usize) {
                error!("destroy({:p}) failed: {}", ptr, e);
            }
        }
        None => error!("destroy: {:p} is not a live allocation", ptr),
    }
}

/// Resizes a live allocation, preserving its contents up to
/// `min(old_size, new_size)`. `ptr == null` behaves like `alloc`;
/// `new_size == 0` behaves like `free` and returns null. May return
/// the same pointer (grown or shrunk in place) or a fresh one.
pub fn realloc(ptr: *mut u8, new_size: usize, contains_pointers: bool) -> *mut u8 {
    if ptr.is_null() {
        return alloc(new_size, contains_pointers, false);
    }
    if new_size == 0 {
        free(ptr);
        return std::ptr::null_mut();
    }
    if new_size > MAX_ALLOCATION_SIZE {
        warn!("realloc: requested size {} exceeds MaxAllocationSize", new_size);
        return std::ptr::null_mut();
    }

    let (arena, pd) = match arena_for_ptr(ptr as usize) {
        Some(v) => v,
        None => {
            error!("realloc: {:p} is not a live allocation", ptr);
            return std::ptr::null_mut();
        }
    };

    let old_usable = if pd.is_slab() {
        let sc = pd.size_class().expect("slab page descriptor carries a size class");
        let item_size = arena.bin(sc).item_size();
        if new_size <= item_size {
            return ptr; // still fits in the same slot, nothing to do
        }
        item_size
    } else {
        let extent_idx = pd.extent_index().expect("large page descriptor carries an extent index");
        let size = arena.with_large_extent(extent_idx, |e| e.size).expect("emap points at a live extent");
        let new_pages = pages_for(new_size);
        if arena.resize_large(extent_idx, new_pages) {
            return ptr; // shrunk or grown in place
        }
        size
    };

    let new_ptr = alloc(new_size, contains_pointers, false);
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }
    let copy_len = old_usable.min(new_size);
    unsafe { std::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len) };
    free(ptr);
    new_ptr
}

/// `getCapacity(ptr[slice_start..slice_end])` (spec §4.5): 0 unless
/// `slice_end` names the allocation's current used-capacity watermark.
pub fn get_capacity(ptr: *mut u8, slice_start: usize, slice_end: usize) -> usize {
    if ptr.is_null() {
        return 0;
    }
    match arena_for_ptr(ptr as usize) {
        Some((arena, _)) => metadata::get_capacity(arena, ptr as usize, slice_start, slice_end),
        None => 0,
    }
}

/// `extend(ptr[slice_start..slice_end], delta)` (spec §4.5): grows the
/// used-capacity watermark by `delta` if the slice names the current
/// watermark and there is room (possibly via an in-place large grow).
pub fn extend(ptr: *mut u8, slice_start: usize, slice_end: usize, delta: usize) -> bool {
    if ptr.is_null() {
        return false;
    }
    match arena_for_ptr(ptr as usize) {
        Some((arena, _)) => metadata::extend(arena, ptr as usize, slice_start, slice_end, delta),
        None => false,
    }
}

/// The entire lookup surface a tracing garbage collector needs (spec
/// §9/§10.7): every mapped page, paired with its packed descriptor.
/// No scan/mark logic lives here — the collector owns that.
pub fn for_each_mapped_page(f: impl FnMut(usize, PageDescriptor)) {
    EMAP.for_each_mapped_extent(f);
}

/// Whether `pd.extent_index()` (from a descriptor obtained via
/// [`for_each_mapped_page`]) still names a live extent in its arena.
/// The second half of the GC-facing surface.
pub fn is_live_extent(pd: PageDescriptor) -> bool {
    match pd.extent_index() {
        Some(idx) => arena_by_index(pd.arena_index()).is_live_extent(idx),
        None => false,
    }
}

/// A `GlobalAlloc` wrapper, for use as `#[global_allocator]`. Treats
/// every allocation as possibly containing pointers (the conservative
/// choice for an opaque `Layout`-based caller) and never zeroes beyond
/// what `GlobalAlloc::alloc_zeroed` already requires.
pub struct HpGlobalAlloc;

unsafe impl GlobalAlloc for HpGlobalAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        alloc(layout.size(), true, false)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        alloc(layout.size(), true, true)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        realloc(ptr, new_size, true)
    }
}
