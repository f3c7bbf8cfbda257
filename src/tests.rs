//! End-to-end tests against a freestanding `Arena`, covering spec §8's
//! universal invariants and its S1-S7 walkthrough scenarios.
//!
//! Built on the same local-harness pattern `arena.rs`/`metadata.rs` use
//! rather than the process-wide singleton in `lib.rs`: every test here
//! owns its own region/emap/class-table statics and its own `Arena`
//! index, so tests can run concurrently without one polluting another's
//! bins or huge pages.
//!
//! A note on concrete numbers: the size-class table actually in force
//! (`config::SMALL_CLASS_SIZES`) does not match whatever table any
//! outside walkthrough of this kind of allocator might assume pointers
//! land on (for instance, a request for 5 bytes here lands in the
//! 8-byte class, not a 16-byte one). Every assertion below is derived
//! from this table, not copied from a different one.

use crate::arena::Arena;
use crate::config::{build_small_class_table, NUM_SMALL_CLASSES, PAGES_IN_HUGE_PAGE, PAGE_SIZE};
use crate::emap::Emap;
use crate::metadata;
use crate::region::SystemRegionProvider;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

static REGION: Lazy<SystemRegionProvider> = Lazy::new(SystemRegionProvider::default);
static EMAP: Lazy<Emap> = Lazy::new(Emap::new);
static CLASSES: Lazy<[crate::config::SmallClassInfo; NUM_SMALL_CLASSES]> = Lazy::new(build_small_class_table);

fn test_arena(index: u8) -> Arena {
    Arena::new(index, &*REGION, &*EMAP, &*CLASSES)
}

// ----- Universal invariants (spec §8) -----

#[test]
fn freed_pointer_is_unmapped_and_reusable() {
    let arena = test_arena(20);
    let (ptr, _) = arena.alloc_small(0).unwrap();
    assert!(!arena.emap().lookup(ptr).is_empty());
    assert!(arena.free(ptr, arena.emap().lookup(ptr)));
    assert!(arena.emap().lookup(ptr).is_empty(), "a freed pointer must read back as unmapped");

    // The slot is free again, so a same-size request can reuse it.
    let (ptr2, _) = arena.alloc_small(0).unwrap();
    assert!(!arena.emap().lookup(ptr2).is_empty());
}

#[test]
fn no_allocation_is_handed_out_twice() {
    let arena = test_arena(21);
    let mut live = HashSet::new();
    for _ in 0..300 {
        let (ptr, _) = arena.alloc_small(2).unwrap();
        assert!(live.insert(ptr), "the same address was handed out twice while still live");
    }
}

#[test]
fn zero_law_holds_for_plain_allocations() {
    // An allocation made through `alloc_small`/`alloc_large` directly
    // (bypassing the appendable protocol) never reports a capacity,
    // no matter the slice asked about.
    let arena = test_arena(22);
    let (small_ptr, _) = arena.alloc_small(4).unwrap();
    assert_eq!(metadata::get_capacity(&arena, small_ptr, 0, 0), 0);
    assert_eq!(metadata::get_capacity(&arena, small_ptr, 0, 64), 0);

    let large_ptr = arena.alloc_large(9 * PAGE_SIZE).unwrap();
    assert_eq!(metadata::get_capacity(&arena, large_ptr, 0, 0), 0);
    assert_eq!(metadata::get_capacity(&arena, large_ptr, 0, 9 * PAGE_SIZE), 0);
}

#[test]
fn capacity_law_rejects_every_slice_but_the_watermark() {
    let arena = test_arena(23);
    let ptr = metadata::alloc_appendable(&arena, 40, false, None).unwrap();
    // requested_size 40 lands in the 48-byte class (next size at or
    // above 40 in SMALL_CLASS_SIZES), with a 1-byte length field.
    for bad_end in [0usize, 1, 39, 41, 128] {
        assert_eq!(metadata::get_capacity(&arena, ptr, 0, bad_end), 0, "slice end {} is not the watermark", bad_end);
    }
    assert_eq!(metadata::get_capacity(&arena, ptr, 0, 40), 48, "room runs to the end of the 48-byte slot");
}

#[test]
fn concurrent_allocations_never_overlap_while_live() {
    let arena = Arc::new(test_arena(24));
    let seen: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let arena = Arc::clone(&arena);
            let seen = Arc::clone(&seen);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let (ptr, _) = arena.alloc_small(1).unwrap();
                    assert!(seen.lock().unwrap().insert(ptr), "two threads were handed the same live address");
                    let pd = arena.emap().lookup(ptr);
                    assert!(arena.free(ptr, pd));
                    seen.lock().unwrap().remove(&ptr);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

// ----- Scenario walkthroughs (spec §8) -----

/// S1: a small allocation's address is available for reuse as soon as
/// it is freed, and nothing else is handed that same slot in between.
/// A second, still-live object is kept around so the slab itself isn't
/// emptied (and its pages released back to the OS) between the free
/// and the re-allocation, which would make the reused address an
/// accident of the platform's mmap behavior rather than a guarantee of
/// this allocator's own slot reuse.
#[test]
fn s1_small_round_trip() {
    let arena = test_arena(30);
    let sc = crate::config::small_class_index(50).unwrap() as u8;
    let (ptr, _) = arena.alloc_small(sc).unwrap();
    let (keepalive, _) = arena.alloc_small(sc).unwrap();
    let pd = arena.emap().lookup(ptr);
    assert!(pd.is_slab());
    assert!(arena.free(ptr, pd));
    let (ptr2, _) = arena.alloc_small(sc).unwrap();
    assert_eq!(ptr, ptr2, "the freed slot should be handed straight back out");
    assert!(arena.free(keepalive, arena.emap().lookup(keepalive)));
}

/// S2: the appendable capacity protocol on a small allocation, worked
/// through a different request size than `metadata::tests` covers.
#[test]
fn s2_small_appendable_capacity() {
    let arena = test_arena(31);
    let ptr = metadata::alloc_appendable(&arena, 100, false, None).unwrap();
    // 100 lands in the 128-byte class, 1-byte length field (< 256).
    // get_capacity reports room to the physical end of the slot, not
    // the length-byte-adjusted max a caller may grow to.
    assert_eq!(metadata::get_capacity(&arena, ptr, 0, 100), 128);
    assert_eq!(metadata::get_capacity(&arena, ptr, 0, 101), 0);
    assert_eq!(metadata::get_capacity(&arena, ptr, 100, 100), 28);
}

/// S3: shrinking a large allocation in place.
#[test]
fn s3_large_shrink_in_place() {
    let arena = test_arena(32);
    let ptr = arena.alloc_large(35 * PAGE_SIZE).unwrap();
    let idx = arena.emap().lookup(ptr).extent_index().unwrap();
    assert!(arena.resize_large(idx, 10));
    assert_eq!(arena.with_large_extent(idx, |e| e.size).unwrap(), 10 * PAGE_SIZE);
    assert!(arena.free(ptr, arena.emap().lookup(ptr)));
}

/// S3, through the public API: `realloc` must actually drive the
/// shrink path (not just return the same pointer while leaving the
/// trailing pages mapped).
#[test]
fn s3_realloc_shrinks_and_unmaps_trailing_pages() {
    let ptr = crate::alloc(35 * PAGE_SIZE, false, false);
    assert!(!ptr.is_null());
    let shrunk = crate::realloc(ptr, 10 * PAGE_SIZE, false);
    assert_eq!(shrunk, ptr, "shrinking a large allocation in place must keep its address");

    let trailing_start = ptr as usize + 10 * PAGE_SIZE;
    let trailing_end = ptr as usize + 35 * PAGE_SIZE;
    let mut still_mapped = false;
    crate::for_each_mapped_page(|addr, _pd| {
        if addr >= trailing_start && addr < trailing_end {
            still_mapped = true;
        }
    });
    assert!(!still_mapped, "realloc must clear the emap for pages it shrinks away");

    crate::free(shrunk);
}

/// S4: a large allocation cannot grow in place once a neighbor has
/// taken the pages right after it, but can once that neighbor frees.
#[test]
fn s4_large_grow_blocked_by_neighbor_then_succeeds() {
    let arena = test_arena(33);
    let ptr = arena.alloc_large(20 * PAGE_SIZE).unwrap();
    let idx = arena.emap().lookup(ptr).extent_index().unwrap();
    let neighbor = arena.alloc_large(PAGE_SIZE).unwrap();

    assert!(!arena.resize_large(idx, 21), "growth must be blocked by the live neighbor");

    assert!(arena.free(neighbor, arena.emap().lookup(neighbor)));
    assert!(arena.resize_large(idx, 21), "growth should succeed once the neighbor is gone");
    assert_eq!(arena.with_large_extent(idx, |e| e.size).unwrap(), 21 * PAGE_SIZE);
    assert!(arena.free(ptr, arena.emap().lookup(ptr)));
}

/// S5: a huge allocation (spanning more than one huge page) round-trips
/// through free and is available for reuse, same as any other size.
#[test]
fn s5_huge_alloc_round_trips() {
    let arena = test_arena(34);
    let pages = PAGES_IN_HUGE_PAGE + 1;
    let ptr = arena.alloc_large(pages * PAGE_SIZE).unwrap();
    let pd = arena.emap().lookup(ptr);
    assert!(!pd.is_slab());
    assert!(pd.extent_index().is_some());
    assert!(arena.free(ptr, pd));
    assert!(arena.emap().lookup(ptr).is_empty());
}

/// S6: `extend` on a large appendable allocation is blocked by a live
/// neighbor and succeeds once that neighbor is freed, mirroring S4 but
/// through the capacity-watermark API instead of a raw resize.
#[test]
fn s6_extend_into_neighbor_after_neighbor_freed() {
    let arena = test_arena(35);
    let capacity = 16 * PAGE_SIZE;
    let ptr = metadata::alloc_appendable(&arena, capacity, false, None).unwrap();
    let neighbor = arena.alloc_large(PAGE_SIZE).unwrap();

    assert!(!metadata::extend(&arena, ptr, 0, capacity, 1), "extend must be blocked by the live neighbor");

    assert!(arena.free(neighbor, arena.emap().lookup(neighbor)));
    assert!(metadata::extend(&arena, ptr, 0, capacity, 1));
    assert_eq!(metadata::get_capacity(&arena, ptr, 0, capacity + 1), capacity + PAGE_SIZE, "extend grew the backing extent by a whole page");
}

/// S7: a small appendable allocation's finalizer runs, with the
/// recorded used capacity, when `destroy` is called.
#[test]
fn s7_finalizer_runs_on_destroy() {
    static SEEN_CAPACITY: AtomicUsize = AtomicUsize::new(0);
    fn record(_ptr: *mut u8, used: usize) {
        SEEN_CAPACITY.store(used, Ordering::SeqCst);
    }

    let arena = test_arena(36);
    let ptr = metadata::alloc_appendable(&arena, 45, false, Some(record)).unwrap();
    metadata::destroy(&arena, ptr).unwrap();
    assert_eq!(SEEN_CAPACITY.load(Ordering::SeqCst), 45);
    assert!(arena.emap().lookup(ptr).is_empty(), "destroy must also free the allocation");
}
