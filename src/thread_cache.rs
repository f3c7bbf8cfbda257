//! Thread-cache front-end (spec §4.6/§10.1).
//!
//! Not core, but the core requires a caller somewhere to pick an
//! arena for fresh allocations. Grounded on the teacher's `Allocator`
//! trait (a per-call entry point with no state of its own beyond what
//! it's handed) and on `rstcmalloc`'s `thread_local! { static
//! THREAD_CACHE: ... }` / `with_thread_cache` shape
//! (`examples/other_examples`), generalized from one global cache to
//! a `(cpu_id, contains_pointers)` arena lookup.
//!
//! Frees and reallocs never consult this module — they resolve their
//! arena directly from the emap, which is always authoritative.

use crate::arena::Arena;
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

thread_local! {
    static CACHED_CPU_ID: Cell<Option<usize>> = Cell::new(None);
}

/// A fallback, monotonically-assigned id for platforms (or test
/// environments) without `sched_getcpu`. Threads are unlikely to
/// number in the thousands, so plain wraparound is not a concern in
/// practice.
static NEXT_FALLBACK_CPU_ID: AtomicUsize = AtomicUsize::new(0);

#[cfg(unix)]
fn read_current_cpu_id() -> Option<usize> {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu >= 0 {
        Some(cpu as usize)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn read_current_cpu_id() -> Option<usize> {
    None
}

/// This thread's cached CPU id, read once per thread and never
/// refreshed — a thread that migrates cores keeps using its first
/// arena pick. Correctness never depends on this being accurate: every
/// arena can hold any allocation, and frees always resolve through the
/// emap (spec §9's arena-selection design note).
fn cpu_id() -> usize {
    CACHED_CPU_ID.with(|cell| {
        if let Some(id) = cell.get() {
            return id;
        }
        let id = read_current_cpu_id().unwrap_or_else(|| NEXT_FALLBACK_CPU_ID.fetch_add(1, Ordering::Relaxed));
        cell.set(Some(id));
        id
    })
}

/// Looks up (and, on first call per thread, picks) the arena this
/// thread should use for a fresh allocation, then hands it to `f`.
pub fn with_arena<R>(contains_pointers: bool, f: impl FnOnce(&'static Arena) -> R) -> R {
    let arena = crate::arena_by_index(arena_slot(cpu_id(), contains_pointers));
    f(arena)
}

fn arena_slot(cpu_id: usize, contains_pointers: bool) -> u8 {
    let num_cpus = crate::num_cpus();
    let cpu_id = cpu_id % num_cpus;
    ((cpu_id << 1) | contains_pointers as usize) as u8
}
