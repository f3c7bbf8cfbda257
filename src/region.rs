//! The region/OS-memory provider collaborator (spec §6, "out of scope").
//!
//! The core never talks to the OS directly; it asks a `RegionProvider`
//! for huge-page-aligned regions and hands regions back on release.
//! This mirrors spec §6's `acquire`/`release` contract exactly and
//! keeps the arena testable without real huge pages.

use crate::config::HUGE_PAGE_SIZE;
use crate::error::{HpError, HpResult};
use log::{debug, error};

/// Supplies huge-page-aligned regions on demand and accepts releases.
///
/// # Safety
/// Implementors must return memory that is aligned to `HUGE_PAGE_SIZE`
/// and exactly `huge_pages * HUGE_PAGE_SIZE` bytes long, valid for
/// reads and writes for as long as it has not been released.
pub unsafe trait RegionProvider: Send + Sync {
    /// Acquire `huge_pages` contiguous huge pages. Returns the base
    /// address on success.
    fn acquire(&self, huge_pages: usize) -> HpResult<usize>;

    /// Return a region previously returned by `acquire`.
    ///
    /// # Safety
    /// `base` must be a value previously returned by `acquire` on this
    /// provider, with the same `huge_pages` count, not already released.
    unsafe fn release(&self, base: usize, huge_pages: usize);
}

/// A `RegionProvider` backed by anonymous `mmap` (unix) or the system
/// allocator (elsewhere), for use in tests and as a default when no
/// embedder-specific provider (e.g. a kernel's physical-page allocator)
/// is wired in.
#[derive(Default)]
pub struct SystemRegionProvider;

#[cfg(unix)]
unsafe impl RegionProvider for SystemRegionProvider {
    fn acquire(&self, huge_pages: usize) -> HpResult<usize> {
        let len = huge_pages * HUGE_PAGE_SIZE;
        // Over-allocate so we can hand back a huge-page-aligned
        // sub-region; mmap only guarantees page alignment.
        let overshoot = len + HUGE_PAGE_SIZE;
        let raw = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                overshoot,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            error!("SystemRegionProvider: mmap({} bytes) failed", overshoot);
            return Err(HpError::OutOfMemory);
        }
        let raw_addr = raw as usize;
        let aligned = (raw_addr + HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1);
        let front_slack = aligned - raw_addr;
        let back_slack = overshoot - front_slack - len;
        unsafe {
            if front_slack > 0 {
                libc::munmap(raw, front_slack);
            }
            if back_slack > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, back_slack);
            }
        }
        debug!(
            "SystemRegionProvider: acquired {} huge page(s) at {:#x}",
            huge_pages, aligned
        );
        Ok(aligned)
    }

    unsafe fn release(&self, base: usize, huge_pages: usize) {
        let len = huge_pages * HUGE_PAGE_SIZE;
        unsafe {
            libc::munmap(base as *mut libc::c_void, len);
        }
        debug!(
            "SystemRegionProvider: released {} huge page(s) at {:#x}",
            huge_pages, base
        );
    }
}

#[cfg(not(unix))]
unsafe impl RegionProvider for SystemRegionProvider {
    fn acquire(&self, huge_pages: usize) -> HpResult<usize> {
        use std::alloc::{alloc, Layout};
        let len = huge_pages * HUGE_PAGE_SIZE;
        let layout = Layout::from_size_align(len, HUGE_PAGE_SIZE).map_err(|_| HpError::InvalidArgument)?;
        let raw = unsafe { alloc(layout) };
        if raw.is_null() {
            return Err(HpError::OutOfMemory);
        }
        Ok(raw as usize)
    }

    unsafe fn release(&self, base: usize, huge_pages: usize) {
        use std::alloc::{dealloc, Layout};
        let len = huge_pages * HUGE_PAGE_SIZE;
        let layout = Layout::from_size_align(len, HUGE_PAGE_SIZE).expect("layout was valid on acquire");
        unsafe {
            dealloc(base as *mut u8, layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_huge_page_aligned_region() {
        let provider = SystemRegionProvider::default();
        let base = provider.acquire(1).expect("acquire should succeed");
        assert_eq!(base % HUGE_PAGE_SIZE, 0);
        unsafe { provider.release(base, 1) };
    }

    #[test]
    fn acquire_multiple_huge_pages_contiguous() {
        let provider = SystemRegionProvider::default();
        let base = provider.acquire(3).expect("acquire should succeed");
        assert_eq!(base % HUGE_PAGE_SIZE, 0);
        // Touch the full span to make sure it is all mapped.
        unsafe {
            core::ptr::write_bytes(base as *mut u8, 0xAB, 3 * HUGE_PAGE_SIZE);
        }
        unsafe { provider.release(base, 3) };
    }
}
