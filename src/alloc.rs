//! Tracking Allocator
//!
//! This module wraps the system allocator with byte accounting so the
//! server can answer memory introspection queries (`MEMORY STATS`,
//! `MEMORY DOCTOR`) without asking the OS on every request.
//!
//! ## What We Track
//!
//! - **Used bytes**: the sum of all live allocations, as seen by Rust's
//!   global allocator interface.
//! - **Peak bytes**: the historical high-water mark of used bytes.
//! - **Startup baseline**: a snapshot taken once when the server boots,
//!   so reports can separate "cost of running" from "cost of data".
//!
//! The process RSS is read lazily from `/proc/self/statm`; the ratio
//! RSS / used is the fragmentation figure reported to operators.
//!
//! Allocation failure is not a recoverable condition in this server:
//! Rust's global allocator aborts the process on OOM, which matches the
//! "allocation never returns null to callers" contract the value layer
//! relies on.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Global allocator that counts live bytes and tracks the peak.
pub struct TrackingAlloc;

static USED: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);
static STARTUP: AtomicUsize = AtomicUsize::new(0);
static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

#[global_allocator]
static GLOBAL: TrackingAlloc = TrackingAlloc;

unsafe impl GlobalAlloc for TrackingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            let used = USED.fetch_add(layout.size(), Ordering::Relaxed) + layout.size();
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
            PEAK.fetch_max(used, Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        USED.fetch_sub(layout.size(), Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            if new_size >= layout.size() {
                let used =
                    USED.fetch_add(new_size - layout.size(), Ordering::Relaxed) + new_size
                        - layout.size();
                PEAK.fetch_max(used, Ordering::Relaxed);
            } else {
                USED.fetch_sub(layout.size() - new_size, Ordering::Relaxed);
            }
        }
        new_ptr
    }
}

/// Returns the number of live allocated bytes.
pub fn used_bytes() -> usize {
    USED.load(Ordering::Relaxed)
}

/// Returns the historical peak of live allocated bytes.
pub fn peak_bytes() -> usize {
    PEAK.load(Ordering::Relaxed)
}

/// Total number of allocations served since process start.
pub fn allocation_count() -> usize {
    ALLOCATIONS.load(Ordering::Relaxed)
}

/// Records the startup memory baseline. Called once from server init.
pub fn snapshot_startup() {
    STARTUP.store(used_bytes(), Ordering::Relaxed);
}

/// Returns the startup baseline recorded by [`snapshot_startup`].
pub fn startup_bytes() -> usize {
    STARTUP.load(Ordering::Relaxed)
}

/// Reports the size class a heap block of `requested` bytes occupies.
///
/// The system allocator does not expose a `malloc_usable_size` through the
/// stable `GlobalAlloc` interface, so we mirror the common small-object
/// size classes: blocks round up to 8 bytes below 128, to 16 below 512,
/// and to the next power of two above that.
pub fn alloc_size(requested: usize) -> usize {
    if requested == 0 {
        return 0;
    }
    if requested <= 128 {
        (requested + 7) & !7
    } else if requested <= 512 {
        (requested + 15) & !15
    } else {
        requested.next_power_of_two()
    }
}

/// Resident set size of this process in bytes, or `None` when the
/// platform does not expose it.
pub fn resident_set_size() -> Option<usize> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: usize = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * page_size())
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no side effects.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// Ratio of resident memory to allocator-used memory.
///
/// Values well above 1.0 mean the process holds pages the allocator is not
/// currently using (fragmentation or a past memory peak).
pub fn fragmentation_ratio() -> f64 {
    let used = used_bytes().max(1);
    match resident_set_size() {
        Some(rss) => rss as f64 / used as f64,
        None => 1.0,
    }
}

/// Human-readable dump of the tracking counters, for `MEMORY MALLOC-STATS`.
pub fn stats_report() -> String {
    format!(
        "allocator: tracking(system)\n\
         used_bytes: {}\n\
         peak_bytes: {}\n\
         startup_bytes: {}\n\
         allocations: {}\n\
         rss_bytes: {}\n\
         fragmentation: {:.2}\n",
        used_bytes(),
        peak_bytes(),
        startup_bytes(),
        allocation_count(),
        resident_set_size().unwrap_or(0),
        fragmentation_ratio(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_large_allocation() {
        // 8 MB dwarfs whatever concurrently running tests allocate, so
        // the deltas stay visible through their noise.
        const BIG: usize = 8 << 20;
        const TOLERANCE: usize = 1 << 20;
        let before = used_bytes();
        let v: Vec<u8> = Vec::with_capacity(BIG);
        let during = used_bytes();
        drop(v);
        let after = used_bytes();
        assert!(during + TOLERANCE >= before + BIG);
        assert!(after + BIG <= during + TOLERANCE);
    }

    #[test]
    fn test_peak_is_monotonic() {
        let p1 = peak_bytes();
        let _v: Vec<u8> = Vec::with_capacity(1 << 16);
        let p2 = peak_bytes();
        assert!(p2 >= p1);
    }

    #[test]
    fn test_alloc_size_classes() {
        assert_eq!(alloc_size(0), 0);
        assert_eq!(alloc_size(1), 8);
        assert_eq!(alloc_size(8), 8);
        assert_eq!(alloc_size(9), 16);
        assert_eq!(alloc_size(129), 144);
        assert_eq!(alloc_size(600), 1024);
    }

    #[test]
    fn test_fragmentation_ratio_is_positive() {
        assert!(fragmentation_ratio() > 0.0);
    }
}
