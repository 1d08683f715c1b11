//! `tricache-alloc`: a three-tier thread-caching memory allocator.
//!
//! Allocation flows top-down through a per-thread object cache (lock-free
//! fast path), a process-wide page heap (segregated free list, single
//! mutex), and a back-end arena (mmap-reserved, lazily `mprotect`-committed).
//! A lock-free radix pagemap lets any thread `free` a pointer cached by any
//! other thread.

pub mod arena;
pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod pageheap;
pub mod pagemap;
pub mod size_class;
pub mod stats;
pub mod superblock;

use std::alloc::{GlobalAlloc, Layout};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::{trace, warn};

use pageheap::PageHeap;
use pagemap::PageMap;

static PAGE_MAP: PageMap = PageMap::new();
static PAGE_HEAP: OnceLock<PageHeap> = OnceLock::new();
static NEXT_TID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static TID: usize = NEXT_TID.fetch_add(1, Ordering::Relaxed);
}

fn page_heap() -> &'static PageHeap {
    PAGE_HEAP.get_or_init(PageHeap::new)
}

fn current_tid() -> usize {
    TID.with(|&t| t)
}

/// Returns a pointer of at least `size` bytes aligned to at least 16 bytes,
/// or null on failure. `size == 0` returns null.
pub fn alloc(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }

    let rounded = size_class::round_request_size(size);
    if rounded > size_class::SMALL_THRESHOLD {
        return match page_heap().request_bytes(size) {
            Some(p) => {
                stats::STATS.large.increase(size as i64);
                p
            }
            None => {
                warn!("alloc: page heap exhausted serving {size} bytes");
                ptr::null_mut()
            }
        };
    }

    let class_idx = match size_class::class_index(rounded) {
        Some(idx) => idx,
        None => return ptr::null_mut(),
    };

    if current_tid() >= config::get().hard_thread_limit {
        warn!("alloc: thread index exceeds configured hard thread limit");
        return ptr::null_mut();
    }

    let p = cache::with_cache(|c| c.alloc(class_idx, page_heap(), &PAGE_MAP));
    if p.is_null() {
        warn!("alloc: front-end cache exhausted serving {size} bytes");
        return ptr::null_mut();
    }
    stats::STATS.small.increase(rounded as i64);
    trace!("alloc: served {size} bytes (class {class_idx}) at {p:p}");
    p
}

/// Frees a pointer previously returned by [`alloc`], [`calloc`], or
/// [`realloc`]. `free(null)` is a no-op.
pub fn free(p: *mut u8) {
    if p.is_null() {
        return;
    }

    match PAGE_MAP.lookup(p as usize) {
        Some(desc_ptr) => {
            let desc = unsafe { &*desc_ptr };
            match desc.index_of(p) {
                Some(idx) => {
                    desc.push(idx);
                    stats::STATS.small.decrease(desc.size_class() as i64);
                }
                None => {
                    invariant!(false, "free: pointer maps to a descriptor but is out of range");
                }
            }
        }
        None => {
            let size = page_heap().allocated_size(p);
            page_heap().return_block(p);
            stats::STATS.large.decrease(size as i64);
        }
    }
}

/// Allocates `nmemb * size` zeroed bytes, detecting multiplication overflow.
pub fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let total = match nmemb.checked_mul(size) {
        Some(t) => t,
        None => {
            warn!("calloc: {nmemb} * {size} overflows");
            return ptr::null_mut();
        }
    };

    let p = alloc(total);
    if !p.is_null() {
        unsafe { ptr::write_bytes(p, 0, total) };
    }
    p
}

/// Reallocates `p` to `size` bytes, preserving the lesser of the old and
/// new sizes. `realloc(null, n)` behaves as `alloc(n)`; `realloc(p, 0)`
/// behaves as `free(p)` and returns null.
///
/// The old payload size is recovered from the pagemap (the owning
/// superblock's size class) for cached pointers, or from the page heap's
/// boundary tag for large pointers — the original source left this
/// recovery unimplemented; see DESIGN.md.
pub fn realloc(p: *mut u8, size: usize) -> *mut u8 {
    if p.is_null() {
        return alloc(size);
    }
    if size == 0 {
        free(p);
        return ptr::null_mut();
    }

    let old_size = match PAGE_MAP.lookup(p as usize) {
        Some(desc_ptr) => unsafe { &*desc_ptr }.size_class(),
        None => page_heap().allocated_size(p),
    };

    let new_ptr = alloc(size);
    if new_ptr.is_null() {
        return ptr::null_mut();
    }

    let copy_len = old_size.min(size);
    unsafe { ptr::copy_nonoverlapping(p, new_ptr, copy_len) };
    free(p);
    new_ptr
}

/// `GlobalAlloc` adapter over the engine above, for use as
/// `#[global_allocator]`.
pub struct TriCache;

unsafe impl GlobalAlloc for TriCache {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        alloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = alloc(layout.size());
        if !p.is_null() {
            ptr::write_bytes(p, 0, layout.size());
        }
        p
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        realloc(ptr, new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_zero_returns_null() {
        assert!(alloc(0).is_null());
    }

    #[test]
    fn free_null_is_noop() {
        free(ptr::null_mut());
    }

    #[test]
    fn alloc_and_free_small_round_trips() {
        let p = alloc(32);
        assert!(!p.is_null());
        free(p);
    }

    #[test]
    fn calloc_zeroes_memory() {
        let p = calloc(8, 8);
        assert!(!p.is_null());
        unsafe {
            for i in 0..64 {
                assert_eq!(*p.add(i), 0);
            }
        }
        free(p);
    }

    #[test]
    fn calloc_overflow_returns_null() {
        assert!(calloc(usize::MAX / 2, 4).is_null());
    }

    #[test]
    fn realloc_null_behaves_as_alloc() {
        let p = realloc(ptr::null_mut(), 64);
        assert!(!p.is_null());
        free(p);
    }

    #[test]
    fn realloc_to_zero_frees_and_returns_null() {
        let p = alloc(64);
        assert!(realloc(p, 0).is_null());
    }

    #[test]
    fn realloc_preserves_prefix_across_size_class_change() {
        let p = alloc(64);
        unsafe {
            for i in 0..64 {
                *p.add(i) = i as u8;
            }
        }
        let q = realloc(p, 10_000);
        assert!(!q.is_null());
        assert_ne!(p, q);
        unsafe {
            for i in 0..64 {
                assert_eq!(*q.add(i), i as u8);
            }
        }
        free(q);
    }
}
