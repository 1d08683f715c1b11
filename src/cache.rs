//! Per-thread front-end: the thread's metadata region, its size-class
//! headers and active superblock rings, and the fast-path alloc/free logic
//! that only ever touches thread-local state on the common path.

use std::cell::Cell;
use std::mem::MaybeUninit;
use std::ptr;

use log::{debug, trace};

use crate::pageheap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::superblock::{Descriptor, NO_LINK};

struct ClassHeader {
    size_class: usize,
    slots: *mut MaybeUninit<Descriptor>,
    inactive_next: *mut u16,
    capacity: u16,
    sb_active: Cell<u16>,
    active_sb_count: Cell<u16>,
    sb_inactive_head: Cell<u16>,
}

impl ClassHeader {
    unsafe fn descriptor(&self, idx: u16) -> &Descriptor {
        (*self.slots.add(idx as usize)).assume_init_ref()
    }

    fn active(&self) -> Option<&Descriptor> {
        if self.active_sb_count.get() == 0 {
            None
        } else {
            Some(unsafe { self.descriptor(self.sb_active.get()) })
        }
    }

    fn advance_active(&self) {
        if let Some(cur) = self.active() {
            self.sb_active.set(cur.next_index());
        }
    }

    fn claim_inactive(&self) -> Option<u16> {
        let head = self.sb_inactive_head.get();
        if head == NO_LINK || head >= self.capacity {
            return None;
        }
        let next = unsafe { *self.inactive_next.add(head as usize) };
        self.sb_inactive_head.set(next);
        Some(head)
    }

    /// Carves a new superblock out of `pages` (`obj_count` slots of
    /// `size_class` bytes each) and splices it into the active ring
    /// immediately after the current active superblock.
    fn add_new_superblock(&self, pages: *mut u8, obj_count: u16) -> Option<u16> {
        let idx = self.claim_inactive()?;
        let desc = Descriptor::new(pages, self.size_class, obj_count);
        unsafe { (*self.slots.add(idx as usize)).write(desc) };
        let new_desc = unsafe { self.descriptor(idx) };

        if self.active_sb_count.get() == 0 {
            self.sb_active.set(idx);
            new_desc.set_prev_index(idx);
            new_desc.set_next_index(idx);
        } else {
            let cur_idx = self.sb_active.get();
            let cur = unsafe { self.descriptor(cur_idx) };
            let next_idx = cur.next_index();
            let next = unsafe { self.descriptor(next_idx) };

            new_desc.set_prev_index(cur_idx);
            new_desc.set_next_index(next_idx);
            next.set_prev_index(idx);
            cur.set_next_index(idx);
        }

        self.active_sb_count.set(self.active_sb_count.get() + 1);
        Some(idx)
    }
}

struct ThreadMetadata {
    region: *mut u8,
    region_len: usize,
    classes: [ClassHeader; NUM_SIZE_CLASSES],
}

impl ThreadMetadata {
    /// Builds a thread's metadata region directly from a raw anonymous
    /// mapping. Deliberately avoids `Box`/`Vec`: this runs on a thread's
    /// first allocator entry, before there is any front-end cache to serve
    /// it, so it must not itself go through the global allocator.
    ///
    /// Failure to map the region is fatal: there is no degraded mode for a
    /// thread with no metadata, so this aborts via `invariant!` rather than
    /// returning an error a caller could paper over with a null.
    fn new() -> ThreadMetadata {
        let max_sb_per_class = crate::config::get().max_sb_per_class;
        let per_class_descriptors = std::mem::size_of::<MaybeUninit<Descriptor>>() * max_sb_per_class;
        let per_class_chain = std::mem::size_of::<u16>() * max_sb_per_class;
        let per_class = per_class_descriptors + per_class_chain;
        let total = per_class * NUM_SIZE_CLASSES;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let region_len = crate::arena::round_up(total, page_size);

        let region = unsafe {
            libc::mmap(
                ptr::null_mut(),
                region_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        crate::invariant!(
            region != libc::MAP_FAILED,
            "failed to map per-thread metadata region"
        );
        let region = region as *mut u8;

        let mut offset = 0usize;
        let classes: [ClassHeader; NUM_SIZE_CLASSES] = std::array::from_fn(|i| {
            let slots = unsafe { region.add(offset) } as *mut MaybeUninit<Descriptor>;
            offset += per_class_descriptors;
            let inactive_next = unsafe { region.add(offset) } as *mut u16;
            offset += per_class_chain;

            for j in 0..max_sb_per_class {
                let next = if j + 1 < max_sb_per_class {
                    (j + 1) as u16
                } else {
                    NO_LINK
                };
                unsafe { *inactive_next.add(j) = next };
            }

            ClassHeader {
                size_class: size_class::class_size(i),
                slots,
                inactive_next,
                capacity: max_sb_per_class as u16,
                sb_active: Cell::new(0),
                active_sb_count: Cell::new(0),
                sb_inactive_head: Cell::new(0),
            }
        });

        ThreadMetadata {
            region,
            region_len,
            classes,
        }
    }
}

impl Drop for ThreadMetadata {
    fn drop(&mut self) {
        // Per the design, thread metadata regions are never released back
        // to the OS during normal operation; this only runs if a
        // ThreadCache is dropped without the process exiting first (e.g.
        // in unit tests).
        unsafe {
            libc::munmap(self.region as *mut libc::c_void, self.region_len);
        }
    }
}

pub struct ThreadCache {
    metadata: ThreadMetadata,
}

impl ThreadCache {
    fn new() -> ThreadCache {
        ThreadCache {
            metadata: ThreadMetadata::new(),
        }
    }

    /// Refills `class_idx` with one new superblock requested from the page
    /// heap, registering every page of its payload with the pagemap.
    fn refill(&self, class_idx: usize, pageheap: &PageHeap, pagemap: &PageMap) -> bool {
        let header = &self.metadata.classes[class_idx];
        let objs_per_sb =
            size_class::objects_per_superblock(class_idx, crate::config::get().objects_per_sb);
        let request_bytes = header.size_class * objs_per_sb as usize;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let request_bytes = crate::arena::round_up(request_bytes, page_size);

        let pages = match pageheap.request_bytes(request_bytes) {
            Some(p) => p,
            None => {
                debug!("cache: page heap refill of {request_bytes} bytes failed");
                return false;
            }
        };

        let idx = match header.add_new_superblock(pages, objs_per_sb) {
            Some(i) => i,
            None => {
                debug!("cache: class {class_idx} saturated, no inactive descriptor slots");
                return false;
            }
        };
        let desc = unsafe { header.descriptor(idx) };

        let mut page_addr = pages as usize;
        let end = page_addr + request_bytes;
        while page_addr < end {
            pagemap.install(page_addr, desc as *const Descriptor as *mut Descriptor);
            page_addr += page_size;
        }

        trace!("cache: refilled class {class_idx} with {objs_per_sb} objects");
        true
    }

    /// Serves a small allocation of exactly `class_idx`'s size, refilling at
    /// most once from the page heap on underflow.
    pub fn alloc(&self, class_idx: usize, pageheap: &PageHeap, pagemap: &PageMap) -> *mut u8 {
        let header = &self.metadata.classes[class_idx];

        for _ in 0..2 {
            if header.active_sb_count.get() > 0 {
                let start = header.sb_active.get();
                let mut probed = 0u32;
                loop {
                    if let Some(desc) = header.active() {
                        if let Some(ptr) = desc.try_pop() {
                            return ptr;
                        }
                    }
                    header.advance_active();
                    probed += 1;
                    if header.sb_active.get() == start || probed > header.active_sb_count.get() as u32
                    {
                        break;
                    }
                }
            }

            if !self.refill(class_idx, pageheap, pagemap) {
                return ptr::null_mut();
            }
        }

        ptr::null_mut()
    }
}

thread_local! {
    static CACHE: std::cell::RefCell<Option<ThreadCache>> = const { std::cell::RefCell::new(None) };
}

/// Runs `f` with this thread's cache, lazily initializing it on first use.
/// The one-time metadata mapping is infallible from the caller's
/// perspective: a failure there aborts the process (see `ThreadMetadata::new`).
pub fn with_cache<R>(f: impl FnOnce(&ThreadCache) -> R) -> R {
    CACHE.with(|cell| {
        let mut guard = cell.borrow_mut();
        if guard.is_none() {
            *guard = Some(ThreadCache::new());
        }
        f(guard.as_ref().unwrap())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pageheap::PageHeap;
    use crate::pagemap::PageMap;

    #[test]
    fn fresh_cache_refills_and_serves() {
        let pagemap = PageMap::new();
        let pageheap = PageHeap::new();
        let cache = ThreadCache::new();

        let p = cache.alloc(0, &pageheap, &pagemap);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);
    }

    #[test]
    fn repeated_small_allocs_stay_disjoint() {
        let pagemap = PageMap::new();
        let pageheap = PageHeap::new();
        let cache = ThreadCache::new();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..16 {
            let p = cache.alloc(0, &pageheap, &pagemap);
            assert!(!p.is_null());
            assert!(seen.insert(p as usize));
        }
    }
}
