//! Lock-free radix pagemap: maps a page address to the superblock
//! descriptor that owns it, so any thread can `free` a pointer it did not
//! allocate.
//!
//! The trie has [`PM_LEVELS`] levels of [`PM_BLOCK_INDICES`] children each,
//! keyed by successive 12-bit groups of the address with the low
//! page-offset bits discarded. Interior and leaf nodes are obtained by
//! direct anonymous `mmap`, never through the allocator this pagemap itself
//! supports.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::superblock::Descriptor;

pub const PM_LEVELS: usize = 4;
pub const PM_INDEX_WIDTH: u32 = 12;
pub const PM_BLOCK_INDICES: usize = 1 << PM_INDEX_WIDTH;
const PAGE_SHIFT: u32 = 12;

/// One level of the trie. At interior levels each slot points to the next
/// [`Node`]; at the terminal level each slot points to a [`Descriptor`].
/// Both are pointer-sized, so one node type serves every level.
struct Node {
    slots: [AtomicPtr<()>; PM_BLOCK_INDICES],
}

impl Node {
    fn new_mapped() -> *mut Node {
        let size = std::mem::size_of::<Node>();
        unsafe {
            let ptr = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return ptr::null_mut();
            }
            // Freshly mmap'd anonymous pages are zero-filled, which is
            // exactly the all-null AtomicPtr state `Node` needs; no further
            // initialization is required.
            ptr as *mut Node
        }
    }

    unsafe fn unmap(ptr: *mut Node) {
        libc::munmap(ptr as *mut libc::c_void, std::mem::size_of::<Node>());
    }
}

fn decompose(addr: usize) -> [usize; PM_LEVELS] {
    let shifted = addr >> PAGE_SHIFT;
    let mut indices = [0usize; PM_LEVELS];
    for (i, slot) in indices.iter_mut().enumerate() {
        let shift = PM_INDEX_WIDTH as usize * (PM_LEVELS - 1 - i);
        *slot = (shifted >> shift) & (PM_BLOCK_INDICES - 1);
    }
    indices
}

pub struct PageMap {
    root: AtomicPtr<Node>,
}

impl PageMap {
    pub const fn new() -> Self {
        PageMap {
            root: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Returns the descriptor owning the page containing `addr`, or `None`
    /// if no mapping has been installed for it (the common case for large
    /// allocations and foreign pointers).
    pub fn lookup(&self, addr: usize) -> Option<*mut Descriptor> {
        let indices = decompose(addr);
        let mut current = self.root.load(Ordering::Acquire);
        for (level, &idx) in indices.iter().enumerate() {
            if current.is_null() {
                return None;
            }
            let slot = unsafe { &(*current).slots[idx] };
            let next = slot.load(Ordering::Acquire);
            if level == PM_LEVELS - 1 {
                return if next.is_null() {
                    None
                } else {
                    Some(next as *mut Descriptor)
                };
            }
            current = next as *mut Node;
        }
        None
    }

    /// Installs `owner` as the descriptor for the page containing `addr`,
    /// lazily creating any missing interior nodes. Concurrent installers
    /// racing to create the same interior node resolve via CAS; the loser
    /// unmaps its redundant node.
    pub fn install(&self, addr: usize, owner: *mut Descriptor) {
        let indices = decompose(addr);
        let mut current_slot: *const AtomicPtr<Node> = &self.root as *const AtomicPtr<Node>;

        for (level, &idx) in indices.iter().enumerate() {
            let node = self.test_and_set(unsafe { &*current_slot });
            let slot = unsafe { &(*node).slots[idx] };
            if level == PM_LEVELS - 1 {
                slot.store(owner as *mut (), Ordering::Release);
                return;
            }
            current_slot = slot as *const AtomicPtr<()> as *const AtomicPtr<Node>;
        }
    }

    /// Ensures `slot` points at an installed [`Node`], installing one if
    /// absent. Safe to call concurrently from multiple threads on the same
    /// slot.
    fn test_and_set(&self, slot: &AtomicPtr<Node>) -> *mut Node {
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }

        let candidate = Node::new_mapped();
        match slot.compare_exchange(
            ptr::null_mut(),
            candidate,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => candidate,
            Err(winner) => {
                unsafe { Node::unmap(candidate) };
                winner
            }
        }
    }

    /// Removes the mapping at `addr`, if any. Used when a superblock is
    /// returned to the middle-end.
    pub fn unregister(&self, addr: usize) {
        let indices = decompose(addr);
        let mut current = self.root.load(Ordering::Acquire);
        for (level, &idx) in indices.iter().enumerate() {
            if current.is_null() {
                return;
            }
            let slot = unsafe { &(*current).slots[idx] };
            if level == PM_LEVELS - 1 {
                slot.store(ptr::null_mut(), Ordering::Release);
                return;
            }
            current = slot.load(Ordering::Acquire) as *mut Node;
        }
    }
}

unsafe impl Sync for PageMap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_on_empty_pagemap_is_none() {
        let pm = PageMap::new();
        assert!(pm.lookup(0x1000).is_none());
    }

    #[test]
    fn install_then_lookup_round_trips() {
        let pm = PageMap::new();
        let fake_descriptor = 0x1234usize as *mut Descriptor;
        pm.install(0x10_0000, fake_descriptor);
        assert_eq!(pm.lookup(0x10_0000), Some(fake_descriptor));
    }

    #[test]
    fn unregister_clears_mapping() {
        let pm = PageMap::new();
        let fake_descriptor = 0x5678usize as *mut Descriptor;
        pm.install(0x20_0000, fake_descriptor);
        pm.unregister(0x20_0000);
        assert!(pm.lookup(0x20_0000).is_none());
    }

    #[test]
    fn distinct_addresses_get_distinct_entries() {
        let pm = PageMap::new();
        let a = 0x11usize as *mut Descriptor;
        let b = 0x22usize as *mut Descriptor;
        pm.install(0x30_0000, a);
        pm.install(0x31_0000, b);
        assert_eq!(pm.lookup(0x30_0000), Some(a));
        assert_eq!(pm.lookup(0x31_0000), Some(b));
    }

    #[test]
    fn concurrent_install_races_resolve_consistently() {
        use std::sync::Arc;
        use std::thread;

        let pm = Arc::new(PageMap::new());
        let target = 0x40_0000usize;
        let mut handles = Vec::new();
        for i in 0..8 {
            let pm = Arc::clone(&pm);
            handles.push(thread::spawn(move || {
                let desc = (0x1000 + i) as *mut Descriptor;
                pm.install(target, desc);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(pm.lookup(target).is_some());
    }
}
