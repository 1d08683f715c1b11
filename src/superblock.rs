//! Superblock descriptors: the per-superblock metadata record, its embedded
//! free-stack, and the size class's active ring of descriptors.
//!
//! Concurrency model: only the owning thread ever pops from a superblock's
//! free stack; any thread may push (on `free`) via a single-word CAS on
//! `freelist_head`. This owner-only-pop rule is what makes the embedded
//! stack ABA-safe without a tagged pointer or generation counter: the link
//! written by a push (`obj_list[idx] = old_head`) happens-before the CAS
//! that publishes `idx` as the new head, so a racing pop that wins the CAS
//! always sees a consistent link.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, AtomicU16, AtomicU8, Ordering};

/// Slots per superblock. Kept strictly below 256 so slot indices fit in a
/// single byte, matching the descriptor's packed atomic fields.
pub const OBJECTS_PER_SB: usize = 255;

/// Sentinel ring-link value meaning "no neighbor" / "not on the ring".
pub const NO_LINK: u16 = u16::MAX;

pub struct Descriptor {
    payload: AtomicPtr<u8>,
    size_class: usize,
    /// Total slot count this superblock was carved with; immutable after
    /// `new`. Lets `push` detect a double free by catching `num_available`
    /// about to exceed it.
    capacity: u8,
    num_available: AtomicU8,
    freelist_head: AtomicU8,
    obj_list: UnsafeCell<[u8; OBJECTS_PER_SB]>,
    sb_prev_index: AtomicU16,
    sb_next_index: AtomicU16,
}

// SAFETY: `obj_list` is only written by a `push` at the index being freed
// (disjoint per call) and only read by `pop`, which is restricted to the
// owning thread by convention enforced in `cache.rs`. All cross-thread
// communication happens through the atomic `freelist_head` / `num_available`
// fields, which provide the necessary acquire/release synchronization.
unsafe impl Sync for Descriptor {}

impl Descriptor {
    /// Builds a descriptor for a freshly-carved superblock whose slots are
    /// all free, linked as the identity chain `0 -> 1 -> 2 -> ... -> count-1`.
    pub fn new(payload: *mut u8, size_class: usize, count: u16) -> Self {
        let mut obj_list = [0u8; OBJECTS_PER_SB];
        for (i, slot) in obj_list.iter_mut().enumerate().take(count as usize) {
            *slot = if i + 1 < count as usize {
                (i + 1) as u8
            } else {
                0
            };
        }

        Descriptor {
            payload: AtomicPtr::new(payload),
            size_class,
            capacity: count as u8,
            num_available: AtomicU8::new(count as u8),
            freelist_head: AtomicU8::new(0),
            obj_list: UnsafeCell::new(obj_list),
            sb_prev_index: AtomicU16::new(NO_LINK),
            sb_next_index: AtomicU16::new(NO_LINK),
        }
    }

    pub fn payload(&self) -> *mut u8 {
        self.payload.load(Ordering::Relaxed)
    }

    pub fn size_class(&self) -> usize {
        self.size_class
    }

    pub fn num_available(&self) -> u8 {
        self.num_available.load(Ordering::Acquire)
    }

    pub fn prev_index(&self) -> u16 {
        self.sb_prev_index.load(Ordering::Relaxed)
    }

    pub fn next_index(&self) -> u16 {
        self.sb_next_index.load(Ordering::Relaxed)
    }

    pub fn set_prev_index(&self, idx: u16) {
        self.sb_prev_index.store(idx, Ordering::Relaxed);
    }

    pub fn set_next_index(&self, idx: u16) {
        self.sb_next_index.store(idx, Ordering::Relaxed);
    }

    /// Returns the slot index of `ptr` within this superblock's payload, if
    /// it actually falls inside the payload range.
    pub fn index_of(&self, ptr: *mut u8) -> Option<u8> {
        let base = self.payload() as usize;
        let addr = ptr as usize;
        if addr < base {
            return None;
        }
        let offset = addr - base;
        if offset % self.size_class != 0 {
            return None;
        }
        let idx = offset / self.size_class;
        if idx >= OBJECTS_PER_SB {
            return None;
        }
        Some(idx as u8)
    }

    /// Owner-only: attempts to pop one slot off the free stack. Returns the
    /// payload pointer for the popped slot, or `None` if the superblock
    /// appeared empty at the moment of the decrement race.
    pub fn try_pop(&self) -> Option<*mut u8> {
        loop {
            let avail = self.num_available.load(Ordering::Acquire);
            if avail == 0 {
                return None;
            }
            if self
                .num_available
                .compare_exchange_weak(avail, avail - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            break;
        }

        let idx = loop {
            let head = self.freelist_head.load(Ordering::Acquire);
            let next = unsafe { (*self.obj_list.get())[head as usize] };
            if self
                .freelist_head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break head;
            }
        };

        Some(unsafe { self.payload().add(idx as usize * self.size_class) })
    }

    /// Pushes `idx` back onto the free stack and increments `num_available`.
    /// Safe to call from any thread.
    pub fn push(&self, idx: u8) {
        crate::invariant!((idx as usize) < OBJECTS_PER_SB, "push: slot index out of range");
        loop {
            let head = self.freelist_head.load(Ordering::Acquire);
            unsafe { (*self.obj_list.get())[idx as usize] = head };
            if self
                .freelist_head
                .compare_exchange_weak(head, idx, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        let prev = self.num_available.fetch_add(1, Ordering::AcqRel);
        crate::invariant!(prev < self.capacity, "push: num_available exceeded capacity (double free)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_descriptor_has_identity_free_chain() {
        let payload = 0x1000usize as *mut u8;
        let desc = Descriptor::new(payload, 32, 4);
        assert_eq!(desc.num_available(), 4);

        let mut popped = Vec::new();
        for _ in 0..4 {
            popped.push(desc.try_pop().unwrap());
        }
        assert!(desc.try_pop().is_none());
        assert_eq!(desc.num_available(), 0);

        let expected: Vec<_> = (0..4).map(|i| unsafe { payload.add(i * 32) }).collect();
        assert_eq!(popped, expected);
    }

    #[test]
    fn push_then_pop_round_trips() {
        let payload = 0x2000usize as *mut u8;
        let desc = Descriptor::new(payload, 16, 2);
        let a = desc.try_pop().unwrap();
        let b = desc.try_pop().unwrap();
        assert!(desc.try_pop().is_none());

        let idx_b = desc.index_of(b).unwrap();
        desc.push(idx_b);
        assert_eq!(desc.num_available(), 1);

        let popped_again = desc.try_pop().unwrap();
        assert_eq!(popped_again, b);

        let idx_a = desc.index_of(a).unwrap();
        desc.push(idx_a);
        assert_eq!(desc.num_available(), 1);
    }

    #[test]
    fn index_of_rejects_out_of_range_pointer() {
        let payload = 0x3000usize as *mut u8;
        let desc = Descriptor::new(payload, 16, 4);
        assert!(desc.index_of(0x0usize as *mut u8).is_none());
        assert!(desc.index_of(unsafe { payload.add(1) }).is_none());
    }

    #[test]
    fn concurrent_push_from_many_threads_preserves_count() {
        use std::sync::Arc;
        use std::thread;

        let payload = 0x4000usize as *mut usize as *mut u8;
        let desc = Arc::new(Descriptor::new(payload, 16, 8));

        let mut popped = Vec::new();
        for _ in 0..8 {
            popped.push(desc.try_pop().unwrap());
        }
        assert_eq!(desc.num_available(), 0);

        let mut handles = Vec::new();
        for ptr in popped {
            let desc = Arc::clone(&desc);
            let ptr = ptr as usize;
            handles.push(thread::spawn(move || {
                let idx = desc.index_of(ptr as *mut u8).unwrap();
                desc.push(idx);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(desc.num_available(), 8);
    }
}
