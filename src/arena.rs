//! Back-end: per-thread arena reserved up front with `mmap`, grown by
//! bump-pointer allocation with pages lazily committed via `mprotect`.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use errno::errno;
use log::{debug, warn};

use crate::error::AllocatorError;

/// Per-thread hint base so each arena's reservation lands in a disjoint,
/// predictable region of the address space.
const TRY_ALLOC_START: usize = 0x0000_1000_0000_0000;

pub fn round_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

pub fn round_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

pub struct Arena {
    heap_start: usize,
    max_addr: usize,
    bmp: AtomicUsize,
    bmp_chunk: AtomicUsize,
    page_size: usize,
}

impl Arena {
    /// Reserves `total_alloc_space` bytes at a hint address derived from
    /// `tid`, with no pages initially committed.
    pub fn init(tid: usize, total_alloc_space: usize) -> Result<Arena, AllocatorError> {
        let hint = (tid + 1) * TRY_ALLOC_START;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };

        let addr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                total_alloc_space,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let e = errno();
            warn!("arena: mmap reservation failed for thread {tid}: {e}");
            return Err(AllocatorError::ArenaReservationFailed(e));
        }

        let addr = addr as usize;
        if round_down(addr, page_size) != addr {
            warn!("arena: reservation at {addr:#x} is not page aligned");
            return Err(AllocatorError::ArenaReservationFailed(errno()));
        }

        debug!("arena: reserved {total_alloc_space} bytes for thread {tid} at {addr:#x}");

        Ok(Arena {
            heap_start: addr,
            max_addr: addr + total_alloc_space,
            bmp: AtomicUsize::new(addr),
            bmp_chunk: AtomicUsize::new(addr),
            page_size,
        })
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.heap_start && addr < self.max_addr
    }

    pub fn current_usage(&self) -> usize {
        self.bmp.load(Ordering::Relaxed) - self.heap_start
    }

    /// The absolute address the next `extend_bmp` call will hand out.
    pub fn current_ptr(&self) -> *mut u8 {
        self.bmp.load(Ordering::Relaxed) as *mut u8
    }

    /// Bumps the arena's pointer by `incr` bytes, committing any newly
    /// spanned pages via `mprotect`. Returns the previous bump pointer, or
    /// `None` on invalid input or exhaustion (the null-object-pointer
    /// sentinel of the original design, translated to `Option`).
    pub fn extend_bmp(&self, incr: isize) -> Option<*mut u8> {
        if incr < 0 {
            warn!("arena: extend_bmp called with negative increment {incr}");
            errno::set_errno(errno::Errno(libc::EINVAL));
            return None;
        }

        let old_brk = self.bmp.load(Ordering::Relaxed);
        let incr = incr as usize;
        if old_brk + incr > self.max_addr {
            warn!(
                "arena: out of memory, would require {} bytes",
                old_brk - self.heap_start + incr
            );
            errno::set_errno(errno::Errno(libc::ENOMEM));
            return None;
        }

        let new_brk = old_brk + incr;
        let new_brk_chunk = round_up(new_brk, self.page_size);
        let bmp_chunk = self.bmp_chunk.load(Ordering::Relaxed);

        if new_brk_chunk > bmp_chunk {
            let len = new_brk_chunk - bmp_chunk;
            let rc = unsafe {
                libc::mprotect(
                    bmp_chunk as *mut libc::c_void,
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if rc == -1 {
                warn!("arena: mprotect of {len} bytes at {bmp_chunk:#x} failed: {}", errno());
                return None;
            }
            crate::stats::STATS.pages_committed.increase(len as i64);
            self.bmp_chunk.store(new_brk_chunk, Ordering::Relaxed);
        }

        self.bmp.store(new_brk, Ordering::Relaxed);
        Some(old_brk as *mut u8)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(
                self.heap_start as *mut libc::c_void,
                self.max_addr - self.heap_start,
            );
        }
    }
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_and_down() {
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_down(4097, 4096), 4096);
    }

    #[test]
    fn extend_bmp_rejects_negative_increment() {
        let arena = Arena::init(90, 4 * 1024 * 1024).expect("mmap should succeed in test env");
        assert!(arena.extend_bmp(-1).is_none());
    }

    #[test]
    fn extend_bmp_commits_pages_and_advances() {
        let arena = Arena::init(91, 4 * 1024 * 1024).expect("mmap should succeed in test env");
        let first = arena.extend_bmp(64).unwrap();
        assert_eq!(first as usize, arena.heap_start);
        assert_eq!(arena.current_usage(), 64);

        let second = arena.extend_bmp(64).unwrap();
        assert_eq!(second as usize, arena.heap_start + 64);
        assert_eq!(arena.current_usage(), 128);
    }

    #[test]
    fn extend_bmp_fails_past_max_addr() {
        let size = 8192;
        let arena = Arena::init(92, size).expect("mmap should succeed in test env");
        assert!(arena.extend_bmp(size as isize + 1).is_none());
    }
}
