//! Append-only pool that serves allocations while the tracker is still resolving the real
//! allocator.  Memory handed out here is never reused; freeing it is a no-op.

use std::{
    cell::UnsafeCell,
    mem::size_of,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::record::{align_up, MIN_ALIGN};

/// Capacity of the pool backing the tracker.
pub const POOL_CAPACITY: usize = 65536;

// Each chunk is preceded by its length so that `realloc` can copy out of the pool.
const LEN_PREFIX: usize = size_of::<usize>();

#[repr(C, align(16))]
pub struct BootstrapPool<const N: usize> {
    buf: UnsafeCell<[u8; N]>,
    offset: AtomicUsize,
}

// Chunks are carved out by advancing `offset` with a CAS, so no two callers ever share bytes.
unsafe impl<const N: usize> Sync for BootstrapPool<N> {}

impl<const N: usize> BootstrapPool<N> {
    pub const fn new() -> Self {
        BootstrapPool {
            buf: UnsafeCell::new([0; N]),
            offset: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> usize {
        self.buf.get() as usize
    }

    /// Bump-allocate `size` bytes aligned to `align`.  Returns null once the pool cannot fit the
    /// request; capacity is never recovered.
    pub fn allocate(&self, size: usize, align: usize) -> *mut u8 {
        let base = self.base();
        let align = align.max(MIN_ALIGN);
        let mut data = 0;
        let res = self
            .offset
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |offset| {
                let start = align_up(base.checked_add(offset)?.checked_add(LEN_PREFIX)?, align)?;
                let end = start.checked_add(size)?;
                if end - base > N {
                    return None;
                }
                data = start;
                Some(end - base)
            });
        if res.is_err() {
            return ptr::null_mut();
        }
        let data = data as *mut u8;
        unsafe { (data.sub(LEN_PREFIX) as *mut usize).write_unaligned(size) };
        data
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.base() && addr < self.base() + N
    }

    /// Size requested for a chunk previously returned by [`Self::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this pool.
    pub unsafe fn chunk_size(&self, ptr: *const u8) -> usize {
        (ptr.sub(LEN_PREFIX) as *const usize).read_unaligned()
    }

    pub fn used(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_are_aligned_and_disjoint() {
        let pool = BootstrapPool::<1024>::new();
        let a = pool.allocate(10, MIN_ALIGN);
        let b = pool.allocate(3, MIN_ALIGN);
        let c = pool.allocate(64, 64);
        for p in &[a, b, c] {
            assert!(!p.is_null());
            assert!(pool.contains(*p));
        }
        assert_eq!(a as usize % MIN_ALIGN, 0);
        assert_eq!(b as usize % MIN_ALIGN, 0);
        assert_eq!(c as usize % 64, 0);
        assert!(b as usize >= a as usize + 10);
        assert!(c as usize >= b as usize + 3);
        unsafe {
            assert_eq!(pool.chunk_size(a), 10);
            assert_eq!(pool.chunk_size(b), 3);
            assert_eq!(pool.chunk_size(c), 64);
        }
    }

    #[test]
    fn exhaustion_is_permanent() {
        let pool = BootstrapPool::<256>::new();
        assert!(!pool.allocate(100, MIN_ALIGN).is_null());
        let used = pool.used();
        assert!(pool.allocate(200, MIN_ALIGN).is_null());
        // A failed request does not move the offset.
        assert_eq!(pool.used(), used);
        assert!(!pool.allocate(16, MIN_ALIGN).is_null());
        let mut last = pool.used();
        while !pool.allocate(16, MIN_ALIGN).is_null() {
            assert!(pool.used() > last);
            last = pool.used();
        }
        assert!(pool.allocate(1, MIN_ALIGN).is_null());
        assert!(pool.used() <= 256);
    }

    #[test]
    fn foreign_pointers_are_not_contained() {
        let pool = BootstrapPool::<64>::new();
        let outside = Box::new(0u8);
        assert!(!pool.contains(&*outside as *const u8));
        assert!(!pool.contains(unsafe { (pool.buf.get() as *const u8).add(64) }));
    }
}
