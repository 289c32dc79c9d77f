//! The interception engine: decides which path serves each allocation and keeps the registry
//! of live tracked blocks.

use std::{
    ptr,
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use log::trace;
use once_cell::sync::OnceCell;

use crate::{
    bootstrap::{BootstrapPool, POOL_CAPACITY},
    config::Config,
    error::Error,
    real::RealAllocator,
    record::{Record, MIN_ALIGN, TAG_DETACHED, TAG_RELEASED, TAG_TRACKED, TAG_UNTRACKED},
    registry::Registry,
    stack::{self, StackTrace, Suppressed, Unwinder},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Uninitialized = 0,
    /// Setup is running; allocations come from the bootstrap pool.
    Initializing = 1,
    Ready = 2,
    /// The report has started; nothing is tracked any more.
    Finished = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Uninitialized,
            1 => Phase::Initializing,
            2 => Phase::Ready,
            _ => Phase::Finished,
        }
    }
}

/// What [`Tracker::deallocate`] did with a pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    Null,
    /// Inside the bootstrap pool: ignored.
    Bootstrap,
    /// Unregistered and returned to the real allocator.
    Tracked,
    Untracked,
    /// Already drained by the report; returned to the real allocator.
    Detached,
    /// Already released (double free): ignored.
    Stale,
    /// Not produced by this tracker; passed to the real allocator as is, if one is available.
    Foreign,
}

/// A leaked allocation, as seen by the report.
#[derive(Clone, Copy, Debug)]
pub struct Leak {
    pub size: usize,
    pub stack: StackTrace,
}

/// Process-wide tracking context.  Allocator entry points forward every call here.
pub struct Tracker<A, U> {
    phase: AtomicU8,
    pool: BootstrapPool<POOL_CAPACITY>,
    registry: Mutex<Registry>,
    real: OnceCell<A>,
    config: OnceCell<Config>,
    unwinder: U,
}

impl<A: RealAllocator, U: Unwinder> Tracker<A, U> {
    pub const fn new(unwinder: U) -> Self {
        Tracker {
            phase: AtomicU8::new(Phase::Uninitialized as u8),
            pool: BootstrapPool::new(),
            registry: Mutex::new(Registry::new()),
            real: OnceCell::new(),
            config: OnceCell::new(),
            unwinder,
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    pub fn config(&self) -> Option<&Config> {
        self.config.get()
    }

    /// Run one-time setup if nobody has started it yet.  Allocations made by `setup`, or by any
    /// thread while it runs, are served from the bootstrap pool.
    ///
    /// On failure the tracker stays in [`Phase::Initializing`]; the caller is expected to
    /// terminate the process.
    pub fn ensure_ready<F>(&self, setup: F) -> Result<(), Error>
    where
        F: FnOnce(&Self) -> Result<(Config, A), Error>,
    {
        if self.phase() != Phase::Uninitialized {
            return Ok(());
        }
        if self
            .phase
            .compare_exchange(
                Phase::Uninitialized as u8,
                Phase::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }
        let (config, real) = setup(self)?;
        let _ = self.config.set(config);
        let _ = self.real.set(real);
        self.phase.store(Phase::Ready as u8, Ordering::Release);
        Ok(())
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live tracked allocations.
    pub fn live_count(&self) -> usize {
        self.registry().len()
    }

    fn debug_print(&self) -> bool {
        self.config.get().map_or(false, |c| c.debug_print)
    }

    /// Serve a `malloc`-family request.
    ///
    /// # Safety
    ///
    /// `align` must be a power of two.
    pub unsafe fn allocate(&self, size: usize, align: usize) -> *mut u8 {
        let real = match self.real.get() {
            Some(real) if self.phase() != Phase::Initializing => real,
            _ => return self.pool.allocate(size, align),
        };
        if self.phase() != Phase::Ready || stack::is_suppressed() {
            return self.allocate_untracked(real, size, align);
        }

        let res = self.allocate_tracked(real, size, align);
        if self.debug_print() {
            let _suppressed = Suppressed::enter();
            trace!("malloc({}) = {:p}", size, res);
        }
        res
    }

    unsafe fn allocate_tracked(&self, real: &A, size: usize, align: usize) -> *mut u8 {
        let base = match Record::block_size(size, align) {
            Some(total) => real.allocate(total),
            None => return ptr::null_mut(),
        };
        if base.is_null() {
            return base;
        }
        let stack = stack::capture(&self.unwinder);
        let record = Record::place(base, size, align, stack, TAG_TRACKED);
        self.registry().register(record);
        Record::user(record)
    }

    unsafe fn allocate_untracked(&self, real: &A, size: usize, align: usize) -> *mut u8 {
        let base = match Record::block_size(size, align) {
            Some(total) => real.allocate(total),
            None => return ptr::null_mut(),
        };
        if base.is_null() {
            return base;
        }
        Record::user(Record::place(base, size, align, StackTrace::empty(), TAG_UNTRACKED))
    }

    /// Serve a `free`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by [`Self::allocate`], or one that the real
    /// allocator owns.
    pub unsafe fn deallocate(&self, ptr: *mut u8) -> Release {
        if ptr.is_null() {
            return Release::Null;
        }
        if self.pool.contains(ptr) {
            return Release::Bootstrap;
        }
        let real = match self.real.get() {
            Some(real) => real,
            // Nothing but the pool could have produced it yet.
            None => return Release::Foreign,
        };

        let record = Record::from_user(ptr);
        let release = {
            let mut registry = self.registry();
            let release = match (*record).tag {
                TAG_TRACKED => {
                    registry.unregister(record);
                    Release::Tracked
                }
                TAG_UNTRACKED => Release::Untracked,
                TAG_DETACHED => Release::Detached,
                TAG_RELEASED => return Release::Stale,
                _ => Release::Foreign,
            };
            if release != Release::Foreign {
                (*record).tag = TAG_RELEASED;
            }
            release
        };

        if release == Release::Foreign {
            real.deallocate(ptr);
        } else {
            real.deallocate((*record).base);
        }
        if self.debug_print() && !stack::is_suppressed() {
            let _suppressed = Suppressed::enter();
            trace!("free({:p})", ptr);
        }
        release
    }

    /// Bytes the caller may use at `ptr`, if the tracker produced it.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::deallocate`].
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
        if ptr.is_null() {
            return None;
        }
        if self.pool.contains(ptr) {
            return Some(self.pool.chunk_size(ptr));
        }
        self.real.get()?;
        let record = Record::from_user(ptr);
        match (*record).tag {
            TAG_TRACKED | TAG_UNTRACKED | TAG_DETACHED => Some((*record).size),
            _ => None,
        }
    }

    /// Serve a `realloc`: allocate afresh, copy, release the old block.  The new block gets a
    /// new stack.  Returns null and leaves `ptr` untouched if the size of `ptr` is unknown or
    /// allocation fails.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::deallocate`].
    pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size, MIN_ALIGN);
        }
        if size == 0 {
            self.deallocate(ptr);
            return ptr::null_mut();
        }
        let old_size = match self.usable_size(ptr) {
            Some(old_size) => old_size,
            None => return ptr::null_mut(),
        };
        let res = self.allocate(size, MIN_ALIGN);
        if res.is_null() {
            return res;
        }
        ptr::copy_nonoverlapping(ptr, res, old_size.min(size));
        self.deallocate(ptr);
        res
    }

    /// Stop tracking: later allocations are served untracked.
    pub(crate) fn finish(&self) {
        self.phase.store(Phase::Finished as u8, Ordering::Release);
    }

    /// Detach live records one at a time.  Detached blocks stay owned by the program.
    pub fn drain(&self) -> Drain<'_, A, U> {
        Drain { tracker: self }
    }
}

pub struct Drain<'a, A, U> {
    tracker: &'a Tracker<A, U>,
}

impl<'a, A: RealAllocator, U: Unwinder> Iterator for Drain<'a, A, U> {
    type Item = Leak;

    fn next(&mut self) -> Option<Leak> {
        let mut registry = self.tracker.registry();
        let record = registry.pop()?;
        unsafe {
            (*record).tag = TAG_DETACHED;
            Some(Leak {
                size: (*record).size,
                stack: (*record).stack,
            })
        }
    }
}
