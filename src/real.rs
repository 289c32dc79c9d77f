use libc::{c_char, c_void, dlsym, RTLD_NEXT};

use crate::error::Error;

/// The allocator the tracker wraps and delegates to.
pub trait RealAllocator {
    /// `malloc` semantics: `size` bytes aligned to [`crate::record::MIN_ALIGN`], or null.
    ///
    /// # Safety
    ///
    /// Implementations may call into foreign code.
    unsafe fn allocate(&self, size: usize) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` must have been returned by [`Self::allocate`] and not yet deallocated.
    unsafe fn deallocate(&self, ptr: *mut u8);
}

type MallocFunc = unsafe extern "C" fn(size: libc::size_t) -> *mut c_void;
type FreeFunc = unsafe extern "C" fn(ptr: *mut c_void);

/// The next `malloc`/`free` after this library in the symbol lookup order, normally libc's.
pub struct LibcAllocator {
    malloc: MallocFunc,
    free: FreeFunc,
}

impl LibcAllocator {
    /// `dlsym` may itself call `malloc`; callers must be able to serve that from the bootstrap
    /// pool.
    pub fn resolve() -> Result<Self, Error> {
        let malloc = unsafe { dlsym(RTLD_NEXT, b"malloc\0".as_ptr() as *const c_char) };
        if malloc.is_null() {
            return Err(Error::RealAllocator("malloc"));
        }
        let free = unsafe { dlsym(RTLD_NEXT, b"free\0".as_ptr() as *const c_char) };
        if free.is_null() {
            return Err(Error::RealAllocator("free"));
        }
        Ok(LibcAllocator {
            malloc: unsafe { std::mem::transmute::<*mut c_void, MallocFunc>(malloc) },
            free: unsafe { std::mem::transmute::<*mut c_void, FreeFunc>(free) },
        })
    }
}

impl RealAllocator for LibcAllocator {
    unsafe fn allocate(&self, size: usize) -> *mut u8 {
        (self.malloc)(size) as *mut u8
    }

    unsafe fn deallocate(&self, ptr: *mut u8) {
        (self.free)(ptr as *mut c_void)
    }
}
