//! Companion crate to [`leak_report`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept the `malloc` family of the program and route it
//! through the `leak_report` tracker.  The leak report is written when the library is unloaded
//! at process exit.

use std::process;

use leak_report::{
    process_setup, BacktraceUnwinder, ProcessSymbolizer, ProcessTracker, SymbolDemangler,
    MIN_ALIGN,
};
use libc::{c_int, c_void, size_t, EINVAL, ENOMEM};
use log::error;

static TRACKER: ProcessTracker = ProcessTracker::new(BacktraceUnwinder);

// Returns the tracker, running setup on first use.  Setup failures terminate the process.
fn tracker() -> &'static ProcessTracker {
    if let Err(e) = TRACKER.ensure_ready(|_| process_setup()) {
        error!("{}", e);
        process::exit(e.exit_code().unwrap_or(1));
    }
    &TRACKER
}

#[ctor::ctor]
fn attach() {
    tracker();
}

#[ctor::dtor]
fn detach() {
    if !TRACKER.is_ready() {
        return;
    }
    if let Err(e) = TRACKER.report(ProcessSymbolizer::open, &SymbolDemangler) {
        error!("{}", e);
        if let Some(code) = e.exit_code() {
            process::exit(code);
        }
    }
}

/// When this library is loaded with `LD_PRELOAD`, this `malloc` implementation
/// catches `malloc` calls performed by the program and records them with their call stack.
///
/// # Safety
///
/// Same contract as libc `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    tracker().allocate(size, MIN_ALIGN) as *mut c_void
}

/// # Safety
///
/// Same contract as libc `free`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    tracker().deallocate(ptr as *mut u8);
}

/// # Safety
///
/// Same contract as libc `calloc`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => return std::ptr::null_mut(),
    };
    let res = tracker().allocate(total, MIN_ALIGN);
    if !res.is_null() {
        res.write_bytes(0, total);
    }
    res as *mut c_void
}

/// # Safety
///
/// Same contract as libc `realloc`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    tracker().reallocate(ptr as *mut u8, size) as *mut c_void
}

/// # Safety
///
/// Same contract as libc `posix_memalign`.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    if !alignment.is_power_of_two() || alignment % std::mem::size_of::<*mut c_void>() != 0 {
        return EINVAL;
    }
    let res = tracker().allocate(size, alignment);
    if res.is_null() {
        return ENOMEM;
    }
    *memptr = res as *mut c_void;
    0
}

/// # Safety
///
/// Same contract as libc `aligned_alloc`.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    memalign(alignment, size)
}

/// # Safety
///
/// Same contract as libc `memalign`.
#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    if !alignment.is_power_of_two() {
        *libc::__errno_location() = EINVAL;
        return std::ptr::null_mut();
    }
    tracker().allocate(size, alignment) as *mut c_void
}

/// # Safety
///
/// Same contract as libc `malloc_usable_size`.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
    tracker().usable_size(ptr as *mut u8).unwrap_or(0)
}
