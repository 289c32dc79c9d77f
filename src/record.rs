//! Metadata stored in front of every block obtained from the real allocator.
//!
//! ```text
//! base                      record            user
//!  |  (padding for align>16) | Record ...      | caller's bytes ...
//! ```
//!
//! The record always sits immediately before the pointer returned to the caller, so it can be
//! found from that pointer alone.

use std::{mem::size_of, ptr};

use crate::stack::StackTrace;

/// Alignment guaranteed by the real `malloc` and by every pointer this crate returns.
pub const MIN_ALIGN: usize = 16;

/// Linked into the registry.
pub const TAG_TRACKED: usize = 0x6c65_616b_7472_6b64;
/// Served while tracking was suppressed, or after the report was written.
pub const TAG_UNTRACKED: usize = 0x6c65_616b_756e_746b;
/// Removed from the registry by the report drain while still owned by the program.
pub const TAG_DETACHED: usize = 0x6c65_616b_6474_6368;
/// Handed back to the real allocator.
pub const TAG_RELEASED: usize = 0x6c65_616b_7265_6c73;

#[repr(C, align(16))]
pub struct Record {
    pub(crate) prev: *mut Record,
    pub(crate) next: *mut Record,
    /// Start of the underlying block, passed back to the real deallocator.
    pub(crate) base: *mut u8,
    pub(crate) tag: usize,
    pub size: usize,
    pub stack: StackTrace,
}

/// Bytes between the record and the caller's pointer.  `Record` is 16-byte aligned, so this
/// keeps user pointers at `MIN_ALIGN`.
pub const RECORD_OVERHEAD: usize = size_of::<Record>();

impl Record {
    /// Size of the real allocation needed to serve `size` bytes at `align`.
    pub fn block_size(size: usize, align: usize) -> Option<usize> {
        let padding = if align > MIN_ALIGN { align } else { 0 };
        size.checked_add(RECORD_OVERHEAD)?.checked_add(padding)
    }

    /// Initialize the record inside the block at `base` and return it.
    ///
    /// # Safety
    ///
    /// `base` must be `MIN_ALIGN`-aligned and valid for `Record::block_size(size, align)` bytes.
    pub unsafe fn place(
        base: *mut u8,
        size: usize,
        align: usize,
        stack: StackTrace,
        tag: usize,
    ) -> *mut Record {
        let user = align_up(base as usize + RECORD_OVERHEAD, align.max(MIN_ALIGN))
            .unwrap_or(base as usize + RECORD_OVERHEAD);
        let record = (user - RECORD_OVERHEAD) as *mut Record;
        ptr::write(
            record,
            Record {
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                base,
                tag,
                size,
                stack,
            },
        );
        record
    }

    /// # Safety
    ///
    /// `user` must have been produced by [`Record::user`].
    pub unsafe fn from_user(user: *mut u8) -> *mut Record {
        user.sub(RECORD_OVERHEAD) as *mut Record
    }

    pub fn user(record: *mut Record) -> *mut u8 {
        (record as usize + RECORD_OVERHEAD) as *mut u8
    }

    pub fn tag(&self) -> usize {
        self.tag
    }
}

pub fn align_up(addr: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(addr.checked_add(align - 1)? & !(align - 1))
}
