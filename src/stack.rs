//! Call stack snapshots for tracked allocations, and the per-thread marker that keeps the
//! tracker from tracking its own allocations.

use std::{
    cell::Cell,
    fmt,
    marker::PhantomData,
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use libc::c_void;

/// Maximum number of frames kept per allocation.
pub const MAX_DEPTH: usize = 32;

thread_local! {
    // Depth of nested `Suppressed` guards on this thread.  Const-initialized and without a
    // destructor, so accessing it never allocates.
    static SUPPRESSED: Cell<usize> = const { Cell::new(0) };
}

/// While alive, allocations on this thread are served untracked.
///
/// Acquire it around any call that may allocate on the tracker's behalf: unwinding,
/// symbolization, demangling, logging.
pub struct Suppressed {
    _not_send: PhantomData<*const ()>,
}

impl Suppressed {
    pub fn enter() -> Self {
        SUPPRESSED.with(|depth| depth.set(depth.get() + 1));
        Suppressed {
            _not_send: PhantomData,
        }
    }
}

impl Drop for Suppressed {
    fn drop(&mut self) {
        SUPPRESSED.with(|depth| depth.set(depth.get() - 1));
    }
}

pub fn is_suppressed() -> bool {
    SUPPRESSED.with(|depth| depth.get() > 0)
}

/// Return addresses of a call chain, innermost first.
#[derive(Clone, Copy)]
pub struct StackTrace {
    depth: usize,
    frames: [usize; MAX_DEPTH],
}

impl StackTrace {
    pub const fn empty() -> Self {
        StackTrace {
            depth: 0,
            frames: [0; MAX_DEPTH],
        }
    }

    pub fn from_frames(frames: &[usize]) -> Self {
        let mut stack = Self::empty();
        stack.depth = frames.len().min(MAX_DEPTH);
        stack.frames[..stack.depth].copy_from_slice(&frames[..stack.depth]);
        stack
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.depth]
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|ip| format!("{:#x}", ip)))
            .finish()
    }
}

/// Produces the current call chain.
pub trait Unwinder {
    /// Fill `frames` with return addresses, innermost first, and return how many were written.
    fn capture(&self, frames: &mut [usize]) -> usize;
}

/// Unwinder backed by [`backtrace::trace`].
///
/// The leading frames that belong to the object this crate is linked into (the unwinder
/// itself, the tracker, the interposed `malloc`) are dropped, so the first frame recorded is
/// the allocation's caller.
pub struct BacktraceUnwinder;

impl Unwinder for BacktraceUnwinder {
    fn capture(&self, frames: &mut [usize]) -> usize {
        let own = own_object();
        let mut caller = CallerFrames::new(frames, |ip| own.is_some() && object_base(ip) == own);
        backtrace::trace(|frame| caller.push(frame.ip() as usize));
        caller.depth
    }
}

// Load address of the object containing `addr`.  `dladdr` does not allocate.
fn object_base(addr: usize) -> Option<usize> {
    let mut info: libc::Dl_info = unsafe { mem::zeroed() };
    if unsafe { libc::dladdr(addr as *const c_void, &mut info) } == 0 {
        None
    } else {
        Some(info.dli_fbase as usize)
    }
}

fn own_object() -> Option<usize> {
    static OWN_OBJECT: AtomicUsize = AtomicUsize::new(0);
    match OWN_OBJECT.load(Ordering::Relaxed) {
        0 => {
            let base = object_base(own_object as usize)?;
            OWN_OBJECT.store(base, Ordering::Relaxed);
            Some(base)
        }
        base => Some(base),
    }
}

// Collects return addresses, skipping the leading run of the tracker's own frames.
struct CallerFrames<'a, F> {
    frames: &'a mut [usize],
    depth: usize,
    in_tracker: bool,
    is_own: F,
}

impl<'a, F: Fn(usize) -> bool> CallerFrames<'a, F> {
    fn new(frames: &'a mut [usize], is_own: F) -> Self {
        CallerFrames {
            frames,
            depth: 0,
            in_tracker: true,
            is_own,
        }
    }

    // Returns whether the walk should continue.
    fn push(&mut self, ip: usize) -> bool {
        if ip == 0 || self.depth == self.frames.len() {
            return false;
        }
        if self.in_tracker && (self.is_own)(ip) {
            return true;
        }
        self.in_tracker = false;
        self.frames[self.depth] = ip;
        self.depth += 1;
        self.depth < self.frames.len()
    }
}

/// Snapshot the caller's stack.  Any allocation made by `unwinder` is served untracked.
pub fn capture<U: Unwinder>(unwinder: &U) -> StackTrace {
    let _suppressed = Suppressed::enter();
    let mut stack = StackTrace::empty();
    stack.depth = unwinder.capture(&mut stack.frames).min(MAX_DEPTH);
    stack
}
