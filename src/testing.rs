//! Mock collaborators shared by the unit tests.

use std::{
    alloc::{alloc, Layout},
    collections::{HashMap, HashSet},
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use env_logger::Target;
use once_cell::sync::Lazy;

use crate::{
    config::Config,
    logging,
    real::RealAllocator,
    record::MIN_ALIGN,
    stack::Unwinder,
    tracker::Tracker,
};

pub fn config() -> Config {
    Config {
        report_path: PathBuf::from("/nonexistent/leak_report"),
        debug_print: false,
    }
}

pub fn ready_tracker() -> Box<Tracker<MockAllocator, FixedUnwinder>> {
    let tracker = Box::new(Tracker::new(FixedUnwinder));
    tracker
        .ensure_ready(|_| Ok((config(), MockAllocator::new())))
        .unwrap();
    tracker
}

/// Real allocator that never gives memory back, so a released block can still be inspected.
#[derive(Default)]
pub struct MockAllocator {
    blocks: Mutex<HashMap<usize, Layout>>,
    released: Mutex<HashSet<usize>>,
    allocations: AtomicUsize,
}

impl MockAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn deallocations(&self) -> usize {
        self.released.lock().unwrap().len()
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.lock().unwrap().len() - self.deallocations()
    }
}

impl RealAllocator for MockAllocator {
    unsafe fn allocate(&self, size: usize) -> *mut u8 {
        let layout = Layout::from_size_align(size.max(1), MIN_ALIGN).unwrap();
        let ptr = alloc(layout);
        self.blocks.lock().unwrap().insert(ptr as usize, layout);
        self.allocations.fetch_add(1, Ordering::SeqCst);
        ptr
    }

    unsafe fn deallocate(&self, ptr: *mut u8) {
        assert!(
            self.blocks.lock().unwrap().contains_key(&(ptr as usize)),
            "deallocating a block the mock never produced"
        );
        assert!(
            self.released.lock().unwrap().insert(ptr as usize),
            "block deallocated twice"
        );
    }
}

/// Unwinder returning a fixed, fake call chain.
pub struct FixedUnwinder;

impl FixedUnwinder {
    pub const FRAMES: &'static [usize] = &[0x1000, 0x2000, 0x3000];
}

impl Unwinder for FixedUnwinder {
    fn capture(&self, frames: &mut [usize]) -> usize {
        let n = Self::FRAMES.len().min(frames.len());
        frames[..n].copy_from_slice(&Self::FRAMES[..n]);
        n
    }
}

pub static NESTED: Tracker<MockAllocator, AllocatingUnwinder> = Tracker::new(AllocatingUnwinder);

static NESTED_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

/// Unwinder that allocates through [`NESTED`] while capturing, the way a real unwinder may.
pub struct AllocatingUnwinder;

impl AllocatingUnwinder {
    pub fn nested_allocations() -> usize {
        NESTED_ALLOCATIONS.load(Ordering::SeqCst)
    }
}

impl Unwinder for AllocatingUnwinder {
    fn capture(&self, frames: &mut [usize]) -> usize {
        let scratch = unsafe { NESTED.allocate(128, MIN_ALIGN) };
        assert!(!scratch.is_null());
        NESTED_ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
        frames[0] = scratch as usize;
        1
    }
}

/// Output of the process-wide test logger.
#[derive(Clone, Default)]
pub struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

static LOG: Lazy<CapturedLog> = Lazy::new(|| {
    let log = CapturedLog::default();
    logging::builder(true)
        .target(Target::Pipe(Box::new(log.clone())))
        .try_init()
        .expect("no other logger is installed by the unit tests");
    log
});

/// Install the debug-print logger, writing into memory.
pub fn captured_log() -> &'static CapturedLog {
    &LOG
}

