//! `leak_report` records every live heap allocation made by a program and, when the program
//! exits, appends a leak report to a file: each allocation that was never freed, with its size
//! and the symbolized call stack that made it.
//!
//! The target program does not need to be recompiled.  Load the companion
//! [`lib_leak_report`] dynamic library with `LD_PRELOAD`; it replaces `malloc`, `free`,
//! `calloc`, `realloc` and the aligned allocators with entry points that forward to the
//! [`Tracker`] defined here:
//!
//! ```bash
//! LEAK_REPORT_PATH=leaks.txt LD_PRELOAD=libleak_report.so ./my_program
//! ```
//!
//! ## Configuration
//!
//! * `LEAK_REPORT_PATH` (required): report destination.  The program exits with status 1 if it
//!   is missing.
//! * `LEAK_REPORT_PRINT=1`: trace every `malloc`/`free` to stderr.
//! * `LEAK_REPORT_LOG`: `env_logger` filter for the tracker's own diagnostics.
//!
//! ## Report format
//!
//! ```text
//! 2 records
//!
//! 10 bytes:
//! make_buffer(/src/demo.c:12)
//! main(/src/demo.c:30)
//! <UNKNOWN>(0x7f1b2c029d90)
//!
//! 30 bytes:
//! ...
//! ```
//!
//! The report is opened in append mode, so several runs can accumulate in one file.  The
//! `lr_print` tool from this crate merges identical stacks across reports and ranks them by
//! leaked bytes:
//!
//! ```bash
//! lr_print --report 'leaks*.txt' --threshold 1
//! ```
//!
//! ## How tracking works
//!
//! Until the real allocator has been resolved with `dlsym` (which itself allocates), requests
//! are served from a fixed [`BootstrapPool`].  Afterwards each tracked block is obtained from
//! the real allocator with a [`Record`] in front of it, and the record is linked into the
//! [`Registry`].  While the tracker is capturing a stack, writing the report or logging, a
//! per-thread [`Suppressed`] marker is held and allocations are served untracked.

#![allow(clippy::missing_safety_doc)]

mod bootstrap;
mod config;
mod error;
pub mod logging;
mod real;
mod record;
mod registry;
mod report;
mod stack;
mod summary;
mod symbolize;
mod tracker;

#[cfg(test)]
mod testing;

pub use crate::{
    bootstrap::{BootstrapPool, POOL_CAPACITY},
    config::{Config, LOG_VAR, PRINT_VAR, REPORT_PATH_VAR},
    error::{Error, EXIT_MISSING_CONFIG, EXIT_OPEN_REPORT, EXIT_REAL_ALLOCATOR, EXIT_SYMBOLIZER},
    real::{LibcAllocator, RealAllocator},
    record::{Record, MIN_ALIGN, RECORD_OVERHEAD},
    registry::Registry,
    report::{format_frame, write_header, write_leak, UNKNOWN},
    stack::{
        capture, is_suppressed, BacktraceUnwinder, StackTrace, Suppressed, Unwinder, MAX_DEPTH,
    },
    summary::{StackLeaks, Summary},
    symbolize::{Demangler, Module, ProcessSymbolizer, SourceLocation, SymbolDemangler, Symbolizer},
    tracker::{Leak, Phase, Release, Tracker},
};

/// The tracker used by the `LD_PRELOAD` library.
pub type ProcessTracker = Tracker<LibcAllocator, BacktraceUnwinder>;

/// One-time setup for [`ProcessTracker`]: read the configuration, install the logger, resolve
/// the real allocator.
pub fn process_setup() -> Result<(Config, LibcAllocator), Error> {
    let config = Config::from_env();
    logging::init(config.as_ref().map_or(false, |c| c.debug_print));
    let config = config?;
    let real = LibcAllocator::resolve()?;
    Ok((config, real))
}
