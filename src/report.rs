//! Leak report written at process exit.
//!
//! ```text
//! 2 records
//!
//! 30 bytes:
//! main(/src/demo.c:12)
//! <UNKNOWN>(0x7f3a2c001234)
//!
//! 10 bytes:
//! ...
//! ```

use std::{
    fs::OpenOptions,
    io::{self, BufWriter, Write},
};

use log::{error, info};

use crate::{
    error::Error,
    real::RealAllocator,
    stack::{Suppressed, Unwinder},
    symbolize::{Demangler, Symbolizer},
    tracker::{Leak, Tracker},
};

/// Placeholder for frames whose function cannot be resolved.
pub const UNKNOWN: &str = "<UNKNOWN>";

pub fn write_header<W: Write>(out: &mut W, count: usize) -> io::Result<()> {
    writeln!(out, "{} records", count)
}

pub fn write_leak<W, S, D>(
    out: &mut W,
    leak: &Leak,
    symbolizer: &S,
    demangler: &D,
) -> io::Result<()>
where
    W: Write,
    S: Symbolizer,
    D: Demangler,
{
    writeln!(out, "\n{} bytes:", leak.size)?;
    for &addr in leak.stack.frames() {
        writeln!(out, "{}", format_frame(addr, symbolizer, demangler))?;
    }
    Ok(())
}

/// `name(file:line)` when the source location is known, `name(address)` otherwise.
pub fn format_frame<S: Symbolizer, D: Demangler>(
    addr: usize,
    symbolizer: &S,
    demangler: &D,
) -> String {
    let module = symbolizer.module_for(addr);
    let name = module
        .and_then(|module| symbolizer.name_for(module, addr))
        .map(|name| demangler.demangle(&name).unwrap_or(name))
        .unwrap_or_else(|| UNKNOWN.to_string());
    match module.and_then(|module| symbolizer.source_location_for(module, addr)) {
        Some(location) => format!("{}({}:{})", name, location.file, location.line),
        None => format!("{}({:#x})", name, addr),
    }
}

impl<A: RealAllocator, U: Unwinder> Tracker<A, U> {
    /// Append the leak report to the configured destination, draining the registry.
    ///
    /// Tracking stops for good when this starts.  Everything allocated while reporting is
    /// served untracked.  Returns the number of leaks written.
    pub fn report<S, F, D>(&self, open_symbolizer: F, demangler: &D) -> Result<usize, Error>
    where
        S: Symbolizer,
        F: FnOnce() -> Result<S, Error>,
        D: Demangler,
    {
        let _suppressed = Suppressed::enter();
        let path = self.config().ok_or(Error::NotReady)?.report_path.clone();
        self.finish();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| Error::OpenReport {
                path: path.clone(),
                source,
            })?;
        let mut out = BufWriter::new(file);

        let symbolizer = match open_symbolizer() {
            Ok(symbolizer) => symbolizer,
            Err(e) => {
                let _ = writeln!(out, "{}", e).and_then(|_| out.flush());
                return Err(e);
            }
        };

        let written = self.write_records(&mut out, &symbolizer, demangler)?;
        out.flush()?;
        info!("{} leaks written to {}", written, path.display());
        Ok(written)
    }

    /// Write the header and every live record to `out`.  The registry is drained even if
    /// writing fails.
    pub fn write_records<W, S, D>(
        &self,
        out: &mut W,
        symbolizer: &S,
        demangler: &D,
    ) -> io::Result<usize>
    where
        W: Write,
        S: Symbolizer,
        D: Demangler,
    {
        let header = write_header(out, self.live_count());
        if let Err(e) = &header {
            error!("failed to write leak report header: {}", e);
        }
        let mut written = 0;
        for leak in self.drain() {
            if header.is_err() {
                continue;
            }
            if let Err(e) = write_leak(out, &leak, symbolizer, demangler) {
                error!("failed to write leak of {} bytes: {}", leak.size, e);
                continue;
            }
            written += 1;
        }
        header.map(|_| written)
    }
}
