use env_logger::{Builder, Env, Target};
use log::LevelFilter;

use crate::config::LOG_VAR;

/// Logger configuration: `LEAK_REPORT_LOG` filter on stderr, no timestamps.  With
/// `debug_print`, per-call traces from this crate are enabled regardless of the filter.
pub fn builder(debug_print: bool) -> Builder {
    let mut builder = Builder::from_env(Env::new().filter_or(LOG_VAR, "warn"));
    builder.target(Target::Stderr).format_timestamp(None);
    if debug_print {
        builder.filter_module("leak_report", LevelFilter::Trace);
    }
    builder
}

/// Install the stderr logger.
///
/// Must run during setup: the logger's own state is allocated from the bootstrap pool.
pub fn init(debug_print: bool) {
    // Only fails if called twice.
    let _ = builder(debug_print).try_init();
}
