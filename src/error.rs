use std::{io, path::PathBuf};

/// Exit status when the mandatory report destination is not configured.
pub const EXIT_MISSING_CONFIG: i32 = 1;
/// Exit status when the report destination cannot be opened at shutdown.
pub const EXIT_OPEN_REPORT: i32 = 2;
/// Exit status when loaded modules cannot be enumerated for symbolization.
pub const EXIT_SYMBOLIZER: i32 = 3;
/// Exit status when the next `malloc`/`free` in the lookup order cannot be found.
pub const EXIT_REAL_ALLOCATOR: i32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} environment variable is not set, exiting")]
    MissingConfig(&'static str),

    #[error("couldn't find original {0}")]
    RealAllocator(&'static str),

    #[error("failed to open leak report {}: {}", .path.display(), .source)]
    OpenReport { path: PathBuf, source: io::Error },

    #[error("failed to initialize symbolizer: {0}")]
    Symbolizer(String),

    #[error("failed to write leak report: {0}")]
    WriteReport(#[from] io::Error),

    #[error("leak tracker is not initialized")]
    NotReady,
}

impl Error {
    /// Exit status reserved for this error, or `None` if it does not terminate the process.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::MissingConfig(_) => Some(EXIT_MISSING_CONFIG),
            Error::OpenReport { .. } => Some(EXIT_OPEN_REPORT),
            Error::Symbolizer(_) => Some(EXIT_SYMBOLIZER),
            Error::RealAllocator(_) => Some(EXIT_REAL_ALLOCATOR),
            Error::WriteReport(_) | Error::NotReady => None,
        }
    }
}
