//! Error taxonomy for the race-tracking core.
//!
//! Every fallible operation in this crate returns [`RaceError`] instead of
//! calling `exit()` the way the original C implementation did. The CLI
//! boundary (see `bin/racestats.rs`) is the only place these get mapped to
//! process exit codes.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, RaceError>;

#[derive(Debug, thiserror::Error)]
pub enum RaceError {
    #[error("io error on {path}: {source}")]
    SystemIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock unavailable: {0:?}")]
    LockUnavailable(crate::lock::LockOutcome),

    #[error("lock removal was requested by a peer process")]
    RemovalRequested,

    #[error("corrupt record in {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("invalid sfv entry on line {line}: {reason}")]
    InvalidSfv { line: usize, reason: String },

    #[error("fatal race condition: pid mismatch while holding the lock")]
    FatalRace,
}

impl RaceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RaceError::SystemIo {
            path: path.into(),
            source,
        }
    }
}
