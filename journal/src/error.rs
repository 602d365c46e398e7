//! Error types for the segmented journal and snapshot lifecycle.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the journal, the replicated log and the snapshot manager.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while reading or writing segment, metadata or snapshot files.
    #[error("journal I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Entry or header (de)serialization failed.
    #[error("codec error: {source}")]
    Codec {
        #[from]
        source: bincode::Error,
    },

    /// Runtime configuration could not be parsed.
    #[error("invalid configuration: {source}")]
    Config {
        #[from]
        source: toml::de::Error,
    },

    /// An index did not follow its predecessor. Always an internal consistency fault.
    #[error("ordering violation: expected index {expected}, found {found}")]
    OrderingViolation { expected: u64, found: u64 },

    /// An appended entry carried a term lower than the log tip.
    #[error("term regression at index {index}: term {term} is below last term {last_term}")]
    TermRegression { index: u64, term: u64, last_term: u64 },

    /// Compaction was requested above the current log tip.
    #[error("compaction to {index} is beyond the last log index {last_index}")]
    BeyondTip { index: i64, last_index: i64 },

    /// The term supplied for an index disagrees with the stored entry.
    #[error("term mismatch at index {index}: log has term {expected}, got {found}")]
    TermMismatch { index: i64, expected: u64, found: i64 },

    /// The requested index lies outside the retained range.
    #[error("index {index} out of range [{first}, {last}]")]
    IndexOutOfRange { index: u64, first: u64, last: u64 },

    /// A pre-commit was requested while another one is still outstanding.
    #[error("snapshot pre-commit already pending at index {index}")]
    PreCommitPending { index: i64 },

    /// Compaction may only move the boundary forward.
    #[error("compaction to {index} is below the current snapshot index {snapshot_index}")]
    CompactionBelowBoundary { index: i64, snapshot_index: i64 },

    /// A cursor was advanced past its last entry.
    #[error("no such element")]
    NoSuchElement,

    /// A segment or snapshot file is unreadable.
    #[error("corrupted file {path:?}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    /// A capture request could not be handed to its consumer.
    #[error("failed to dispatch capture request: {0}")]
    Dispatch(String),
}

impl Error {
    /// Returns true for faults that indicate broken index/term ordering.
    pub fn is_ordering_violation(&self) -> bool {
        matches!(
            self,
            Error::OrderingViolation { .. }
                | Error::TermRegression { .. }
                | Error::BeyondTip { .. }
                | Error::TermMismatch { .. }
                | Error::CompactionBelowBoundary { .. }
        )
    }
}
