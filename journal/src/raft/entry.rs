use serde_derive::{Deserialize, Serialize};

/// A single replicated log entry. Read-only once written to a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, payload: impl Into<Vec<u8>>) -> Self {
        LogEntry {
            index,
            term,
            payload: payload.into(),
        }
    }

    /// Bytes this entry contributes to the log's data size.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
