//! Segmented RAFT journal with a snapshot/compaction lifecycle.

pub mod config;
pub mod error;
pub mod metrics;
pub mod raft;

pub use config::JournalConfig;
pub use error::{Error, Result};
pub use raft::entry::LogEntry;
pub use raft::journal::{Journal, SegmentInfo};
pub use raft::node::{Node, NodeEvent};
pub use raft::reader::SegmentedJournalReader;
pub use raft::snapshot::{
    CaptureSnapshot, FileSnapshotStore, InstallSnapshotRequest, Snapshot,
    SnapshotSelectionCriteria, SnapshotStorage,
};
pub use raft::snapshot_manager::SnapshotManager;
pub use raft::storage::{ReplicatedLog, SegmentedReplicatedLog};
pub use raft::{RaftBehavior, RaftContext, StateMachine};
