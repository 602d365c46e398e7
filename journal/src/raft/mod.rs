use crate::error::Result;

pub mod entry;
pub mod journal;
pub mod node;
pub mod reader;
pub mod segment;
pub mod snapshot;
pub mod snapshot_manager;
pub mod storage;
pub mod term_info;

use snapshot::InstallSnapshotRequest;

pub trait StateMachine {
    fn apply(&mut self, index: u64, data: &[u8]);
    fn snapshot(&self) -> Vec<u8>;
    fn on_snapshot(&mut self, last_index: u64, last_term: u64, data: &[u8]);
}

/// Facts about the local member that the snapshot lifecycle consumes.
pub trait RaftContext {
    fn id(&self) -> &str;

    /// Index last applied to the state machine, -1 if none.
    fn last_applied(&self) -> i64;

    fn peer_ids(&self) -> Vec<String>;

    fn current_term(&self) -> i64;

    fn has_followers(&self) -> bool {
        !self.peer_ids().is_empty()
    }
}

/// The consensus role currently driving the log.
pub trait RaftBehavior {
    fn replicated_to_all_index(&self) -> i64;

    fn set_replicated_to_all_index(&mut self, index: i64);

    /// Hands an install request to the role for transmission.
    fn handle_message(&mut self, sender: &str, request: InstallSnapshotRequest) -> Result<()>;

    fn leader_id(&self) -> Option<String>;
}
