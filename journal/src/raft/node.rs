//! Single-log node driver
//! Owns the replicated log, the snapshot store and the state machine, answers
//! capture requests posted by the snapshot manager and runs the whole
//! compaction cycle from one task.

use slog::{debug, error, info, o, warn, Logger};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{self, Duration};

use crate::config::JournalConfig;
use crate::error::{Error, Result};
use crate::raft::entry::LogEntry;
use crate::raft::snapshot::{CaptureSnapshot, FileSnapshotStore, InstallSnapshotRequest, SnapshotStorage};
use crate::raft::snapshot_manager::SnapshotManager;
use crate::raft::storage::{ReplicatedLog, SegmentedReplicatedLog};
use crate::raft::{RaftBehavior, RaftContext, StateMachine};

// Constants
const TICK_INTERVAL: Duration = Duration::from_millis(100); // Interval for flush and capture checks
const INSTALL_CHANNEL_SIZE: usize = 64; // Size of outgoing install request buffer

/// Local member facts fed to the snapshot manager.
#[derive(Debug, Clone)]
pub struct NodeContext {
    id: String,
    peers: Vec<String>,
    last_applied: i64,
    current_term: i64,
}

impl NodeContext {
    pub fn new(id: &str, peers: Vec<String>) -> Self {
        NodeContext {
            id: id.to_string(),
            peers,
            last_applied: -1,
            current_term: 1,
        }
    }
}

impl RaftContext for NodeContext {
    fn id(&self) -> &str {
        &self.id
    }

    fn last_applied(&self) -> i64 {
        self.last_applied
    }

    fn peer_ids(&self) -> Vec<String> {
        self.peers.clone()
    }

    fn current_term(&self) -> i64 {
        self.current_term
    }
}

/// Leader-side bookkeeping. Install requests are queued on an outbox for
/// whatever transport the embedding service provides.
pub struct LocalBehavior {
    id: String,
    replicated_to_all_index: i64,
    outbox: Sender<InstallSnapshotRequest>,
}

impl RaftBehavior for LocalBehavior {
    fn replicated_to_all_index(&self) -> i64 {
        self.replicated_to_all_index
    }

    fn set_replicated_to_all_index(&mut self, index: i64) {
        self.replicated_to_all_index = index;
    }

    fn handle_message(&mut self, _sender: &str, request: InstallSnapshotRequest) -> Result<()> {
        self.outbox.try_send(request).map_err(|e| {
            log::error!("Failed to queue install snapshot request {:?}", e);
            Error::Dispatch(e.to_string())
        })
    }

    fn leader_id(&self) -> Option<String> {
        Some(self.id.clone())
    }
}

/// Inputs accepted by [`Node::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Append a payload. Without followers it is committed right away.
    Propose(Vec<u8>),
    /// Entries up to this index are committed.
    Commit(i64),
    /// Compact the log up to this index without a snapshot.
    Trim(i64),
    /// Capture a snapshot and send it to the named follower.
    InstallTo(String),
}

pub struct Node<S: StateMachine> {
    manager: SnapshotManager<SegmentedReplicatedLog, NodeContext>,
    captures: Receiver<CaptureSnapshot>,
    store: FileSnapshotStore,
    behavior: LocalBehavior,
    state_machine: S,
    commit_index: i64,
    applied_since_snapshot: u64,
    snapshot_batch_count: u64,
    size_threshold: u64,
    capture_threshold: u64,
    logger: Logger,
}

impl<S: StateMachine> Node<S> {
    /// Opens the log and snapshot store under `config.dir` and restores the
    /// state machine. Returns the node and the receiving end of its install
    /// request outbox.
    pub fn open(
        id: &str,
        peers: Vec<String>,
        config: &JournalConfig,
        state_machine: S,
        logger: &Logger,
    ) -> Result<(Self, Receiver<InstallSnapshotRequest>)> {
        let logger = logger.new(o!("tag" => format!("node_{}", id)));
        let log = SegmentedReplicatedLog::open(config, &logger)?;
        let store = FileSnapshotStore::open(&config.dir, &logger)?;

        let mut context = NodeContext::new(id, peers);
        context.current_term = log.last_term().max(1);

        let (capture_tx, captures) = mpsc::channel(config.capture_channel_size.max(1));
        let (outbox, install_rx) = mpsc::channel(INSTALL_CHANNEL_SIZE);
        let manager = SnapshotManager::new(log, context, capture_tx, config, &logger);

        let mut node = Node {
            manager,
            captures,
            store,
            behavior: LocalBehavior {
                id: id.to_string(),
                replicated_to_all_index: -1,
                outbox,
            },
            state_machine,
            commit_index: -1,
            applied_since_snapshot: 0,
            snapshot_batch_count: config.snapshot_batch_count.max(1),
            size_threshold: config.snapshot_size_threshold,
            capture_threshold: config
                .snapshot_size_threshold
                .saturating_mul(u64::from(config.snapshot_data_threshold_percentage))
                / 100,
            logger,
        };
        node.recover()?;
        Ok((node, install_rx))
    }

    /// Restores the state machine from the newest snapshot. Without
    /// followers every retained entry is already committed and is replayed.
    pub fn recover(&mut self) -> Result<()> {
        let boundary = self.manager.log().snapshot_index();
        // Nothing before the first retained entry can still be applied.
        let first_retained = self.manager.log().journal().first_index() as i64;
        let mut last_applied = boundary.max(first_retained - 1);

        if let Some(snapshot) = self.store.load_latest()? {
            self.state_machine.on_snapshot(
                snapshot.last_applied_index.max(0) as u64,
                snapshot.last_applied_term.max(0) as u64,
                &snapshot.state,
            );
            let restored = snapshot.last_applied_index;
            last_applied = restored;
            // Entries compacted away after the snapshot was taken only
            // survive inside it.
            for entry in snapshot
                .unapplied_entries
                .iter()
                .filter(|e| e.index as i64 > restored && e.index as i64 <= boundary)
            {
                self.state_machine.apply(entry.index, &entry.payload);
                last_applied = entry.index as i64;
            }
            info!(self.logger, "restored snapshot";
                "last_index" => snapshot.last_index,
                "last_applied_index" => last_applied);
        } else if boundary > -1 {
            warn!(self.logger, "log was compacted but no snapshot is stored"; "boundary" => boundary);
        }

        if last_applied < boundary {
            warn!(self.logger, "snapshot is behind the log boundary";
                "applied" => last_applied, "boundary" => boundary);
            last_applied = boundary;
        }
        self.manager.context_mut().last_applied = last_applied;
        self.commit_index = last_applied;

        if !self.manager.context().has_followers() {
            let last_index = self.manager.log().last_index();
            self.apply_committed(last_index)?;
        }
        Ok(())
    }

    /// Appends `payload` at the current term and returns its index.
    pub fn propose(&mut self, payload: Vec<u8>) -> Result<u64> {
        let index = self.manager.log().journal().next_index();
        let term = self.manager.context().current_term().max(1) as u64;
        self.manager
            .log_mut()
            .append(LogEntry::new(term, index, payload))?;
        Ok(index)
    }

    /// Applies entries up to `commit_index`. Application pauses while a
    /// capture is outstanding so the captured state matches its boundary.
    pub fn apply_committed(&mut self, commit_index: i64) -> Result<usize> {
        self.commit_index = self.commit_index.max(commit_index);
        if self.manager.is_capturing() {
            return Ok(0);
        }

        let target = self.commit_index.min(self.manager.log().last_index());
        let mut applied = 0;
        while self.manager.context().last_applied() < target {
            let next = self.manager.context().last_applied() + 1;
            let boundary = self.manager.log().snapshot_index();
            if next <= boundary {
                self.manager.context_mut().last_applied = boundary;
                continue;
            }
            let entry = match self.manager.log().get(next) {
                Some(entry) => entry,
                None => {
                    let journal = self.manager.log().journal();
                    return Err(Error::IndexOutOfRange {
                        index: next.max(0) as u64,
                        first: journal.first_index(),
                        last: journal.last_index(),
                    });
                }
            };
            self.state_machine.apply(entry.index, &entry.payload);
            self.manager.context_mut().last_applied = next;
            applied += 1;
        }

        if applied > 0 {
            self.applied_since_snapshot += applied as u64;
            if !self.manager.context().has_followers() {
                let last_applied = self.manager.context().last_applied();
                self.behavior.set_replicated_to_all_index(last_applied);
            }
            self.maybe_capture()?;
        }
        Ok(applied)
    }

    /// Requests a capture once enough entries were applied or the log
    /// outgrew its share of the size budget.
    pub fn maybe_capture(&mut self) -> Result<bool> {
        if self.manager.is_capturing() {
            return Ok(false);
        }
        let log = self.manager.log();
        if self.applied_since_snapshot < self.snapshot_batch_count
            && log.data_size() <= self.capture_threshold
        {
            return Ok(false);
        }
        let last = match log.last() {
            Some(last) => last,
            None => return Ok(false),
        };
        // Without followers the captured boundary is the tip itself.
        if !self.manager.context().has_followers()
            && self.manager.context().last_applied() != last.index as i64
        {
            return Ok(false);
        }

        let replicated_to_all = self.confirmed_point();
        self.manager.capture(Some(&last), replicated_to_all)
    }

    // A confirmed capture records the confirmed point as applied, so it is
    // only offered when the state machine sits exactly there.
    fn confirmed_point(&self) -> i64 {
        let replicated_to_all = self.behavior.replicated_to_all_index();
        if replicated_to_all == self.manager.context().last_applied() {
            replicated_to_all
        } else {
            -1
        }
    }

    /// Captures a snapshot for a lagging follower.
    pub fn install_to(&mut self, follower_id: &str) -> Result<bool> {
        let last = self.manager.log().last();
        let replicated_to_all = self.confirmed_point();
        self.manager
            .capture_to_install(last.as_ref(), replicated_to_all, follower_id)
    }

    /// Compacts the log without a new snapshot. Entries past the newest
    /// stored snapshot are kept so a restart can still rebuild the state.
    pub fn trim_log(&mut self, index: i64) -> Result<i64> {
        let covered = self
            .store
            .load_latest()?
            .map_or(-1, |snapshot| snapshot.last_applied_index);
        if index > covered {
            debug!(self.logger, "trim capped at snapshot"; "requested" => index, "covered" => covered);
        }
        self.manager.trim_log(index.min(covered), &mut self.behavior)
    }

    /// Serves one capture request: create, persist and commit. A failed
    /// persist rolls the cycle back.
    pub fn handle_capture(&mut self, capture: CaptureSnapshot) -> Result<()> {
        if self.manager.capture_snapshot() != Some(&capture) {
            debug!(self.logger, "stale capture request"; "last_index" => capture.last_index);
            return Ok(());
        }

        let state_machine = &self.state_machine;
        let mut state = Vec::new();
        self.manager.create(|| {
            state = state_machine.snapshot();
            Ok(())
        })?;

        if let Err(e) = self.manager.persist(
            &mut self.store,
            state,
            &mut self.behavior,
            self.size_threshold,
        ) {
            error!(self.logger, "failed to persist snapshot"; "error" => %e);
            self.manager.rollback()?;
            return Err(e);
        }
        let sequence_number = self.store.last_sequence_number();
        self.manager.commit(&mut self.store, sequence_number)?;
        self.applied_since_snapshot = 0;

        // resume application paused by the capture
        let commit_index = self.commit_index;
        self.apply_committed(commit_index)?;
        Ok(())
    }

    /// Handles every capture request queued so far.
    pub fn drain_captures(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(capture) = self.captures.try_recv() {
            self.handle_capture(capture)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Installs a snapshot received from the leader, replacing the log.
    pub fn on_install_snapshot(&mut self, request: &InstallSnapshotRequest) -> Result<()> {
        if self.manager.is_capturing() {
            self.manager.rollback()?;
        }
        self.manager
            .log_mut()
            .install_snapshot(request.last_included_index, request.last_included_term)?;
        self.state_machine.on_snapshot(
            request.last_included_index.max(0) as u64,
            request.last_included_term.max(0) as u64,
            &request.snapshot_bytes,
        );

        let context = self.manager.context_mut();
        context.last_applied = request.last_included_index;
        context.current_term = context.current_term.max(request.last_included_term);
        self.commit_index = request.last_included_index;
        self.applied_since_snapshot = 0;
        info!(self.logger, "installed snapshot from leader";
            "index" => request.last_included_index,
            "term" => request.last_included_term);
        Ok(())
    }

    fn handle_event(&mut self, event: NodeEvent) -> Result<()> {
        match event {
            NodeEvent::Propose(payload) => {
                let index = self.propose(payload)?;
                if !self.manager.context().has_followers() {
                    self.apply_committed(index as i64)?;
                }
            }
            NodeEvent::Commit(index) => {
                self.apply_committed(index)?;
            }
            NodeEvent::Trim(index) => {
                self.trim_log(index)?;
            }
            NodeEvent::InstallTo(follower) => {
                self.install_to(&follower)?;
            }
        }
        Ok(())
    }

    /// Main event loop. Returns once `events` is closed and every queued
    /// capture has been served.
    pub async fn run(&mut self, mut events: Receiver<NodeEvent>) -> Result<()> {
        let mut tick = time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                Some(capture) = self.captures.recv() => {
                    if let Err(e) = self.handle_capture(capture) {
                        error!(self.logger, "snapshot cycle failed"; "error" => %e);
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event) {
                            error!(self.logger, "failed to handle event"; "error" => %e);
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    self.manager.log().flush()?;
                    self.maybe_capture()?;
                }
            }
        }

        self.drain_captures()?;
        self.manager.log().flush()?;
        info!(self.logger, "node stopped"; "last_applied" => self.last_applied());
        Ok(())
    }

    pub fn last_applied(&self) -> i64 {
        self.manager.context().last_applied()
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    pub fn log(&self) -> &SegmentedReplicatedLog {
        self.manager.log()
    }

    pub fn store(&self) -> &FileSnapshotStore {
        &self.store
    }

    pub fn manager(&self) -> &SnapshotManager<SegmentedReplicatedLog, NodeContext> {
        &self.manager
    }

    pub fn behavior_mut(&mut self) -> &mut LocalBehavior {
        &mut self.behavior
    }
}
