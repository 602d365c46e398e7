//! Snapshot lifecycle for one replicated log.
//!
//! A compaction runs `capture -> create -> persist -> commit`, with
//! `rollback` undoing a persisted but uncommitted cycle. The manager posts a
//! [`CaptureSnapshot`] request and is later driven by whoever answers it;
//! every call outside its phase is a logged no-op so a retrying driver can
//! never corrupt the cycle.

use slog::{debug, info, o, warn, Logger};
use std::mem;
use tokio::sync::mpsc::Sender;

use crate::config::JournalConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::raft::entry::LogEntry;
use crate::raft::snapshot::{
    CaptureSnapshot, InstallSnapshotRequest, Snapshot, SnapshotSelectionCriteria, SnapshotStorage,
};
use crate::raft::storage::ReplicatedLog;
use crate::raft::term_info::{
    LastAppliedTermInformationReader, ReplicatedToAllTermInformationReader, TermInformationReader,
};
use crate::raft::{RaftBehavior, RaftContext};

#[derive(Debug, Clone, PartialEq, Eq)]
enum SnapshotState {
    Idle,
    Capturing(CaptureSnapshot),
    Created(CaptureSnapshot),
    Persisted(CaptureSnapshot),
}

impl SnapshotState {
    fn name(&self) -> &'static str {
        match self {
            SnapshotState::Idle => "idle",
            SnapshotState::Capturing(_) => "capturing",
            SnapshotState::Created(_) => "created",
            SnapshotState::Persisted(_) => "persisted",
        }
    }
}

pub struct SnapshotManager<L, C> {
    log: L,
    context: C,
    capture_tx: Sender<CaptureSnapshot>,
    snapshot_batch_count: u64,
    data_threshold_percentage: u8,
    state: SnapshotState,
    logger: Logger,
}

impl<L: ReplicatedLog, C: RaftContext> SnapshotManager<L, C> {
    pub fn new(
        log: L,
        context: C,
        capture_tx: Sender<CaptureSnapshot>,
        config: &JournalConfig,
        logger: &Logger,
    ) -> Self {
        let logger = logger.new(o!("tag" => format!("snapshot_manager_{}", context.id())));
        SnapshotManager {
            log,
            context,
            capture_tx,
            snapshot_batch_count: config.snapshot_batch_count,
            data_threshold_percentage: config.snapshot_data_threshold_percentage,
            state: SnapshotState::Idle,
            logger,
        }
    }

    /// True from `capture` until the cycle is committed or rolled back.
    pub fn is_capturing(&self) -> bool {
        self.state != SnapshotState::Idle
    }

    /// The boundary of the cycle in flight.
    pub fn capture_snapshot(&self) -> Option<&CaptureSnapshot> {
        match &self.state {
            SnapshotState::Idle => None,
            SnapshotState::Capturing(capture)
            | SnapshotState::Created(capture)
            | SnapshotState::Persisted(capture) => Some(capture),
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut L {
        &mut self.log
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Starts a local compaction cycle. Returns false while another cycle
    /// is in flight.
    pub fn capture(
        &mut self,
        last_log_entry: Option<&LogEntry>,
        replicated_to_all_index: i64,
    ) -> Result<bool> {
        self.start_capture(last_log_entry, replicated_to_all_index, None)
    }

    /// Like [`SnapshotManager::capture`], but the persisted snapshot is also
    /// sent to `target_follower_id`.
    pub fn capture_to_install(
        &mut self,
        last_log_entry: Option<&LogEntry>,
        replicated_to_all_index: i64,
        target_follower_id: &str,
    ) -> Result<bool> {
        self.start_capture(
            last_log_entry,
            replicated_to_all_index,
            Some(target_follower_id.to_string()),
        )
    }

    fn start_capture(
        &mut self,
        last_log_entry: Option<&LogEntry>,
        replicated_to_all_index: i64,
        install_target: Option<String>,
    ) -> Result<bool> {
        if self.is_capturing() {
            debug!(self.logger, "capture ignored"; "state" => self.state.name());
            return Ok(false);
        }

        let last_applied = LastAppliedTermInformationReader::init(
            &self.log,
            self.context.last_applied(),
            last_log_entry,
            self.context.has_followers(),
        );
        let replicated_to_all =
            ReplicatedToAllTermInformationReader::init(&self.log, replicated_to_all_index);
        let (last_index, last_term) =
            last_log_entry.map_or((-1, -1), |e| (e.index as i64, e.term as i64));

        let capture = CaptureSnapshot {
            last_index,
            last_term,
            last_applied_index: last_applied.index(),
            last_applied_term: last_applied.term(),
            replicated_to_all_index: replicated_to_all.index(),
            replicated_to_all_term: replicated_to_all.term(),
            install_target,
        };

        self.capture_tx
            .try_send(capture.clone())
            .map_err(|e| Error::Dispatch(e.to_string()))?;

        info!(self.logger, "capturing snapshot";
            "last_index" => capture.last_index,
            "last_term" => capture.last_term,
            "last_applied_index" => capture.last_applied_index,
            "replicated_to_all_index" => capture.replicated_to_all_index,
            "install_target" => capture.install_target.as_deref().unwrap_or("-"));
        metrics::snapshot_event("captured");
        self.state = SnapshotState::Capturing(capture);
        Ok(true)
    }

    /// Signals that the capture request is being served. `on_ready` runs at
    /// most once per cycle; if it fails the cycle stays in the capturing
    /// phase.
    pub fn create<F>(&mut self, on_ready: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let capture = match &self.state {
            SnapshotState::Capturing(capture) => capture.clone(),
            state => {
                debug!(self.logger, "create ignored"; "state" => state.name());
                return Ok(());
            }
        };

        if let Err(e) = on_ready() {
            warn!(self.logger, "snapshot create callback failed"; "error" => %e);
            return Err(e);
        }
        metrics::snapshot_event("created");
        self.state = SnapshotState::Created(capture);
        Ok(())
    }

    /// Writes the snapshot for the created cycle and pre-commits the log
    /// compaction.
    pub fn persist<S, B>(
        &mut self,
        storage: &mut S,
        state: Vec<u8>,
        behavior: &mut B,
        size_threshold: u64,
    ) -> Result<()>
    where
        S: SnapshotStorage + ?Sized,
        B: RaftBehavior + ?Sized,
    {
        let capture = match &self.state {
            SnapshotState::Created(capture) => capture.clone(),
            state => {
                debug!(self.logger, "persist ignored"; "state" => state.name());
                return Ok(());
            }
        };

        let confirmed = capture.replicated_to_all_index != -1;
        let (applied_index, applied_term) = if confirmed {
            (capture.replicated_to_all_index, capture.replicated_to_all_term)
        } else {
            (capture.last_applied_index, capture.last_applied_term)
        };
        // A confirmed point is fully reflected in the state, nothing to replay.
        let unapplied_entries: Vec<LogEntry> = if confirmed {
            Vec::new()
        } else {
            self.log
                .get_from(applied_index + 1)
                .into_iter()
                .filter(|e| e.index as i64 <= capture.last_index)
                .collect()
        };

        let snapshot = Snapshot {
            last_index: capture.last_index,
            last_term: capture.last_term,
            last_applied_index: applied_index,
            last_applied_term: applied_term,
            state,
            unapplied_entries,
        };
        storage.save_snapshot(&snapshot)?;

        let threshold =
            size_threshold.saturating_mul(u64::from(self.data_threshold_percentage)) / 100;
        let is_leader = behavior.leader_id().as_deref() == Some(self.context.id());
        let (boundary_index, boundary_term) = if is_leader && self.log.data_size() > threshold {
            // Memory pressure: compact to what has been applied.
            (capture.last_applied_index, capture.last_applied_term)
        } else if confirmed {
            (capture.replicated_to_all_index, capture.replicated_to_all_term)
        } else {
            (self.log.snapshot_index(), self.log.snapshot_term())
        };
        self.log.snapshot_pre_commit(boundary_index, boundary_term)?;
        if confirmed {
            behavior.set_replicated_to_all_index(capture.replicated_to_all_index);
        }

        info!(self.logger, "persisted snapshot";
            "last_index" => snapshot.last_index,
            "last_applied_index" => snapshot.last_applied_index,
            "unapplied" => snapshot.unapplied_entries.len(),
            "boundary_index" => boundary_index,
            "boundary_term" => boundary_term);
        metrics::snapshot_event("persisted");
        self.state = SnapshotState::Persisted(capture.clone());

        if let Some(target) = capture.install_target {
            let request = InstallSnapshotRequest {
                target_follower_id: target,
                last_included_index: snapshot.last_applied_index,
                last_included_term: snapshot.last_applied_term,
                snapshot_bytes: snapshot.state,
            };
            behavior.handle_message(self.context.id(), request)?;
        }
        Ok(())
    }

    /// Finalises the persisted cycle and prunes storage older than the
    /// retention window.
    pub fn commit<S>(&mut self, storage: &mut S, sequence_number: u64) -> Result<()>
    where
        S: SnapshotStorage + ?Sized,
    {
        if !matches!(self.state, SnapshotState::Persisted(_)) {
            debug!(self.logger, "commit ignored"; "state" => self.state.name());
            return Ok(());
        }
        self.state = SnapshotState::Idle;

        self.log.snapshot_commit()?;
        storage.delete_messages(sequence_number)?;
        let criteria = SnapshotSelectionCriteria {
            max_sequence_nr: sequence_number.saturating_sub(self.snapshot_batch_count),
        };
        storage.delete_snapshots(criteria)?;

        info!(self.logger, "committed snapshot";
            "sequence_number" => sequence_number,
            "snapshot_index" => self.log.snapshot_index());
        metrics::snapshot_event("committed");
        Ok(())
    }

    /// Undoes a persisted cycle. An earlier cycle is abandoned without
    /// touching the log, since nothing was pre-committed yet.
    pub fn rollback(&mut self) -> Result<()> {
        match mem::replace(&mut self.state, SnapshotState::Idle) {
            SnapshotState::Idle => {
                debug!(self.logger, "rollback ignored"; "state" => "idle");
                Ok(())
            }
            SnapshotState::Persisted(_) => {
                self.log.snapshot_rollback()?;
                info!(self.logger, "rolled back snapshot";
                    "snapshot_index" => self.log.snapshot_index());
                metrics::snapshot_event("rolled_back");
                Ok(())
            }
            state => {
                info!(self.logger, "abandoned snapshot capture"; "state" => state.name());
                metrics::snapshot_event("abandoned");
                Ok(())
            }
        }
    }

    /// Compacts the log up to `trim_index` without a state snapshot.
    /// Returns the index trimmed to, or -1 when nothing was trimmed.
    pub fn trim_log<B>(&mut self, trim_index: i64, behavior: &mut B) -> Result<i64>
    where
        B: RaftBehavior + ?Sized,
    {
        if self.is_capturing() {
            debug!(self.logger, "trim ignored"; "state" => self.state.name());
            return Ok(-1);
        }

        let last_applied = self.context.last_applied();
        if last_applied <= 0 {
            debug!(self.logger, "trim ignored, nothing applied"; "last_applied" => last_applied);
            return Ok(-1);
        }

        let index = trim_index.min(last_applied);
        if let Some(entry) = self.log.get(index) {
            self.log.snapshot_pre_commit(index, entry.term as i64)?;
            self.log.snapshot_commit()?;
            info!(self.logger, "trimmed log"; "index" => index, "term" => entry.term);
            metrics::snapshot_event("trimmed");
            return Ok(index);
        }

        if index > behavior.replicated_to_all_index() {
            behavior.set_replicated_to_all_index(index);
        }
        Ok(-1)
    }
}
