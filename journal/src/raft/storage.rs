use serde_derive::{Deserialize, Serialize};
use slog::{debug, info, o, Logger};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::JournalConfig;
use crate::error::{Error, Result};
use crate::raft::entry::LogEntry;
use crate::raft::journal::Journal;
use crate::raft::reader::SegmentedJournalReader;

/// The logical log seen by consensus code.
///
/// Indices and terms are signed at this interface: `-1` stands for "no
/// such index/term", e.g. the snapshot boundary of a log that was never
/// compacted. Entries at or below `snapshot_index()` are not retained.
pub trait ReplicatedLog {
    /// Entry at `index`, unless it is missing or covered by the snapshot.
    fn get(&self, index: i64) -> Option<LogEntry>;

    /// All retained entries from `index` to the tip.
    fn get_from(&self, index: i64) -> Vec<LogEntry>;

    fn is_present(&self, index: i64) -> bool {
        self.get(index).is_some()
    }

    fn is_in_snapshot(&self, index: i64) -> bool {
        index >= 0 && index <= self.snapshot_index()
    }

    /// The tip entry, if any entry is retained.
    fn last(&self) -> Option<LogEntry>;

    fn last_index(&self) -> i64;

    fn last_term(&self) -> i64;

    /// Number of retained entries.
    fn size(&self) -> usize;

    /// Payload bytes held by the retained entries.
    fn data_size(&self) -> u64;

    fn snapshot_index(&self) -> i64;

    fn snapshot_term(&self) -> i64;

    /// Tentatively moves the compaction boundary to `index`. Storage is not
    /// reclaimed until [`ReplicatedLog::snapshot_commit`].
    fn snapshot_pre_commit(&mut self, index: i64, term: i64) -> Result<()>;

    /// Makes the pending pre-commit permanent. No-op when none is pending.
    fn snapshot_commit(&mut self) -> Result<()>;

    /// Restores the boundary in place before the pending pre-commit. No-op
    /// when none is pending.
    fn snapshot_rollback(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SnapshotMeta {
    snapshot_index: i64,
    snapshot_term: i64,
}

/// [`ReplicatedLog`] backed by a segmented [`Journal`].
///
/// The committed compaction boundary is kept in `snapshot.meta` next to
/// the journal directory so it survives a restart.
pub struct SegmentedReplicatedLog {
    journal: Journal,
    meta_path: PathBuf,
    snapshot_index: i64,
    snapshot_term: i64,
    // Boundary to restore on rollback while a pre-commit is outstanding.
    pending: Option<SnapshotMeta>,
    data_size: u64,
    logger: Logger,
}

impl SegmentedReplicatedLog {
    pub fn open(config: &JournalConfig, logger: &Logger) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let logger = logger.new(o!("tag" => "replicated_log"));
        let journal = Journal::open(config, &logger)?;
        let meta_path = config.dir.join("snapshot.meta");
        let meta = Self::load_meta(&meta_path)?.unwrap_or(SnapshotMeta {
            snapshot_index: -1,
            snapshot_term: -1,
        });

        let first_retained = (meta.snapshot_index + 1).max(1) as u64;
        if journal.is_empty() {
            if journal.first_index() != first_retained {
                journal.reset_to(first_retained)?;
            }
        } else if journal.first_index() > first_retained {
            return Err(Error::OrderingViolation {
                expected: first_retained,
                found: journal.first_index(),
            });
        }

        let mut log = SegmentedReplicatedLog {
            journal,
            meta_path,
            snapshot_index: meta.snapshot_index,
            snapshot_term: meta.snapshot_term,
            pending: None,
            data_size: 0,
            logger,
        };
        log.recalculate_data_size();
        info!(log.logger, "opened replicated log";
            "snapshot_index" => log.snapshot_index,
            "snapshot_term" => log.snapshot_term,
            "last_index" => log.last_index());
        Ok(log)
    }

    fn load_meta(path: &Path) -> Result<Option<SnapshotMeta>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    // atomic write: write to temp file then rename
    fn save_meta(&self) -> Result<()> {
        let meta = SnapshotMeta {
            snapshot_index: self.snapshot_index,
            snapshot_term: self.snapshot_term,
        };
        let bytes = bincode::serialize(&meta)?;
        let temp_path = self.meta_path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.meta_path)?;
        Ok(())
    }

    fn first_visible(&self) -> u64 {
        ((self.snapshot_index + 1).max(0) as u64).max(self.journal.first_index())
    }

    fn recalculate_data_size(&mut self) {
        self.data_size = self.journal.data_size_from(self.first_visible());
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Appends the next entry. Its index must follow the tip and its term
    /// must not go backwards.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        // The journal's next index already sits past the compaction boundary.
        let expected = self.journal.next_index();
        if entry.index != expected {
            return Err(Error::OrderingViolation {
                expected,
                found: entry.index,
            });
        }
        if (entry.term as i64) < self.last_term() {
            return Err(Error::TermRegression {
                index: entry.index,
                term: entry.term,
                last_term: self.last_term().max(0) as u64,
            });
        }
        let size = entry.size() as u64;
        self.journal.append(entry)?;
        self.data_size += size;
        Ok(())
    }

    pub fn append_all(&mut self, entries: impl IntoIterator<Item = LogEntry>) -> Result<()> {
        for entry in entries {
            self.append(entry)?;
        }
        Ok(())
    }

    /// Drops `index` and everything after it, for replacing a conflicting
    /// suffix. Returns the index removed from, or -1 when `index` is not a
    /// retained entry.
    pub fn remove_from(&mut self, index: i64) -> Result<i64> {
        if !self.is_present(index) {
            return Ok(-1);
        }
        self.journal.truncate_after(index as u64 - 1)?;
        self.recalculate_data_size();
        debug!(self.logger, "removed conflicting suffix"; "from" => index);
        Ok(index)
    }

    /// Replaces the whole log with a snapshot boundary received from a
    /// leader. The next append must be `index + 1`.
    pub fn install_snapshot(&mut self, index: i64, term: i64) -> Result<()> {
        if let Some(pending) = self.pending {
            return Err(Error::PreCommitPending {
                index: pending.snapshot_index,
            });
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.save_meta()?;
        self.journal.reset_to((index + 1).max(1) as u64)?;
        self.data_size = 0;
        info!(self.logger, "installed snapshot boundary"; "index" => index, "term" => term);
        Ok(())
    }

    /// Opens a journal reader positioned at `index`.
    pub fn open_reader(&self, index: u64) -> SegmentedJournalReader {
        self.journal.open_reader(index)
    }

    pub fn is_pre_commit_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn flush(&self) -> Result<()> {
        self.journal.flush()
    }
}

impl ReplicatedLog for SegmentedReplicatedLog {
    fn get(&self, index: i64) -> Option<LogEntry> {
        if index < 0 || index <= self.snapshot_index {
            return None;
        }
        self.journal.get(index as u64)
    }

    fn get_from(&self, index: i64) -> Vec<LogEntry> {
        let start = (index.max(0) as u64).max(self.first_visible());
        self.journal.entries_from(start, usize::MAX)
    }

    fn last(&self) -> Option<LogEntry> {
        self.journal
            .last_entry()
            .filter(|e| e.index as i64 > self.snapshot_index)
    }

    fn last_index(&self) -> i64 {
        self.last().map_or(self.snapshot_index, |e| e.index as i64)
    }

    fn last_term(&self) -> i64 {
        self.last().map_or(self.snapshot_term, |e| e.term as i64)
    }

    fn size(&self) -> usize {
        self.journal.next_index().saturating_sub(self.first_visible()) as usize
    }

    fn data_size(&self) -> u64 {
        self.data_size
    }

    fn snapshot_index(&self) -> i64 {
        self.snapshot_index
    }

    fn snapshot_term(&self) -> i64 {
        self.snapshot_term
    }

    fn snapshot_pre_commit(&mut self, index: i64, term: i64) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::PreCommitPending {
                index: self.snapshot_index,
            });
        }
        if index < self.snapshot_index {
            return Err(Error::CompactionBelowBoundary {
                index,
                snapshot_index: self.snapshot_index,
            });
        }
        let last_index = self.last_index();
        if index > last_index {
            return Err(Error::BeyondTip { index, last_index });
        }
        if let Some(entry) = self.get(index) {
            if entry.term as i64 != term {
                return Err(Error::TermMismatch {
                    index,
                    expected: entry.term,
                    found: term,
                });
            }
        }

        self.pending = Some(SnapshotMeta {
            snapshot_index: self.snapshot_index,
            snapshot_term: self.snapshot_term,
        });
        self.snapshot_index = index;
        self.snapshot_term = term;
        debug!(self.logger, "snapshot pre-commit"; "index" => index, "term" => term);
        Ok(())
    }

    fn snapshot_commit(&mut self) -> Result<()> {
        if self.pending.take().is_none() {
            debug!(self.logger, "snapshot commit without pending pre-commit");
            return Ok(());
        }
        self.save_meta()?;
        if self.snapshot_index >= 0 {
            self.journal.compact(self.snapshot_index as u64)?;
        }
        self.recalculate_data_size();
        info!(self.logger, "snapshot committed";
            "snapshot_index" => self.snapshot_index,
            "snapshot_term" => self.snapshot_term,
            "size" => self.size(),
            "data_size" => self.data_size);
        Ok(())
    }

    fn snapshot_rollback(&mut self) -> Result<()> {
        let previous = match self.pending.take() {
            Some(previous) => previous,
            None => {
                debug!(self.logger, "snapshot rollback without pending pre-commit");
                return Ok(());
            }
        };
        self.snapshot_index = previous.snapshot_index;
        self.snapshot_term = previous.snapshot_term;
        self.recalculate_data_size();
        info!(self.logger, "snapshot rolled back";
            "snapshot_index" => self.snapshot_index,
            "snapshot_term" => self.snapshot_term);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn config(dir: &Path) -> JournalConfig {
        JournalConfig {
            max_entries_per_segment: 4,
            ..JournalConfig::with_dir(dir)
        }
    }

    fn open_with(dir: &Path, last: u64) -> SegmentedReplicatedLog {
        let mut log = SegmentedReplicatedLog::open(&config(dir), &logger()).unwrap();
        for i in 1..=last {
            log.append(LogEntry::new(1 + i / 5, i, vec![0u8; 10])).unwrap();
        }
        log
    }

    #[test]
    fn test_fresh_log_has_no_boundary() {
        let dir = tempdir().unwrap();
        let log = open_with(dir.path(), 0);

        assert_eq!(log.snapshot_index(), -1);
        assert_eq!(log.snapshot_term(), -1);
        assert_eq!(log.last_index(), -1);
        assert_eq!(log.last_term(), -1);
        assert_eq!(log.size(), 0);
        assert!(log.last().is_none());
        assert!(!log.is_in_snapshot(0));
    }

    #[test]
    fn test_fresh_log_accepts_index_one() {
        let dir = tempdir().unwrap();
        let mut log = open_with(dir.path(), 0);

        assert!(matches!(
            log.append(LogEntry::new(1, 0, vec![])),
            Err(Error::OrderingViolation { expected: 1, found: 0 })
        ));
        log.append(LogEntry::new(1, 1, b"first".to_vec())).unwrap();
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.get(1).unwrap().payload, b"first");
        assert!(matches!(
            log.append(LogEntry::new(1, 3, vec![])),
            Err(Error::OrderingViolation { expected: 2, found: 3 })
        ));
    }

    #[test]
    fn test_append_accounts_data_size() {
        let dir = tempdir().unwrap();
        let mut log = open_with(dir.path(), 6);

        assert_eq!(log.size(), 6);
        assert_eq!(log.data_size(), 60);
        assert_eq!(log.last_index(), 6);
        assert_eq!(log.get(5).unwrap().term, 2);
        assert_eq!(log.get_from(4).len(), 3);

        let err = log.append(LogEntry::new(2, 9, vec![])).unwrap_err();
        assert!(err.is_ordering_violation());
        let err = log.append(LogEntry::new(1, 7, vec![])).unwrap_err();
        assert!(matches!(err, Error::TermRegression { index: 7, .. }));
    }

    #[test]
    fn test_pre_commit_hides_entries_until_rollback() {
        let dir = tempdir().unwrap();
        let mut log = open_with(dir.path(), 10);

        log.snapshot_pre_commit(6, 2).unwrap();
        assert_eq!(log.snapshot_index(), 6);
        assert!(log.get(6).is_none());
        assert!(!log.is_present(3));
        assert!(log.is_in_snapshot(3));
        assert_eq!(log.get_from(0).first().unwrap().index, 7);
        assert_eq!(log.size(), 4);

        // a second pre-commit must wait
        assert!(matches!(
            log.snapshot_pre_commit(8, 2),
            Err(Error::PreCommitPending { .. })
        ));

        log.snapshot_rollback().unwrap();
        assert_eq!(log.snapshot_index(), -1);
        assert_eq!(log.get(3).unwrap().index, 3);
        assert_eq!(log.size(), 10);
        assert_eq!(log.data_size(), 100);

        // rollback and commit without pending pre-commit are no-ops
        log.snapshot_rollback().unwrap();
        log.snapshot_commit().unwrap();
        assert_eq!(log.snapshot_index(), -1);
    }

    #[test]
    fn test_commit_reclaims_segments_and_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut log = open_with(dir.path(), 10);
            log.snapshot_pre_commit(8, 2).unwrap();
            log.snapshot_commit().unwrap();

            assert_eq!(log.journal().first_index(), 9);
            assert_eq!(log.size(), 2);
            assert_eq!(log.data_size(), 20);
            assert!(log.get(8).is_none());
            assert_eq!(log.get(9).unwrap().index, 9);
        }

        let log = SegmentedReplicatedLog::open(&config(dir.path()), &logger()).unwrap();
        assert_eq!(log.snapshot_index(), 8);
        assert_eq!(log.snapshot_term(), 2);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.size(), 2);
    }

    #[test]
    fn test_pre_commit_guards_ordering() {
        let dir = tempdir().unwrap();
        let mut log = open_with(dir.path(), 6);

        assert!(matches!(
            log.snapshot_pre_commit(7, 2),
            Err(Error::BeyondTip { index: 7, last_index: 6 })
        ));
        assert!(matches!(
            log.snapshot_pre_commit(5, 1),
            Err(Error::TermMismatch { index: 5, expected: 2, found: 1 })
        ));

        log.snapshot_pre_commit(4, 1).unwrap();
        log.snapshot_commit().unwrap();
        assert!(matches!(
            log.snapshot_pre_commit(3, 1),
            Err(Error::CompactionBelowBoundary { index: 3, snapshot_index: 4 })
        ));
        // re-committing the current boundary is allowed
        log.snapshot_pre_commit(4, 1).unwrap();
        log.snapshot_commit().unwrap();
    }

    #[test]
    fn test_whole_log_compaction_keeps_appending() {
        let dir = tempdir().unwrap();
        let mut log = open_with(dir.path(), 6);
        log.snapshot_pre_commit(6, 2).unwrap();
        log.snapshot_commit().unwrap();

        assert_eq!(log.size(), 0);
        assert_eq!(log.last_index(), 6);
        assert_eq!(log.last_term(), 2);
        assert!(log.last().is_none());

        log.append(LogEntry::new(3, 7, b"next".to_vec())).unwrap();
        assert_eq!(log.get(7).unwrap().payload, b"next");
    }

    #[test]
    fn test_remove_from_and_install_snapshot() {
        let dir = tempdir().unwrap();
        let mut log = open_with(dir.path(), 10);

        assert_eq!(log.remove_from(7).unwrap(), 7);
        assert_eq!(log.last_index(), 6);
        assert_eq!(log.data_size(), 60);
        assert_eq!(log.remove_from(42).unwrap(), -1);

        log.install_snapshot(20, 4).unwrap();
        assert_eq!(log.snapshot_index(), 20);
        assert_eq!(log.last_index(), 20);
        assert_eq!(log.size(), 0);
        log.append(LogEntry::new(4, 21, vec![1])).unwrap();
        drop(log);

        let log = SegmentedReplicatedLog::open(&config(dir.path()), &logger()).unwrap();
        assert_eq!(log.snapshot_index(), 20);
        assert_eq!(log.last_index(), 21);
    }
}
