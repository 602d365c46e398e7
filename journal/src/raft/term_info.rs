//! Resolution of the (index, term) pair a snapshot records for a boundary.

use crate::raft::entry::LogEntry;
use crate::raft::storage::ReplicatedLog;

pub trait TermInformationReader {
    /// Resolved index, -1 when unresolvable.
    fn index(&self) -> i64;

    /// Resolved term, -1 when unresolvable.
    fn term(&self) -> i64;
}

/// Resolves the last-applied boundary.
///
/// Without followers the captured tip is used directly. Otherwise the
/// entry at the reported last-applied index is looked up, falling back to
/// the log's compaction boundary when that entry is already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastAppliedTermInformationReader {
    index: i64,
    term: i64,
}

impl LastAppliedTermInformationReader {
    pub fn init<L: ReplicatedLog + ?Sized>(
        log: &L,
        original_index: i64,
        last_log_entry: Option<&LogEntry>,
        has_followers: bool,
    ) -> Self {
        let (index, term) = if !has_followers {
            last_log_entry.map_or((-1, -1), |e| (e.index as i64, e.term as i64))
        } else if let Some(entry) = log.get(original_index) {
            (entry.index as i64, entry.term as i64)
        } else if log.snapshot_index() > -1 {
            (log.snapshot_index(), log.snapshot_term())
        } else {
            (-1, -1)
        };
        LastAppliedTermInformationReader { index, term }
    }
}

impl TermInformationReader for LastAppliedTermInformationReader {
    fn index(&self) -> i64 {
        self.index
    }

    fn term(&self) -> i64 {
        self.term
    }
}

/// Resolves the replicated-to-all boundary from the retained log only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicatedToAllTermInformationReader {
    index: i64,
    term: i64,
}

impl ReplicatedToAllTermInformationReader {
    pub fn init<L: ReplicatedLog + ?Sized>(log: &L, original_index: i64) -> Self {
        let (index, term) = log
            .get(original_index)
            .map_or((-1, -1), |e| (e.index as i64, e.term as i64));
        ReplicatedToAllTermInformationReader { index, term }
    }
}

impl TermInformationReader for ReplicatedToAllTermInformationReader {
    fn index(&self) -> i64 {
        self.index
    }

    fn term(&self) -> i64 {
        self.term
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    /// Just enough of a log for boundary resolution.
    struct FixedLog {
        entries: Vec<LogEntry>,
        snapshot_index: i64,
        snapshot_term: i64,
    }

    impl ReplicatedLog for FixedLog {
        fn get(&self, index: i64) -> Option<LogEntry> {
            self.entries
                .iter()
                .find(|e| e.index as i64 == index && index > self.snapshot_index)
                .cloned()
        }
        fn get_from(&self, index: i64) -> Vec<LogEntry> {
            self.entries
                .iter()
                .filter(|e| e.index as i64 >= index)
                .cloned()
                .collect()
        }
        fn last(&self) -> Option<LogEntry> {
            self.entries.last().cloned()
        }
        fn last_index(&self) -> i64 {
            self.last().map_or(self.snapshot_index, |e| e.index as i64)
        }
        fn last_term(&self) -> i64 {
            self.last().map_or(self.snapshot_term, |e| e.term as i64)
        }
        fn size(&self) -> usize {
            self.entries.len()
        }
        fn data_size(&self) -> u64 {
            0
        }
        fn snapshot_index(&self) -> i64 {
            self.snapshot_index
        }
        fn snapshot_term(&self) -> i64 {
            self.snapshot_term
        }
        fn snapshot_pre_commit(&mut self, _index: i64, _term: i64) -> Result<()> {
            Ok(())
        }
        fn snapshot_commit(&mut self) -> Result<()> {
            Ok(())
        }
        fn snapshot_rollback(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn log(snapshot_index: i64, snapshot_term: i64) -> FixedLog {
        FixedLog {
            entries: vec![LogEntry::new(2, 8, vec![]), LogEntry::new(3, 9, vec![])],
            snapshot_index,
            snapshot_term,
        }
    }

    #[test]
    fn test_last_applied_without_followers_uses_tip() {
        let tip = LogEntry::new(3, 9, vec![]);
        let reader = LastAppliedTermInformationReader::init(&log(-1, -1), 8, Some(&tip), false);
        assert_eq!((reader.index(), reader.term()), (9, 3));

        let reader = LastAppliedTermInformationReader::init(&log(-1, -1), 8, None, false);
        assert_eq!((reader.index(), reader.term()), (-1, -1));
    }

    #[test]
    fn test_last_applied_with_followers_reads_log() {
        let tip = LogEntry::new(3, 9, vec![]);
        let reader = LastAppliedTermInformationReader::init(&log(-1, -1), 8, Some(&tip), true);
        assert_eq!((reader.index(), reader.term()), (8, 2));
    }

    #[test]
    fn test_last_applied_falls_back_to_snapshot_boundary() {
        let tip = LogEntry::new(3, 9, vec![]);
        let reader = LastAppliedTermInformationReader::init(&log(7, 1), 5, Some(&tip), true);
        assert_eq!((reader.index(), reader.term()), (7, 1));

        let reader = LastAppliedTermInformationReader::init(&log(-1, -1), 5, Some(&tip), true);
        assert_eq!((reader.index(), reader.term()), (-1, -1));
    }

    #[test]
    fn test_replicated_to_all_resolution() {
        let reader = ReplicatedToAllTermInformationReader::init(&log(-1, -1), 9);
        assert_eq!((reader.index(), reader.term()), (9, 3));

        let reader = ReplicatedToAllTermInformationReader::init(&log(-1, -1), -1);
        assert_eq!((reader.index(), reader.term()), (-1, -1));

        let reader = ReplicatedToAllTermInformationReader::init(&log(8, 2), 8);
        assert_eq!((reader.index(), reader.term()), (-1, -1));
    }
}
