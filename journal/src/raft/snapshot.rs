use serde_derive::{Deserialize, Serialize};
use slog::{debug, info, o, Logger};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::raft::entry::LogEntry;

const SNAPSHOT_PREFIX: &str = "snapshot_";
const SNAPSHOT_SUFFIX: &str = ".bin";

/// Point-in-time compaction boundary plus the application state frozen at
/// `last_applied_index`. Entries between the applied point and `last_index`
/// travel along so they can be replayed after an install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: i64,
    pub last_term: i64,
    pub last_applied_index: i64,
    pub last_applied_term: i64,
    pub state: Vec<u8>,
    pub unapplied_entries: Vec<LogEntry>,
}

impl Snapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Request to materialise application state for the boundary it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSnapshot {
    pub last_index: i64,
    pub last_term: i64,
    pub last_applied_index: i64,
    pub last_applied_term: i64,
    pub replicated_to_all_index: i64,
    pub replicated_to_all_term: i64,
    /// Follower the snapshot is meant for, `None` for local compaction.
    pub install_target: Option<String>,
}

impl CaptureSnapshot {
    pub fn is_install(&self) -> bool {
        self.install_target.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub target_follower_id: String,
    pub last_included_index: i64,
    pub last_included_term: i64,
    pub snapshot_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSelectionCriteria {
    pub max_sequence_nr: u64,
}

/// Durable home for snapshots and the message sequence they cover.
pub trait SnapshotStorage {
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()>;

    /// Drops persisted messages up to and including `to_sequence_nr`.
    fn delete_messages(&mut self, to_sequence_nr: u64) -> Result<()>;

    /// Removes stored snapshots matching `criteria`; returns how many.
    fn delete_snapshots(&mut self, criteria: SnapshotSelectionCriteria) -> Result<usize>;

    /// Sequence number of the most recently saved snapshot, 0 if none.
    fn last_sequence_number(&self) -> u64;
}

fn snapshot_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{}{}{}", SNAPSHOT_PREFIX, seq, SNAPSHOT_SUFFIX))
}

fn parse_snapshot_seq(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(SNAPSHOT_PREFIX)?
        .strip_suffix(SNAPSHOT_SUFFIX)?
        .parse::<u64>()
        .ok()
}

/// Stores every snapshot in its own `snapshot_<seq>.bin` file.
pub struct FileSnapshotStore {
    dir: PathBuf,
    files: BTreeMap<u64, PathBuf>,
    last_sequence_nr: u64,
    deleted_messages_to: u64,
    logger: Logger,
}

impl FileSnapshotStore {
    pub fn open<P: AsRef<Path>>(dir: P, logger: &Logger) -> Result<Self> {
        let dir = dir.as_ref().join("snapshots");
        fs::create_dir_all(&dir)?;

        let files: BTreeMap<u64, PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                parse_snapshot_seq(&path).map(|seq| (seq, path))
            })
            .collect();
        let last_sequence_nr = files.keys().next_back().copied().unwrap_or(0);

        Ok(FileSnapshotStore {
            dir,
            files,
            last_sequence_nr,
            deleted_messages_to: 0,
            logger: logger.new(o!("tag" => "snapshot_store")),
        })
    }

    /// Newest stored snapshot, if any.
    pub fn load_latest(&self) -> Result<Option<Snapshot>> {
        match self.files.values().next_back() {
            Some(path) => Ok(Some(Snapshot::from_bytes(&fs::read(path)?)?)),
            None => Ok(None),
        }
    }

    pub fn sequence_numbers(&self) -> Vec<u64> {
        self.files.keys().copied().collect()
    }

    /// Highest sequence number passed to `delete_messages`.
    pub fn deleted_messages_to(&self) -> u64 {
        self.deleted_messages_to
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SnapshotStorage for FileSnapshotStore {
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let seq = self.last_sequence_nr + 1;
        let path = snapshot_path(&self.dir, seq);
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)?;
        file.write_all(&snapshot.to_bytes()?)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;

        self.files.insert(seq, path);
        self.last_sequence_nr = seq;
        info!(self.logger, "saved snapshot";
            "seq" => seq,
            "last_index" => snapshot.last_index,
            "last_applied_index" => snapshot.last_applied_index);
        Ok(())
    }

    fn delete_messages(&mut self, to_sequence_nr: u64) -> Result<()> {
        // The segmented log reclaims entries itself on snapshot commit.
        self.deleted_messages_to = self.deleted_messages_to.max(to_sequence_nr);
        debug!(self.logger, "delete messages"; "to" => to_sequence_nr);
        Ok(())
    }

    fn delete_snapshots(&mut self, criteria: SnapshotSelectionCriteria) -> Result<usize> {
        let doomed: Vec<u64> = self
            .files
            .range(..=criteria.max_sequence_nr)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &doomed {
            if let Some(path) = self.files.remove(seq) {
                fs::remove_file(&path)?;
            }
        }
        if !doomed.is_empty() {
            info!(self.logger, "deleted snapshots";
                "max_seq" => criteria.max_sequence_nr, "count" => doomed.len());
        }
        Ok(doomed.len())
    }

    fn last_sequence_number(&self) -> u64 {
        self.last_sequence_nr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn snapshot(last_index: i64) -> Snapshot {
        Snapshot {
            last_index,
            last_term: 2,
            last_applied_index: last_index - 1,
            last_applied_term: 2,
            state: format!("state@{}", last_index).into_bytes(),
            unapplied_entries: vec![LogEntry::new(2, last_index as u64, b"tail".to_vec())],
        }
    }

    #[test]
    fn test_save_assigns_increasing_sequence_numbers() {
        let dir = tempdir().unwrap();
        let mut store = FileSnapshotStore::open(dir.path(), &logger()).unwrap();
        assert_eq!(store.last_sequence_number(), 0);
        assert!(store.load_latest().unwrap().is_none());

        store.save_snapshot(&snapshot(5)).unwrap();
        store.save_snapshot(&snapshot(9)).unwrap();

        assert_eq!(store.last_sequence_number(), 2);
        assert_eq!(store.sequence_numbers(), vec![1, 2]);
        assert_eq!(store.load_latest().unwrap().unwrap(), snapshot(9));
        assert!(store.dir().join("snapshot_2.bin").exists());
    }

    #[test]
    fn test_reopen_finds_existing_snapshots() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileSnapshotStore::open(dir.path(), &logger()).unwrap();
            for i in 1..=3 {
                store.save_snapshot(&snapshot(i * 10)).unwrap();
            }
        }

        let mut store = FileSnapshotStore::open(dir.path(), &logger()).unwrap();
        assert_eq!(store.last_sequence_number(), 3);
        assert_eq!(store.load_latest().unwrap().unwrap().last_index, 30);
        store.save_snapshot(&snapshot(40)).unwrap();
        assert_eq!(store.last_sequence_number(), 4);
    }

    #[test]
    fn test_delete_snapshots_by_sequence() {
        let dir = tempdir().unwrap();
        let mut store = FileSnapshotStore::open(dir.path(), &logger()).unwrap();
        for i in 1..=4 {
            store.save_snapshot(&snapshot(i)).unwrap();
        }

        let removed = store
            .delete_snapshots(SnapshotSelectionCriteria { max_sequence_nr: 2 })
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.sequence_numbers(), vec![3, 4]);
        assert!(!store.dir().join("snapshot_1.bin").exists());

        let removed = store
            .delete_snapshots(SnapshotSelectionCriteria { max_sequence_nr: 0 })
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_delete_messages_keeps_highest_watermark() {
        let dir = tempdir().unwrap();
        let mut store = FileSnapshotStore::open(dir.path(), &logger()).unwrap();
        store.delete_messages(10).unwrap();
        store.delete_messages(4).unwrap();
        assert_eq!(store.deleted_messages_to(), 10);
    }
}
