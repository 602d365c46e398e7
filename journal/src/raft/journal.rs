use serde_derive::Serialize;
use slog::{debug, info, o, Logger};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::ops::Bound::{Excluded, Unbounded};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::JournalConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::raft::entry::LogEntry;
use crate::raft::reader::SegmentedJournalReader;
use crate::raft::segment::Segment;

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_SUFFIX: &str = ".log";

/// Point-in-time description of one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    pub id: u64,
    pub start_index: u64,
    pub end_index: u64,
    pub size_bytes: u64,
    pub path: PathBuf,
}

impl From<&Segment> for SegmentInfo {
    fn from(segment: &Segment) -> Self {
        SegmentInfo {
            id: segment.id(),
            start_index: segment.start_index(),
            end_index: segment.end_index(),
            size_bytes: segment.size_bytes(),
            path: segment.path().to_path_buf(),
        }
    }
}

/// Ordered, gap-free collection of segments. There is always at least one
/// segment; the last one receives appends.
#[derive(Debug)]
pub(crate) struct JournalInner {
    dir: PathBuf,
    max_entries_per_segment: u64,
    max_segment_bytes: u64,
    segments: BTreeMap<u64, Segment>, // start index -> segment
    next_segment_id: u64,
    readers: HashSet<u64>,
    next_reader_id: u64,
    logger: Logger,
}

/// Shared handle to a segmented journal. Clones refer to the same segments.
#[derive(Debug, Clone)]
pub struct Journal {
    inner: Arc<RwLock<JournalInner>>,
}

fn segment_path(dir: &Path, start_index: u64) -> PathBuf {
    dir.join(format!("{}{}{}", SEGMENT_PREFIX, start_index, SEGMENT_SUFFIX))
}

fn parse_segment_start(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse::<u64>()
        .ok()
}

impl Journal {
    /// Opens the journal under `<config.dir>/journal`, loading every segment
    /// file found there. Segments must chain without gaps or overlaps.
    pub fn open(config: &JournalConfig, logger: &Logger) -> Result<Self> {
        let dir = config.dir.join("journal");
        fs::create_dir_all(&dir)?;
        let logger = logger.new(o!("tag" => "journal"));

        let mut segment_files: Vec<(u64, PathBuf)> = fs::read_dir(&dir)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if !path.is_file() {
                    return None;
                }
                parse_segment_start(&path).map(|start| (start, path))
            })
            .collect();
        segment_files.sort_by_key(|(start, _)| *start);

        let mut inner = JournalInner {
            dir,
            max_entries_per_segment: config.max_entries_per_segment.max(1),
            max_segment_bytes: config.max_segment_bytes,
            segments: BTreeMap::new(),
            next_segment_id: 1,
            readers: HashSet::new(),
            next_reader_id: 1,
            logger,
        };

        let mut expected_start: Option<u64> = None;
        for (start_index, path) in segment_files {
            let id = inner.allocate_segment_id();
            let segment = Segment::open(id, &path, &inner.logger)?;
            if segment.start_index() != start_index {
                return Err(Error::Corrupted {
                    path,
                    reason: format!(
                        "file name says start {}, header says {}",
                        start_index,
                        segment.start_index()
                    ),
                });
            }
            if let Some(expected) = expected_start {
                if expected != start_index {
                    return Err(Error::OrderingViolation {
                        expected,
                        found: start_index,
                    });
                }
            }
            expected_start = Some(segment.end_index());
            debug!(inner.logger, "loaded segment";
                "start" => segment.start_index(), "end" => segment.end_index());
            inner.segments.insert(start_index, segment);
        }

        if inner.segments.is_empty() {
            inner.create_segment(1)?;
        }

        Ok(Journal {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, JournalInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, JournalInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends the next entry, rolling over to a fresh segment when the
    /// current one is full.
    pub fn append(&self, entry: LogEntry) -> Result<()> {
        self.write().append(entry)
    }

    /// Removes every entry above `index`.
    pub fn truncate_after(&self, index: u64) -> Result<()> {
        self.write().truncate_after(index)
    }

    /// Removes whole segments whose entries all lie at or below `index`. The
    /// last segment is always kept. Returns the number of segments removed.
    pub fn compact(&self, index: u64) -> Result<usize> {
        self.write().compact(index)
    }

    /// Discards every segment and restarts the journal at `next_index`.
    pub fn reset_to(&self, next_index: u64) -> Result<()> {
        self.write().reset_to(next_index)
    }

    pub fn flush(&self) -> Result<()> {
        self.read().last_segment().sync()
    }

    pub fn first_index(&self) -> u64 {
        self.read().first_index()
    }

    /// Index of the last stored entry, `first_index() - 1` when empty.
    pub fn last_index(&self) -> u64 {
        self.read().next_index() - 1
    }

    pub fn next_index(&self) -> u64 {
        self.read().next_index()
    }

    pub fn last_term(&self) -> Option<u64> {
        self.read().last_entry().map(|e| e.term)
    }

    pub fn last_entry(&self) -> Option<LogEntry> {
        self.read().last_entry().cloned()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.read();
        inner.next_index() == inner.first_index()
    }

    pub fn get(&self, index: u64) -> Option<LogEntry> {
        self.read().get(index).cloned()
    }

    /// Up to `max` entries starting at `index`.
    pub fn entries_from(&self, index: u64, max: usize) -> Vec<LogEntry> {
        let inner = self.read();
        let mut out = Vec::new();
        let mut next = index.max(inner.first_index());
        while out.len() < max {
            match inner.get(next) {
                Some(entry) => out.push(entry.clone()),
                None => break,
            }
            next += 1;
        }
        out
    }

    /// Total payload bytes of the entries at or above `index`.
    pub fn data_size_from(&self, index: u64) -> u64 {
        self.read()
            .segments
            .values()
            .filter(|s| s.end_index() > index)
            .flat_map(|s| s.entries().iter())
            .filter(|e| e.index >= index)
            .map(|e| e.size() as u64)
            .sum()
    }

    pub fn first_segment(&self) -> SegmentInfo {
        self.read().first_segment().into()
    }

    pub fn segment_containing(&self, index: u64) -> Option<SegmentInfo> {
        self.read().segment_containing(index).map(SegmentInfo::from)
    }

    pub fn next_segment(&self, after_start: u64) -> Option<SegmentInfo> {
        self.read().next_segment(after_start).map(SegmentInfo::from)
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.read().segments.values().map(SegmentInfo::from).collect()
    }

    pub fn segment_count(&self) -> usize {
        self.read().segments.len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.read().segments.values().map(|s| s.size_bytes()).sum()
    }

    pub fn dir(&self) -> PathBuf {
        self.read().dir.clone()
    }

    /// Opens a registered reader positioned so that its next entry is `index`.
    pub fn open_reader(&self, index: u64) -> SegmentedJournalReader {
        let (id, first) = {
            let mut inner = self.write();
            let id = inner.next_reader_id;
            inner.next_reader_id += 1;
            inner.readers.insert(id);
            (id, inner.first_segment().create_reader())
        };
        let mut reader = SegmentedJournalReader::new(self.clone(), id, first);
        reader.reset_to(index);
        reader
    }

    pub(crate) fn close_reader(&self, reader_id: u64) {
        self.write().readers.remove(&reader_id);
    }

    /// Number of readers opened and not yet closed.
    pub fn reader_count(&self) -> usize {
        self.read().readers.len()
    }
}

impl JournalInner {
    fn allocate_segment_id(&mut self) -> u64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }

    fn create_segment(&mut self, start_index: u64) -> Result<()> {
        let id = self.allocate_segment_id();
        let path = segment_path(&self.dir, start_index);
        let segment = Segment::create(id, path, start_index)?;
        info!(self.logger, "created segment"; "start" => start_index, "id" => id);
        metrics::segment_event("created");
        self.segments.insert(start_index, segment);
        Ok(())
    }

    fn remove_segment(&mut self, start_index: u64) -> Result<()> {
        if let Some(segment) = self.segments.remove(&start_index) {
            info!(self.logger, "removed segment";
                "start" => segment.start_index(), "end" => segment.end_index());
            metrics::segment_event("removed");
            segment.delete()?;
        }
        Ok(())
    }

    pub(crate) fn first_segment(&self) -> &Segment {
        self.segments
            .values()
            .next()
            .expect("journal always holds at least one segment")
    }

    fn last_segment(&self) -> &Segment {
        self.segments
            .values()
            .next_back()
            .expect("journal always holds at least one segment")
    }

    fn last_segment_mut(&mut self) -> &mut Segment {
        self.segments
            .values_mut()
            .next_back()
            .expect("journal always holds at least one segment")
    }

    pub(crate) fn first_index(&self) -> u64 {
        self.first_segment().start_index()
    }

    pub(crate) fn next_index(&self) -> u64 {
        self.last_segment().end_index()
    }

    fn last_entry(&self) -> Option<&LogEntry> {
        self.segments
            .values()
            .rev()
            .find_map(|s| s.last_index().and_then(|i| s.get(i)))
    }

    fn get(&self, index: u64) -> Option<&LogEntry> {
        self.segment_containing(index).and_then(|s| s.get(index))
    }

    /// The segment whose start is the greatest one not above `index`.
    pub(crate) fn segment_containing(&self, index: u64) -> Option<&Segment> {
        self.segments.range(..=index).next_back().map(|(_, s)| s)
    }

    pub(crate) fn next_segment(&self, after_start: u64) -> Option<&Segment> {
        self.segments
            .range((Excluded(after_start), Unbounded))
            .next()
            .map(|(_, s)| s)
    }

    pub(crate) fn segment_by_id(&self, id: u64) -> Option<&Segment> {
        self.segments.values().find(|s| s.id() == id)
    }

    /// A segment is open while the journal still holds it.
    pub(crate) fn is_segment_open(&self, id: u64) -> bool {
        self.segment_by_id(id).map_or(false, Segment::is_open)
    }

    fn is_full(&self, segment: &Segment) -> bool {
        !segment.is_empty()
            && (segment.len() as u64 >= self.max_entries_per_segment
                || segment.size_bytes() >= self.max_segment_bytes)
    }

    fn append(&mut self, entry: LogEntry) -> Result<()> {
        let next_index = self.next_index();
        if entry.index != next_index {
            return Err(Error::OrderingViolation {
                expected: next_index,
                found: entry.index,
            });
        }
        if let Some(last) = self.last_entry() {
            if entry.term < last.term {
                return Err(Error::TermRegression {
                    index: entry.index,
                    term: entry.term,
                    last_term: last.term,
                });
            }
        }

        if self.is_full(self.last_segment()) {
            self.create_segment(next_index)?;
        }
        self.last_segment_mut().append(entry)?;
        metrics::JOURNAL_APPEND_COUNTER.inc();
        Ok(())
    }

    fn truncate_after(&mut self, index: u64) -> Result<()> {
        let first_index = self.first_index();
        if index.saturating_add(1) < first_index {
            return Err(Error::IndexOutOfRange {
                index,
                first: first_index,
                last: self.next_index() - 1,
            });
        }

        let doomed: Vec<u64> = self
            .segments
            .keys()
            .copied()
            .filter(|&start| start > index && start != first_index)
            .collect();
        for start in doomed {
            self.remove_segment(start)?;
        }
        self.last_segment_mut().truncate_after(index)?;
        debug!(self.logger, "truncated journal"; "last" => index);
        Ok(())
    }

    fn compact(&mut self, index: u64) -> Result<usize> {
        let last_start = self.last_segment().start_index();
        let doomed: Vec<u64> = self
            .segments
            .values()
            .filter(|s| s.start_index() != last_start && s.end_index() <= index.saturating_add(1))
            .map(Segment::start_index)
            .collect();
        for start in &doomed {
            self.remove_segment(*start)?;
        }
        if !doomed.is_empty() {
            info!(self.logger, "compacted journal";
                "index" => index, "removed" => doomed.len(), "first" => self.first_index());
        }
        Ok(doomed.len())
    }

    fn reset_to(&mut self, next_index: u64) -> Result<()> {
        let starts: Vec<u64> = self.segments.keys().copied().collect();
        for start in starts {
            self.remove_segment(start)?;
        }
        self.create_segment(next_index.max(1))
    }
}
