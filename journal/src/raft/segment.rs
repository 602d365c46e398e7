use serde_derive::{Deserialize, Serialize};
use slog::{warn, Logger};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::raft::entry::LogEntry;

const HEADER_SIZE: u64 = 16; // 8 bytes for start_index + 8 bytes for end_index
const ENTRY_HEADER_SIZE: u64 = 8; // 8 bytes for entry size

/// One contiguous run of log entries backed by a single file.
///
/// `end_index` is exclusive: an empty segment has `start_index == end_index`.
/// Entries are cached in memory once decoded so readers never touch the file.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    file: File,
    path: PathBuf,
    start_index: u64,
    end_index: u64,
    entries: Vec<LogEntry>,
    entry_positions: Vec<u64>, // file position of each entry record
    size_bytes: u64,
    open: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    start_index: u64,
    end_index: u64,
}

impl Segment {
    /// Creates an empty segment file starting at `start_index`, replacing any
    /// stale file at the same path.
    pub fn create<P: AsRef<Path>>(id: u64, path: P, start_index: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut segment = Segment {
            id,
            file,
            path: path.as_ref().to_path_buf(),
            start_index,
            end_index: start_index,
            entries: Vec::new(),
            entry_positions: Vec::new(),
            size_bytes: HEADER_SIZE,
            open: true,
        };
        segment.write_header()?;
        Ok(segment)
    }

    /// Opens an existing segment file and decodes its entries. A torn
    /// trailing record left by a crash is cut off.
    pub fn open<P: AsRef<Path>>(id: u64, path: P, logger: &Logger) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let header = Self::read_header(&mut file, &path)?;

        let mut segment = Segment {
            id,
            file,
            path,
            start_index: header.start_index,
            end_index: header.start_index,
            entries: Vec::new(),
            entry_positions: Vec::new(),
            size_bytes: HEADER_SIZE,
            open: true,
        };
        segment.rebuild_entries(logger)?;

        if segment.end_index != header.end_index {
            warn!(logger, "segment header disagrees with records, trusting records";
                "path" => segment.path.display().to_string(),
                "header_end" => header.end_index,
                "end" => segment.end_index);
            segment.write_header()?;
        }
        Ok(segment)
    }

    fn write_header(&mut self) -> Result<()> {
        let header = SegmentHeader {
            start_index: self.start_index,
            end_index: self.end_index,
        };
        let header_bytes = bincode::serialize(&header)?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_header(file: &mut File, path: &Path) -> Result<SegmentHeader> {
        file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header_bytes).map_err(|e| Error::Corrupted {
            path: path.to_path_buf(),
            reason: format!("short segment header: {}", e),
        })?;
        Ok(bincode::deserialize(&header_bytes)?)
    }

    fn read_entry_header(&mut self) -> io::Result<u64> {
        let mut size_bytes = [0u8; 8];
        self.file.read_exact(&mut size_bytes)?;
        Ok(u64::from_le_bytes(size_bytes))
    }

    fn rebuild_entries(&mut self, logger: &Logger) -> Result<()> {
        self.entries.clear();
        self.entry_positions.clear();
        let file_len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;

        while pos < file_len {
            match self.read_record_at(pos, file_len) {
                Ok(Some((entry, record_len))) => {
                    let expected = self.start_index + self.entries.len() as u64;
                    if entry.index != expected {
                        return Err(Error::Corrupted {
                            path: self.path.clone(),
                            reason: format!(
                                "record at offset {} has index {}, expected {}",
                                pos, entry.index, expected
                            ),
                        });
                    }
                    self.entry_positions.push(pos);
                    self.entries.push(entry);
                    pos += record_len;
                }
                Ok(None) | Err(_) => {
                    warn!(logger, "truncating torn segment tail";
                        "path" => self.path.display().to_string(),
                        "offset" => pos,
                        "discarded" => file_len - pos);
                    self.file.set_len(pos)?;
                    break;
                }
            }
        }

        self.end_index = self.start_index + self.entries.len() as u64;
        self.size_bytes = pos;
        Ok(())
    }

    /// Decodes the record at `pos`, returning it with its on-disk length, or
    /// `None` when the record runs past the end of the file.
    fn read_record_at(&mut self, pos: u64, file_len: u64) -> Result<Option<(LogEntry, u64)>> {
        if pos + ENTRY_HEADER_SIZE > file_len {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(pos))?;
        let entry_size = self.read_entry_header()?;
        if pos + ENTRY_HEADER_SIZE + entry_size > file_len {
            return Ok(None);
        }
        let mut entry_bytes = vec![0u8; entry_size as usize];
        self.file.read_exact(&mut entry_bytes)?;
        let entry: LogEntry = bincode::deserialize(&entry_bytes)?;
        Ok(Some((entry, ENTRY_HEADER_SIZE + entry_size)))
    }

    /// Appends one entry. Its index must be exactly `end_index`.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        if entry.index != self.end_index {
            return Err(Error::OrderingViolation {
                expected: self.end_index,
                found: entry.index,
            });
        }

        let entry_bytes = bincode::serialize(&entry)?;
        let pos = self.size_bytes;
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(&(entry_bytes.len() as u64).to_le_bytes())?;
        self.file.write_all(&entry_bytes)?;

        self.entry_positions.push(pos);
        self.entries.push(entry);
        self.size_bytes = pos + ENTRY_HEADER_SIZE + entry_bytes.len() as u64;
        self.end_index += 1;

        self.write_header()?;
        Ok(())
    }

    /// Removes every entry above `index`. An index below the segment keeps nothing.
    pub fn truncate_after(&mut self, index: u64) -> Result<()> {
        if index.saturating_add(1) >= self.end_index {
            return Ok(());
        }
        let keep = index.saturating_add(1).saturating_sub(self.start_index) as usize;
        let pos = self
            .entry_positions
            .get(keep)
            .copied()
            .unwrap_or(HEADER_SIZE);

        self.file.set_len(pos)?;
        self.entries.truncate(keep);
        self.entry_positions.truncate(keep);
        self.size_bytes = pos;
        self.end_index = self.start_index + keep as u64;
        self.write_header()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index < self.start_index || index >= self.end_index {
            return None;
        }
        self.entries.get((index - self.start_index) as usize)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// One past the last index stored in this segment.
    pub fn end_index(&self) -> u64 {
        self.end_index
    }

    pub fn last_index(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.end_index - 1)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.end_index == self.start_index
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn create_reader(&self) -> JournalSegmentReader {
        JournalSegmentReader::new(self)
    }

    pub(crate) fn close(&mut self) {
        self.open = false;
    }

    /// Closes the segment and removes its file.
    pub(crate) fn delete(mut self) -> Result<()> {
        self.close();
        let path = self.path.clone();
        drop(self);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sequential cursor over the entries of one segment.
///
/// The reader only remembers which segment it belongs to and how far it
/// has read; every call that needs data is handed the segment itself so
/// the owning journal stays the single owner of segment lifetime.
#[derive(Debug, Clone)]
pub struct JournalSegmentReader {
    segment_id: u64,
    first_index: u64,
    position: usize,
    current: Option<LogEntry>,
    closed: bool,
}

impl JournalSegmentReader {
    fn new(segment: &Segment) -> Self {
        JournalSegmentReader {
            segment_id: segment.id(),
            first_index: segment.start_index(),
            position: 0,
            current: None,
            closed: false,
        }
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Index of the entry last returned by `next`, or 0 before the first one.
    pub fn current_index(&self) -> u64 {
        self.current.as_ref().map(|e| e.index).unwrap_or(0)
    }

    pub fn current_entry(&self) -> Option<&LogEntry> {
        self.current.as_ref()
    }

    pub fn next_index(&self) -> u64 {
        self.first_index + self.position as u64
    }

    pub fn has_next(&self, segment: &Segment) -> bool {
        debug_assert_eq!(segment.id(), self.segment_id);
        !self.closed && self.position < segment.len()
    }

    pub fn next(&mut self, segment: &Segment) -> Option<LogEntry> {
        if !self.has_next(segment) {
            return None;
        }
        let entry = segment.entries[self.position].clone();
        self.position += 1;
        self.current = Some(entry.clone());
        Some(entry)
    }

    /// Rewinds to the first entry of the segment.
    pub fn reset(&mut self) {
        self.position = 0;
        self.current = None;
    }

    /// Positions the cursor so that `next_index() == index`, clamped to the
    /// segment's range. The entry before `index`, if inside this segment,
    /// becomes the current entry.
    pub fn reset_to(&mut self, segment: &Segment, index: u64) {
        debug_assert_eq!(segment.id(), self.segment_id);
        let position = index
            .saturating_sub(self.first_index)
            .min(segment.len() as u64) as usize;
        self.position = position;
        self.current = if position == 0 {
            None
        } else {
            segment.entries.get(position - 1).cloned()
        };
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;
    use tempfile::tempdir;

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn entries(term: u64, range: std::ops::Range<u64>) -> Vec<LogEntry> {
        range
            .map(|i| LogEntry::new(term, i, format!("entry-{}", i).into_bytes()))
            .collect()
    }

    #[test]
    fn test_segment_creation() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(1, dir.path().join("segment_1.log"), 1).unwrap();

        assert_eq!(segment.start_index(), 1);
        assert_eq!(segment.end_index(), 1);
        assert_eq!(segment.last_index(), None);
        assert!(segment.is_empty());
        assert!(segment.is_open());
    }

    #[test]
    fn test_segment_append() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(1, dir.path().join("segment_1.log"), 1).unwrap();

        for entry in entries(1, 1..3) {
            segment.append(entry).unwrap();
        }

        assert_eq!(segment.end_index(), 3);
        assert_eq!(segment.last_index(), Some(2));
        assert_eq!(segment.get(1).unwrap().payload, b"entry-1");
        assert_eq!(segment.get(2).unwrap().payload, b"entry-2");
        assert!(segment.get(3).is_none());
    }

    #[test]
    fn test_segment_rejects_gap() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(1, dir.path().join("segment_5.log"), 5).unwrap();

        let err = segment.append(LogEntry::new(1, 6, vec![])).unwrap_err();
        assert!(err.is_ordering_violation());
        assert!(segment.is_empty());
    }

    #[test]
    fn test_segment_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment_1.log");
        let mut segment = Segment::create(1, &path, 1).unwrap();
        for entry in entries(1, 1..4) {
            segment.append(entry).unwrap();
        }

        segment.truncate_after(2).unwrap();
        assert_eq!(segment.end_index(), 3);
        assert!(segment.get(3).is_none());

        segment.append(LogEntry::new(2, 3, b"replacement".to_vec())).unwrap();
        drop(segment);

        let reopened = Segment::open(2, &path, &logger()).unwrap();
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.get(3).unwrap().payload, b"replacement");
        assert_eq!(reopened.get(3).unwrap().term, 2);
    }

    #[test]
    fn test_segment_reopen_cuts_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment_1.log");
        {
            let mut segment = Segment::create(1, &path, 1).unwrap();
            for entry in entries(1, 1..4) {
                segment.append(entry).unwrap();
            }
        }
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let segment = Segment::open(1, &path, &logger()).unwrap();
        assert_eq!(segment.len(), 2);
        assert_eq!(segment.end_index(), 3);
        assert!(fs::metadata(&path).unwrap().len() < len - 3);
    }

    #[test]
    fn test_reader_walks_and_resets() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(1, dir.path().join("segment_10.log"), 10).unwrap();
        for entry in entries(3, 10..14) {
            segment.append(entry).unwrap();
        }

        let mut reader = segment.create_reader();
        assert_eq!(reader.current_index(), 0);
        assert_eq!(reader.next_index(), 10);

        assert_eq!(reader.next(&segment).unwrap().index, 10);
        assert_eq!(reader.next(&segment).unwrap().index, 11);
        assert_eq!(reader.current_index(), 11);

        reader.reset_to(&segment, 13);
        assert_eq!(reader.next_index(), 13);
        assert_eq!(reader.current_index(), 12);
        assert_eq!(reader.next(&segment).unwrap().index, 13);
        assert!(!reader.has_next(&segment));
        assert!(reader.next(&segment).is_none());

        reader.reset();
        assert_eq!(reader.next_index(), 10);
        assert!(reader.current_entry().is_none());
    }
}
