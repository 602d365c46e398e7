//! Cursor over the whole journal.
//!
//! A `SegmentedJournalReader` walks segment after segment, remembering only
//! the id of the segment it is positioned in. Every operation re-resolves
//! that id against the journal, so compaction may remove segments while a
//! reader is open: the reader notices on its next `reset_to` and rebuilds
//! from the journal's current first segment.

use crate::error::{Error, Result};
use crate::raft::entry::LogEntry;
use crate::raft::journal::{Journal, JournalInner};
use crate::raft::segment::JournalSegmentReader;

pub struct SegmentedJournalReader {
    journal: Journal,
    id: u64,
    current_segment: u64,
    current_reader: JournalSegmentReader,
    // Last entry handed out before the active segment reader was replaced,
    // so current_index() survives a boundary crossing.
    previous_entry: Option<LogEntry>,
    closed: bool,
}

impl SegmentedJournalReader {
    pub(crate) fn new(journal: Journal, id: u64, reader: JournalSegmentReader) -> Self {
        SegmentedJournalReader {
            journal,
            id,
            current_segment: reader.segment_id(),
            current_reader: reader,
            previous_entry: None,
            closed: false,
        }
    }

    pub fn first_index(&self) -> u64 {
        self.journal.first_index()
    }

    /// Index of the entry last returned by `next`, 0 if nothing was read.
    pub fn current_index(&self) -> u64 {
        let current = self.current_reader.current_index();
        if current != 0 {
            return current;
        }
        self.previous_entry.as_ref().map_or(0, |e| e.index)
    }

    pub fn current_entry(&self) -> Option<&LogEntry> {
        self.current_reader
            .current_entry()
            .or(self.previous_entry.as_ref())
    }

    pub fn next_index(&self) -> u64 {
        self.current_reader.next_index()
    }

    pub fn has_next(&mut self) -> bool {
        let journal = self.journal.clone();
        let inner = journal.read();
        self.has_next_in(&inner)
    }

    /// Like `has_next`, but reports a gap to the following segment instead
    /// of treating it as the end of the journal.
    pub fn try_has_next(&mut self) -> Result<bool> {
        let journal = self.journal.clone();
        let inner = journal.read();
        self.try_has_next_in(&inner)
    }

    /// Returns the next entry, crossing into the following segment when the
    /// current one is exhausted.
    pub fn next(&mut self) -> Result<LogEntry> {
        let journal = self.journal.clone();
        let inner = journal.read();
        self.next_in(&inner)
    }

    /// Moves back to the very first entry of the journal.
    pub fn reset(&mut self) {
        let journal = self.journal.clone();
        let inner = journal.read();
        self.reset_in(&inner);
    }

    /// Positions the reader so that the next entry returned is `index`.
    pub fn reset_to(&mut self, index: u64) {
        let journal = self.journal.clone();
        let inner = journal.read();

        // A closed segment was replaced by compaction.
        if !inner.is_segment_open(self.current_segment) {
            self.reset_in(&inner);
        }

        let next_index = self.current_reader.next_index();
        if index < next_index {
            self.rewind(&inner, index);
        } else if index > next_index {
            self.forward(&inner, index);
        } else if let Some(segment) = inner.segment_by_id(self.current_segment) {
            self.current_reader.reset_to(segment, index);
        }
    }

    /// Closes the active segment reader and deregisters from the journal.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.current_reader.close();
        self.journal.close_reader(self.id);
    }

    /// Iterator over the remaining entries.
    pub fn iter(&mut self) -> Entries<'_> {
        Entries {
            reader: self,
            failed: false,
        }
    }

    fn has_next_in(&mut self, inner: &JournalInner) -> bool {
        match self.try_has_next_in(inner) {
            Ok(has_next) => has_next,
            Err(e) => {
                log::error!("Journal reader {} stopped at a gap: {}", self.id, e);
                false
            }
        }
    }

    fn try_has_next_in(&mut self, inner: &JournalInner) -> Result<bool> {
        if self.segment_has_next(inner) {
            return Ok(true);
        }
        Ok(self.move_to_next_segment(inner)? && self.segment_has_next(inner))
    }

    fn segment_has_next(&self, inner: &JournalInner) -> bool {
        inner
            .segment_by_id(self.current_segment)
            .map_or(false, |s| self.current_reader.has_next(s))
    }

    fn next_in(&mut self, inner: &JournalInner) -> Result<LogEntry> {
        if let Some(segment) = inner.segment_by_id(self.current_segment) {
            if self.current_reader.has_next(segment) {
                self.previous_entry = self.current_reader.current_entry().cloned();
                return self.current_reader.next(segment).ok_or(Error::NoSuchElement);
            }
        }
        if self.move_to_next_segment(inner)? {
            if let Some(segment) = inner.segment_by_id(self.current_segment) {
                return self.current_reader.next(segment).ok_or(Error::NoSuchElement);
            }
        }
        Err(Error::NoSuchElement)
    }

    fn reset_in(&mut self, inner: &JournalInner) {
        self.previous_entry = None;
        self.current_reader.close();

        let first = inner.first_segment();
        self.current_segment = first.id();
        self.current_reader = first.create_reader();
    }

    fn rewind(&mut self, inner: &JournalInner, index: u64) {
        if self.current_reader.first_index() >= index {
            // Prefer the segment holding index - 1 so the entry before the
            // target stays current.
            let segment = inner
                .segment_containing(index.saturating_sub(1))
                .or_else(|| inner.segment_containing(index))
                .unwrap_or_else(|| inner.first_segment());
            if segment.id() != self.current_segment {
                self.current_reader.close();
                self.current_segment = segment.id();
                self.current_reader = segment.create_reader();
            }
        }

        if let Some(segment) = inner.segment_by_id(self.current_segment) {
            self.current_reader.reset_to(segment, index);
        }
        self.previous_entry = self.current_reader.current_entry().cloned();
    }

    // Linear scan; forward seeks across many segments are rare.
    fn forward(&mut self, inner: &JournalInner, index: u64) {
        while self.next_index() < index && self.has_next_in(inner) {
            if self.next_in(inner).is_err() {
                break;
            }
        }
    }

    /// Switches to the following segment, but only if it starts exactly
    /// where this reader's next index is. A following segment that starts
    /// anywhere else means entries would be skipped.
    fn move_to_next_segment(&mut self, inner: &JournalInner) -> Result<bool> {
        let start = self.current_reader.first_index();
        let next_segment = match inner.next_segment(start) {
            Some(segment) if segment.start_index() == self.next_index() => segment,
            Some(segment) => {
                return Err(Error::OrderingViolation {
                    expected: self.next_index(),
                    found: segment.start_index(),
                })
            }
            None => return Ok(false),
        };

        self.previous_entry = self.current_reader.current_entry().cloned();
        self.current_reader.close();

        self.current_segment = next_segment.id();
        self.current_reader = next_segment.create_reader();
        Ok(true)
    }
}

impl Drop for SegmentedJournalReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Iterator adaptor returned by [`SegmentedJournalReader::iter`]. A gap
/// in the journal is yielded once as an error, then iteration ends.
pub struct Entries<'a> {
    reader: &'a mut SegmentedJournalReader,
    failed: bool,
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Result<LogEntry>> {
        if self.failed {
            return None;
        }
        let next = match self.reader.try_has_next() {
            Ok(true) => self.reader.next(),
            Ok(false) => return None,
            Err(e) => Err(e),
        };
        self.failed = next.is_err();
        Some(next)
    }
}
