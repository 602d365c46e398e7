use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slog::{o, Logger};
use tempfile::tempdir;

use raft_journal::{Journal, JournalConfig, LogEntry};

fn logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn open(dir: &std::path::Path, per_segment: u64) -> Journal {
    let config = JournalConfig {
        max_entries_per_segment: per_segment,
        ..JournalConfig::with_dir(dir)
    };
    Journal::open(&config, &logger()).unwrap()
}

#[test]
fn sequential_read_yields_every_appended_index() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..20 {
        let dir = tempdir().unwrap();
        let journal = open(dir.path(), rng.gen_range(1..6));
        let count = rng.gen_range(0..60u64);
        let mut term = 1;
        for index in 1..=count {
            if rng.gen_bool(0.1) {
                term += 1;
            }
            let len = rng.gen_range(0..16);
            journal.append(LogEntry::new(term, index, vec![index as u8; len])).unwrap();
        }

        let mut reader = journal.open_reader(1);
        let indices: Vec<u64> = reader.iter().map(|e| e.unwrap().index).collect();
        assert_eq!(indices, (1..=count).collect::<Vec<_>>());
        assert!(!reader.has_next());
    }
}

#[test]
fn reset_to_any_live_index_returns_that_entry() {
    let mut rng = StdRng::seed_from_u64(42);
    let dir = tempdir().unwrap();
    let journal = open(dir.path(), 3);
    for index in 1..=50 {
        journal.append(LogEntry::new(1, index, index.to_le_bytes().to_vec())).unwrap();
    }

    let mut reader = journal.open_reader(1);
    for _ in 0..200 {
        let target = rng.gen_range(1..=50u64);
        reader.reset_to(target);
        let entry = reader.next().unwrap();
        assert_eq!(entry.index, target);
        assert_eq!(entry.payload, target.to_le_bytes().to_vec());
        assert_eq!(reader.current_index(), target);
    }
}

#[test]
fn reader_follows_truncation_and_compaction() {
    let mut rng = StdRng::seed_from_u64(3);
    let dir = tempdir().unwrap();
    let journal = open(dir.path(), 4);
    let mut model: Vec<u64> = Vec::new();
    let mut reader = journal.open_reader(1);

    for round in 0..30u64 {
        let next = journal.next_index();
        for offset in 0..rng.gen_range(1..8u64) {
            journal.append(LogEntry::new(round + 1, next + offset, vec![])).unwrap();
            model.push(next + offset);
        }

        match rng.gen_range(0..3) {
            0 => {
                let keep = rng.gen_range(journal.first_index() - 1..=journal.last_index());
                journal.truncate_after(keep).unwrap();
                model.retain(|&i| i <= keep);
            }
            1 => {
                let upto = rng.gen_range(journal.first_index()..=journal.last_index());
                journal.compact(upto).unwrap();
                let first = journal.first_index();
                model.retain(|&i| i >= first);
            }
            _ => {}
        }

        reader.reset_to(journal.first_index());
        let seen: Vec<u64> = reader.iter().map(|e| e.unwrap().index).collect();
        assert_eq!(seen, model, "round {}", round);
    }
    assert_eq!(journal.reader_count(), 1);
}

#[test]
fn reopened_journal_reads_the_same_entries() {
    let dir = tempdir().unwrap();
    {
        let journal = open(dir.path(), 5);
        for index in 1..=23 {
            journal.append(LogEntry::new(2, index, format!("e{}", index))).unwrap();
        }
        journal.compact(7).unwrap();
        journal.flush().unwrap();
    }

    let journal = open(dir.path(), 5);
    assert_eq!(journal.first_index(), 6);
    let mut reader = journal.open_reader(10);
    let first = reader.next().unwrap();
    assert_eq!(first.payload, b"e10");
    assert_eq!(reader.iter().count(), 13);
}
