//! Metrics collection for the journal and the snapshot lifecycle
//!
//! Counters are registered in a process-wide Prometheus registry that the
//! embedding service can expose however it likes.

use lazy_static::lazy_static;
use prometheus::{CounterVec, IntCounter, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Snapshot lifecycle transitions by event
    pub static ref SNAPSHOT_EVENT_COUNTER: CounterVec = CounterVec::new(
        Opts::new("snapshot_event_counter", "snapshot lifecycle events"),
        &["event"]
    )
    .unwrap();

    /// Segment creation and removal by event
    pub static ref JOURNAL_SEGMENT_COUNTER: CounterVec = CounterVec::new(
        Opts::new("journal_segment_counter", "journal segment events"),
        &["event"]
    )
    .unwrap();

    /// Entries appended to the journal
    pub static ref JOURNAL_APPEND_COUNTER: IntCounter =
        IntCounter::new("journal_append_counter", "entries appended").unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOT_EVENT_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(JOURNAL_SEGMENT_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(JOURNAL_APPEND_COUNTER.clone()));
}

pub fn snapshot_event(event: &str) {
    SNAPSHOT_EVENT_COUNTER.with_label_values(&[event]).inc();
}

pub fn segment_event(event: &str) {
    JOURNAL_SEGMENT_COUNTER.with_label_values(&[event]).inc();
}
