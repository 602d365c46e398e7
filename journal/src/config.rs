use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::Result;

static INSTANCE: OnceCell<Mutex<JournalConfig>> = OnceCell::new();

/// Process-wide configuration, initialised with defaults on first access.
pub fn instance() -> &'static Mutex<JournalConfig> {
    INSTANCE.get_or_init(|| Mutex::new(JournalConfig::new()))
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct JournalConfig {
    /// Directory holding segment files, the boundary metadata and snapshots.
    pub dir: PathBuf,
    /// Roll over to a new segment after this many entries.
    pub max_entries_per_segment: u64,
    /// Roll over to a new segment once its file reaches this many bytes.
    pub max_segment_bytes: u64,
    /// Retention window for snapshot deletion, and the applied-entry count
    /// that triggers a capture in the node driver.
    pub snapshot_batch_count: u64,
    /// Share of the caller-supplied size threshold the log may occupy
    /// before `persist` compacts to the last applied entry.
    pub snapshot_data_threshold_percentage: u8,
    /// Size budget in bytes that the threshold percentage applies to.
    pub snapshot_size_threshold: u64,
    pub capture_channel_size: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig::new()
    }
}

impl JournalConfig {
    pub fn new() -> Self {
        JournalConfig {
            dir: PathBuf::from("data"),
            max_entries_per_segment: 1024,
            max_segment_bytes: 32 * 1024 * 1024,
            snapshot_batch_count: 20_000,
            snapshot_data_threshold_percentage: 12,
            snapshot_size_threshold: 256 * 1024 * 1024,
            capture_channel_size: 16,
        }
    }

    /// Config rooted at `dir` with every other knob at its default.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        JournalConfig {
            dir: dir.into(),
            ..JournalConfig::new()
        }
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Loads the config file, falling back to defaults when it is missing
    /// or malformed, and publishes the result to [`instance`].
    pub fn from_toml(path: &str) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the journal config file {}, {:?}",
                    path, e
                );
                return JournalConfig::new();
            }
        };
        let config = match JournalConfig::parse(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong parsing the journal config file {}, {:?}",
                    path, e
                );
                return JournalConfig::new();
            }
        };
        if let Ok(mut current) = instance().lock() {
            current.clone_from(&config);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_partial_config_keeps_defaults() {
        let config = JournalConfig::parse(
            r#"
            dir = "/var/lib/journal"
            max_entries_per_segment = 64
            "#,
        )
        .unwrap();

        assert_eq!(config.dir, PathBuf::from("/var/lib/journal"));
        assert_eq!(config.max_entries_per_segment, 64);
        assert_eq!(config.snapshot_batch_count, 20_000);
        assert_eq!(config.snapshot_data_threshold_percentage, 12);
    }

    #[test]
    fn test_parse_rejects_wrong_types() {
        assert!(JournalConfig::parse("max_entries_per_segment = \"many\"").is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = JournalConfig::from_toml("/nonexistent/journal.toml");
        assert_eq!(config, JournalConfig::new());
    }

    #[test]
    fn test_from_toml_publishes_instance() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "snapshot_batch_count = 7").unwrap();

        let config = JournalConfig::from_toml(file.path().to_str().unwrap());
        assert_eq!(config.snapshot_batch_count, 7);
        assert_eq!(instance().lock().unwrap().snapshot_batch_count, 7);
    }
}
