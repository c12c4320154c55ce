//! Persistence of per-producer recovery timestamps
//!
//! The last timestamp processed before a disconnect survives restarts so the
//! first recovery after startup can ask for "everything after" instead of a
//! full snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use uf_common::ProducerId;

use crate::error::FeedError;
use crate::Result;

pub type ProducerTimestamps = BTreeMap<ProducerId, DateTime<Utc>>;

pub trait TimestampStore: Send + Sync {
    /// Load stored timestamps; a store that was never written yields an empty map
    fn load(&self) -> Result<ProducerTimestamps>;

    /// Replace the stored timestamps
    fn save(&self, timestamps: &ProducerTimestamps) -> Result<()>;
}

/// Keeps timestamps for the lifetime of the process only
#[derive(Default)]
pub struct MemoryTimestampStore {
    timestamps: Mutex<ProducerTimestamps>,
}

impl MemoryTimestampStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timestamps(timestamps: ProducerTimestamps) -> Self {
        Self {
            timestamps: Mutex::new(timestamps),
        }
    }

    pub fn snapshot(&self) -> ProducerTimestamps {
        self.timestamps.lock().clone()
    }
}

impl TimestampStore for MemoryTimestampStore {
    fn load(&self) -> Result<ProducerTimestamps> {
        Ok(self.timestamps.lock().clone())
    }

    fn save(&self, timestamps: &ProducerTimestamps) -> Result<()> {
        *self.timestamps.lock() = timestamps.clone();
        Ok(())
    }
}

/// JSON file of producer id -> epoch milliseconds, rewritten atomically
pub struct FileTimestampStore {
    path: PathBuf,
}

impl FileTimestampStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl TimestampStore for FileTimestampStore {
    fn load(&self) -> Result<ProducerTimestamps> {
        if !self.path.exists() {
            debug!(path = ?self.path, "No timestamp file yet");
            return Ok(ProducerTimestamps::new());
        }

        let content = fs::read(&self.path)?;
        let stored: BTreeMap<ProducerId, i64> = serde_json::from_slice(&content)?;

        stored
            .into_iter()
            .map(|(producer_id, millis)| {
                DateTime::from_timestamp_millis(millis)
                    .map(|ts| (producer_id, ts))
                    .ok_or_else(|| {
                        FeedError::Store(format!(
                            "timestamp {} for producer {} is out of range",
                            millis, producer_id
                        ))
                    })
            })
            .collect()
    }

    fn save(&self, timestamps: &ProducerTimestamps) -> Result<()> {
        let stored: BTreeMap<ProducerId, i64> = timestamps
            .iter()
            .map(|(id, ts)| (*id, ts.timestamp_millis()))
            .collect();
        let content = serde_json::to_vec_pretty(&stored)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(path = ?self.path, producers = stored.len(), "Saved producer timestamps");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTimestampStore::new(dir.path().join("nested").join("timestamps.json"));

        assert!(store.load().unwrap().is_empty());

        let mut timestamps = ProducerTimestamps::new();
        timestamps.insert(1, DateTime::from_timestamp_millis(1_700_000_000_123).unwrap());
        timestamps.insert(3, DateTime::from_timestamp_millis(1_700_000_100_000).unwrap());
        store.save(&timestamps).unwrap();

        assert_eq!(store.load().unwrap(), timestamps);
        assert!(!dir.path().join("nested").join("timestamps.json.tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timestamps.json");
        fs::write(&path, "not json").unwrap();

        let store = FileTimestampStore::new(&path);
        assert!(matches!(store.load(), Err(FeedError::Serialization(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryTimestampStore::new();
        let mut timestamps = ProducerTimestamps::new();
        timestamps.insert(4, Utc::now());
        store.save(&timestamps).unwrap();
        assert_eq!(store.load().unwrap(), timestamps);
    }
}
