//! Bounded reading history
//!
//! Newest reading first, at most [`HISTORY_CAPACITY`] entries, persisted as
//! one JSON array under [`READINGS_STORAGE_KEY`].

use crate::domain::models::Reading;
use crate::infrastructure::storage::{KeyValueStore, StoreError};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

pub const HISTORY_CAPACITY: usize = 100;

pub const READINGS_STORAGE_KEY: &str = "librearm_readings";

pub struct ReadingStore {
    readings: Vec<Reading>,
    backend: Box<dyn KeyValueStore>,
}

impl ReadingStore {
    /// Load the history from `backend`.
    ///
    /// Unreadable or corrupt data yields an empty history; the next write
    /// replaces it.
    pub fn open(backend: Box<dyn KeyValueStore>) -> Self {
        let readings = match backend.load(READINGS_STORAGE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<Reading>>(&raw) {
                Ok(mut readings) => {
                    readings.truncate(HISTORY_CAPACITY);
                    readings
                }
                Err(e) => {
                    warn!("Discarding unreadable reading history: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Could not load reading history: {}", e);
                Vec::new()
            }
        };
        info!("Loaded {} stored readings", readings.len());
        Self { readings, backend }
    }

    /// Insert at the head, evicting the oldest entries beyond capacity
    pub fn append(&mut self, reading: Reading) -> Result<(), StoreError> {
        let mut next = Vec::with_capacity(HISTORY_CAPACITY);
        next.push(reading);
        next.extend(
            self.readings
                .iter()
                .take(HISTORY_CAPACITY - 1)
                .cloned(),
        );
        self.commit(next)
    }

    pub fn list(&self) -> Vec<Reading> {
        self.readings.clone()
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.readings.first()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Flag the reading taken at exactly `timestamp` as synced.
    ///
    /// Returns whether an entry matched; no match is not an error.
    pub fn mark_synced(&mut self, timestamp: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(index) = self
            .readings
            .iter()
            .position(|r| r.timestamp == timestamp)
        else {
            debug!("No stored reading at {} to mark as synced", timestamp);
            return Ok(false);
        };
        if self.readings[index].synced {
            return Ok(true);
        }

        let mut next = self.readings.clone();
        next[index].synced = true;
        self.commit(next)?;
        Ok(true)
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.backend.remove(READINGS_STORAGE_KEY)?;
        self.readings.clear();
        info!("Reading history cleared");
        Ok(())
    }

    /// Persist first, then swap, so a failed write leaves the old history in place
    fn commit(&mut self, next: Vec<Reading>) -> Result<(), StoreError> {
        let json = serde_json::to_string(&next)?;
        self.backend.save(READINGS_STORAGE_KEY, &json)?;
        self.readings = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::BpStatus;
    use crate::infrastructure::storage::{JsonFileStore, MemoryStore};
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn reading_at(minute: i64, systolic: u16) -> Reading {
        Reading {
            systolic,
            diastolic: 80,
            mean_arterial_pressure: 95,
            heart_rate: 70,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap()
                + Duration::minutes(minute),
            status: BpStatus::High,
            synced: false,
        }
    }

    struct FlakyStore {
        inner: MemoryStore,
        fail: Arc<AtomicBool>,
    }

    impl KeyValueStore for FlakyStore {
        fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.load(key)
        }

        fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("disk full").into());
            }
            self.inner.save(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn test_append_puts_newest_first() {
        let mut store = ReadingStore::open(Box::new(MemoryStore::new()));
        store.append(reading_at(0, 120)).unwrap();
        store.append(reading_at(1, 130)).unwrap();

        let list = store.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].systolic, 130);
        assert_eq!(store.latest().map(|r| r.systolic), Some(130));
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut store = ReadingStore::open(Box::new(MemoryStore::new()));
        for i in 0..130 {
            store.append(reading_at(i, 100 + i as u16)).unwrap();
            assert!(store.len() <= HISTORY_CAPACITY);
            assert_eq!(store.latest().map(|r| r.systolic), Some(100 + i as u16));
        }
        let list = store.list();
        assert_eq!(list.len(), HISTORY_CAPACITY);
        // oldest surviving entry is the 31st appended
        assert_eq!(list.last().map(|r| r.systolic), Some(130));
    }

    #[test]
    fn test_mark_synced_matches_exact_timestamp() {
        let mut store = ReadingStore::open(Box::new(MemoryStore::new()));
        store.append(reading_at(0, 120)).unwrap();
        store.append(reading_at(5, 125)).unwrap();

        let target = reading_at(0, 0).timestamp;
        assert!(store.mark_synced(target).unwrap());
        let list = store.list();
        assert!(!list[0].synced);
        assert!(list[1].synced);

        let absent = target + Duration::seconds(1);
        assert!(!store.mark_synced(absent).unwrap());
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store =
                ReadingStore::open(Box::new(JsonFileStore::new(dir.path()).unwrap()));
            store.append(reading_at(0, 118)).unwrap();
            store.append(reading_at(1, 141)).unwrap();
            store.mark_synced(reading_at(0, 0).timestamp).unwrap();
        }

        let store = ReadingStore::open(Box::new(JsonFileStore::new(dir.path()).unwrap()));
        let list = store.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].systolic, 141);
        assert!(list[1].synced);
    }

    #[test]
    fn test_corrupt_history_opens_empty() {
        let backend = MemoryStore::new();
        backend.save(READINGS_STORAGE_KEY, "{broken").unwrap();
        let store = ReadingStore::open(Box::new(backend));
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_empties_store_and_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ReadingStore::open(Box::new(JsonFileStore::new(dir.path()).unwrap()));
        store.append(reading_at(0, 120)).unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());

        let reopened = ReadingStore::open(Box::new(JsonFileStore::new(dir.path()).unwrap()));
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_failed_write_keeps_previous_history() {
        let fail = Arc::new(AtomicBool::new(false));
        let mut store = ReadingStore::open(Box::new(FlakyStore {
            inner: MemoryStore::new(),
            fail: fail.clone(),
        }));
        store.append(reading_at(0, 120)).unwrap();

        fail.store(true, Ordering::SeqCst);
        assert!(store.append(reading_at(1, 150)).is_err());
        assert!(store.mark_synced(reading_at(0, 0).timestamp).is_err());

        let list = store.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].systolic, 120);
        assert!(!list[0].synced);
    }
}
