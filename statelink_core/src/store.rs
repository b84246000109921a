//! Player record persistence.
//!
//! The backend's per-record queue is the only writer; stores just need to
//! be thread-safe and durable.

use crate::error::StoreError;
use crate::record::PlayerRecord;
use statelink_env::PlayerId;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

/// Storage for authoritative player records.
pub trait RecordStore: Send + Sync {
    fn load(&self, player: PlayerId) -> Result<Option<PlayerRecord>, StoreError>;

    fn save(&self, record: &PlayerRecord) -> Result<(), StoreError>;

    /// Returns whether a record existed.
    fn remove(&self, player: PlayerId) -> Result<bool, StoreError>;
}

/// Volatile store for tests and simulation.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<PlayerId, PlayerRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn load(&self, player: PlayerId) -> Result<Option<PlayerRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&player)
            .cloned())
    }

    fn save(&self, record: &PlayerRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record.clone());
        Ok(())
    }

    fn remove(&self, player: PlayerId) -> Result<bool, StoreError> {
        Ok(self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&player)
            .is_some())
    }
}

/// Sled-backed store. Records are JSON values keyed by player uuid bytes.
pub struct SledRecordStore {
    db: sled::Db,
}

impl SledRecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Storage(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db })
    }

    #[cfg(test)]
    pub fn open_temp() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Storage(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db })
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

impl RecordStore for SledRecordStore {
    fn load(&self, player: PlayerId) -> Result<Option<PlayerRecord>, StoreError> {
        let Some(bytes) = self
            .db
            .get(player.as_uuid().as_bytes())
            .map_err(|e| StoreError::Storage(format!("Get failed: {}", e)))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                player,
                reason: e.to_string(),
            })
    }

    fn save(&self, record: &PlayerRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Corrupt {
            player: record.id,
            reason: e.to_string(),
        })?;
        self.db
            .insert(record.id.as_uuid().as_bytes(), bytes)
            .map_err(|e| StoreError::Storage(format!("Insert failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| StoreError::Storage(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    fn remove(&self, player: PlayerId) -> Result<bool, StoreError> {
        let removed = self
            .db
            .remove(player.as_uuid().as_bytes())
            .map_err(|e| StoreError::Storage(format!("Remove failed: {}", e)))?;
        Ok(removed.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Currency, Milestone};

    fn record() -> PlayerRecord {
        let mut record = PlayerRecord::new(PlayerId::from_seed(4));
        record.currencies.insert(Currency::Gems, 12);
        record.tutorial.completed.insert(Milestone::FirstMatch);
        record
    }

    fn exercise(store: &dyn RecordStore) {
        let record = record();
        assert_eq!(store.load(record.id).unwrap(), None);

        store.save(&record).unwrap();
        assert_eq!(store.load(record.id).unwrap(), Some(record.clone()));

        assert!(store.remove(record.id).unwrap());
        assert!(!store.remove(record.id).unwrap());
        assert_eq!(store.load(record.id).unwrap(), None);
    }

    #[test]
    fn test_in_memory_store() {
        exercise(&InMemoryRecordStore::new());
    }

    #[test]
    fn test_sled_store() {
        let store = SledRecordStore::open_temp().unwrap();
        exercise(&store);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sled_corrupt_value_reported() {
        let store = SledRecordStore::open_temp().unwrap();
        let player = PlayerId::from_seed(4);
        store.db.insert(player.as_uuid().as_bytes(), b"{not json".to_vec()).unwrap();

        assert!(matches!(store.load(player), Err(StoreError::Corrupt { .. })));
    }
}
