//! In-memory dedup backend for tests and single-process runs.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::{DedupBackend, DedupKey, DedupRecord, Result, StoreError};

#[derive(Default)]
pub struct MemoryDedupBackend {
    records: DashMap<DedupKey, DedupRecord>,
}

impl MemoryDedupBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &DedupKey) -> Option<DedupRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DedupBackend for MemoryDedupBackend {
    async fn create(&self, record: &DedupRecord) -> Result<()> {
        // The shard lock held by `entry` makes check-and-insert atomic.
        match self.records.entry(record.key.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, key: &DedupKey) -> Result<Option<DedupRecord>> {
        Ok(self.record(key))
    }

    async fn put(&self, record: &DedupRecord) -> Result<()> {
        self.records.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, key: &DedupKey) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }
}
