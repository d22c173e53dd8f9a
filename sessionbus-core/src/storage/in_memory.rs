//! In-memory event store.
//!
//! Records live only as long as the store does, which makes it suitable for
//! tests and for embedding the bus in a host that persists on its own.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{EventStore, StorageError};
use crate::event::ScheduledEventRecord;

#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    records: Mutex<Vec<ScheduledEventRecord>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Stored records, without removing them.
    pub async fn snapshot(&self) -> Vec<ScheduledEventRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save_unfinished_events(&self, events: &[ScheduledEventRecord]) -> Result<(), StorageError> {
        self.records.lock().await.extend_from_slice(events);
        Ok(())
    }

    async fn load_unfinished_events(&self) -> Result<Vec<ScheduledEventRecord>, StorageError> {
        let mut records = std::mem::take(&mut *self.records.lock().await);
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }
}
