//! Persistence of unfinished scheduled events.
//!
//! The [`EventStore`] trait is the only collaborator crash recovery needs.
//! Two implementations ship with the crate:
//!
//! - [`in_memory::InMemoryEventStore`]: process-local, for tests and embedding
//! - [`local_fs::LocalFileEventStore`]: a single JSON file on disk
//!
//! # Usage Example
//!
//! ```no_run
//! use sessionbus_core::storage::{EventStore, local_fs::LocalFileEventStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = LocalFileEventStore::new("pending-events.json");
//!
//! // Read and clear whatever a previous run left behind
//! let records = store.load_unfinished_events().await?;
//! println!("{} events to restore", records.len());
//!
//! // Persist them again
//! store.save_unfinished_events(&records).await?;
//! # Ok(())
//! # }
//! ```

pub mod in_memory;
pub mod local_fs;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::ScheduledEventRecord;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Durable home of scheduled events that were still pending at shutdown.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` to whatever the store already holds.
    async fn save_unfinished_events(&self, events: &[ScheduledEventRecord]) -> Result<(), StorageError>;

    /// Returns every stored record, oldest first, and removes them from the
    /// store.
    async fn load_unfinished_events(&self) -> Result<Vec<ScheduledEventRecord>, StorageError>;
}
