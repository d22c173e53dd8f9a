//! Local file system event store.
//!
//! All pending records are kept in one JSON array file. Writes go to a
//! temporary file in the same directory which is then renamed over the
//! target, so a crash mid-write never leaves a truncated file behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{EventStore, StorageError};
use crate::config::StoreConfig;
use crate::event::ScheduledEventRecord;

/// Event store backed by a single JSON file.
///
/// # Error Handling
///
/// A missing file reads as an empty store. Unparsable content is reported as
/// [`StorageError::DeserializationError`] and the file is left untouched.
#[derive(Debug, Clone)]
pub struct LocalFileEventStore {
    path: PathBuf,
}

impl LocalFileEventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(&config.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored records, without removing them.
    pub async fn peek(&self) -> Result<Vec<ScheduledEventRecord>, StorageError> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let contents = fs::read(&self.path)
            .await
            .map_err(|e| StorageError::FileNotFound(format!("Failed to read {}: {}", self.path.display(), e)))?;
        if contents.is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_slice(&contents).map_err(|e| {
            StorageError::DeserializationError(format!("Failed to parse {}: {}", self.path.display(), e))
        })
    }

    async fn write_atomically(&self, data: &[u8]) -> Result<(), StorageError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::InvalidPath(format!("Failed to create directory: {}", e)))?;

        let temp_file = NamedTempFile::new_in(&dir).map_err(|e| {
            StorageError::StorageError(format!("Failed to create temporary file: {}", e))
        })?;
        let handle = temp_file
            .reopen()
            .map_err(|e| StorageError::StorageError(format!("Failed to open temporary file: {}", e)))?;

        let mut file = fs::File::from_std(handle);
        file.write_all(data)
            .await
            .map_err(|e| StorageError::StorageError(format!("Failed to write to file: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| StorageError::StorageError(format!("Failed to flush file: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::StorageError(format!("Failed to sync file: {}", e)))?;
        drop(file);

        temp_file
            .persist(&self.path)
            .map_err(|e| StorageError::StorageError(format!("Failed to replace {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for LocalFileEventStore {
    async fn save_unfinished_events(&self, events: &[ScheduledEventRecord]) -> Result<(), StorageError> {
        let mut records = self.peek().await?;
        records.extend_from_slice(events);

        let json = serde_json::to_vec_pretty(&records).map_err(|e| {
            StorageError::SerializationError(format!("Failed to serialize records: {}", e))
        })?;
        self.write_atomically(&json).await?;
        debug!("Saved {} records to {}", events.len(), self.path.display());
        Ok(())
    }

    async fn load_unfinished_events(&self) -> Result<Vec<ScheduledEventRecord>, StorageError> {
        let mut records = self.peek().await?;
        if fs::try_exists(&self.path).await.unwrap_or(false) {
            fs::remove_file(&self.path)
                .await
                .map_err(|e| StorageError::StorageError(format!("Failed to remove file: {}", e)))?;
        }
        records.sort_by_key(|record| record.timestamp);
        debug!("Loaded {} records from {}", records.len(), self.path.display());
        Ok(records)
    }
}
