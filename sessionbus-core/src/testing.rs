//! Helpers for exercising a bus in tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::BusConfig;
use crate::event::MessageBus;

/// A configuration with short intervals so tests do not wait on timers.
pub fn fast_config() -> BusConfig {
    let mut config = BusConfig::default();
    config.tick_interval = Duration::from_millis(10);
    config.shutdown_timeout = Duration::from_millis(500);
    config.approval.poll_interval = Duration::from_millis(20);
    config
}

pub async fn started_bus() -> Arc<MessageBus> {
    let bus = Arc::new(MessageBus::new(fast_config()));
    bus.start().await;
    bus
}

/// Shared, ordered log of what handlers saw.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
