use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, path::PathBuf, time::Duration};

use crate::{Error, InternalResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// How often the dispatch loop releases due scheduled events.
    #[serde(default = "default_tick_interval", with = "duration_ms")]
    pub tick_interval: Duration,

    #[serde(default = "default_shutdown_timeout", with = "duration_ms")]
    pub shutdown_timeout: Duration,

    /// Capacity of the isolated event handler error log.
    #[serde(default = "default_max_recorded_errors")]
    pub max_recorded_errors: usize,

    /// Publish `CommandStarted` / `CommandCompleted` around every command.
    #[serde(default)]
    pub lifecycle_events: bool,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub event_log: EventLogConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            max_recorded_errors: default_max_recorded_errors(),
            lifecycle_events: false,
            approval: ApprovalConfig::default(),
            store: StoreConfig::default(),
            event_log: EventLogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_poll_interval", with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// JSON Lines log of every published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Directory receiving one `events_<timestamp>.jsonl` file per bus.
    #[serde(default = "default_event_log_directory")]
    pub directory: PathBuf,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_event_log_directory(),
        }
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> InternalResult<T> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| Error::Internal(format!("Failed to open config file {}: {}", path.display(), e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Internal(format!("Failed to parse config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> InternalResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Internal(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(100)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_max_recorded_errors() -> usize {
    1000
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_store_path() -> PathBuf {
    PathBuf::from("sessionbus-pending.json")
}
fn default_event_log_directory() -> PathBuf {
    PathBuf::from("logs")
}

pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
