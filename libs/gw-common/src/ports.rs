//! External collaborator interfaces (§6). The core depends only on these
//! traits; BLE framing, JSON CRUD dispatch, persistent config storage and
//! the real-time clock are out of scope and live behind implementations
//! supplied by the rest of the device firmware.

use crate::model::{DeviceConfig, DeviceId, ServerConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Fires whenever the configuration store's device list or any device's
/// registers change, so the scheduler can rebuild its working state.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn changed(&mut self) -> bool;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list_devices(&self) -> Vec<DeviceId>;
    async fn read_device(&self, id: &str) -> Option<DeviceConfig>;
    async fn get_server_config(&self) -> ServerConfig;
    fn subscribe_changes(&self) -> Box<dyn ChangeNotifier>;
}

pub trait RtcClock: Send + Sync {
    /// `None` when the clock has never synced to wall time.
    fn now_wall(&self) -> Option<DateTime<Utc>>;
    /// Monotonic milliseconds since boot. Used for interval comparisons;
    /// callers rely on wrapping subtraction, not absolute magnitude.
    fn millis(&self) -> u64;
}

/// A durable record in `PersistentRetryQueue`'s backing store.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlobRecord {
    pub id: u64,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn append(&self, bytes: Vec<u8>) -> std::io::Result<u64>;
    async fn iterate(&self) -> std::io::Result<Vec<BlobRecord>>;
    async fn delete(&self, id: u64) -> std::io::Result<()>;
}
