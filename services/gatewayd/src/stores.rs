//! Default implementations of the external-collaborator traits
//! (`ConfigStore`, `RtcClock`, `BlobStore`) so `gatewayd` can run
//! standalone. Production deployments replace these with the BLE-backed
//! config store and persistent clock/filesystem services named in §1 as
//! out-of-scope collaborators; these are the minimal stand-ins the
//! binary wires up by default.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gw_common::model::{DeviceConfig, DeviceId, ServerConfig};
use gw_common::ports::{BlobRecord, BlobStore, ChangeNotifier, ConfigStore, RtcClock};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;
use tokio::fs;
use tokio::sync::watch;

/// Loads devices and server config from a single JSON file and exposes
/// changes via a `tokio::sync::watch` channel triggered by `reload`.
pub struct FileConfigStore {
    devices: Mutex<Vec<DeviceConfig>>,
    server_config: Mutex<ServerConfig>,
    change_tx: watch::Sender<u64>,
    change_rx: watch::Receiver<u64>,
}

#[derive(serde::Deserialize)]
struct StoreFile {
    devices: Vec<DeviceConfig>,
    server: ServerConfig,
}

impl FileConfigStore {
    pub async fn load(path: &str) -> std::io::Result<Self> {
        let bytes = fs::read(path).await?;
        let parsed: StoreFile = serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let (change_tx, change_rx) = watch::channel(0);
        Ok(Self {
            devices: Mutex::new(parsed.devices),
            server_config: Mutex::new(parsed.server),
            change_tx,
            change_rx,
        })
    }

    pub fn replace(&self, devices: Vec<DeviceConfig>, server: ServerConfig) {
        *self.devices.lock().unwrap() = devices;
        *self.server_config.lock().unwrap() = server;
        self.change_tx.send_modify(|v| *v = v.wrapping_add(1));
    }
}

struct WatchNotifier(watch::Receiver<u64>);

#[async_trait]
impl ChangeNotifier for WatchNotifier {
    async fn changed(&mut self) -> bool {
        self.0.changed().await.is_ok()
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn list_devices(&self) -> Vec<DeviceId> {
        self.devices.lock().unwrap().iter().map(|d| d.device_id.clone()).collect()
    }

    async fn read_device(&self, id: &str) -> Option<DeviceConfig> {
        self.devices.lock().unwrap().iter().find(|d| d.device_id == id).cloned()
    }

    async fn get_server_config(&self) -> ServerConfig {
        self.server_config.lock().unwrap().clone()
    }

    fn subscribe_changes(&self) -> Box<dyn ChangeNotifier> {
        Box::new(WatchNotifier(self.change_rx.clone()))
    }
}

/// Monotonic clock anchored at process start, with wall-clock readings
/// coming from the system clock (stand-in for a hardware RTC that may be
/// unsynced at boot).
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RtcClock for SystemClock {
    fn now_wall(&self) -> Option<DateTime<Utc>> {
        Some(Utc::now())
    }

    fn millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// One file per record under `dir`, named by a monotonically increasing id.
pub struct FileBlobStore {
    dir: PathBuf,
    next_id: Mutex<u64>,
}

impl FileBlobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let mut max_id = 0u64;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = name.parse::<u64>() {
                    max_id = max_id.max(id + 1);
                }
            }
        }
        Ok(Self { dir, next_id: Mutex::new(max_id) })
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn append(&self, bytes: Vec<u8>) -> std::io::Result<u64> {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            id
        };
        fs::write(self.dir.join(id.to_string()), bytes).await?;
        Ok(id)
    }

    async fn iterate(&self) -> std::io::Result<Vec<BlobRecord>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = name.parse::<u64>() {
                    let bytes = fs::read(entry.path()).await?;
                    out.push(BlobRecord { id, bytes });
                }
            }
        }
        Ok(out)
    }

    async fn delete(&self, id: u64) -> std::io::Result<()> {
        let path = self.dir.join(id.to_string());
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_blob_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).await.unwrap();
        let id = store.append(b"hello".to_vec()).await.unwrap();
        let records = store.iterate().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        store.delete(id).await.unwrap();
        assert!(store.iterate().await.unwrap().is_empty());
    }

    #[test]
    fn system_clock_millis_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.millis();
        let b = clock.millis();
        assert!(b >= a);
    }
}
