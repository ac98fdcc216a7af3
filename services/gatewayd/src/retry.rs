//! Durable FIFO of failed publishes with priority and expiry, replayed on
//! reconnect (§4.9). Backed by any `BlobStore` implementation.

use gw_common::ports::BlobStore;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub enqueue_time: u64,
    pub expiry_time: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct QueuedEntry {
    blob_id: u64,
    priority: Priority,
    enqueue_time: u64,
}

impl Ord for QueuedEntry {
    /// Strict priority first, then FIFO by `enqueue_time` within a priority
    /// bucket (Open Question resolution: strict over weighted-fair).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueue_time.cmp(&self.enqueue_time))
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct PersistentRetryQueue<S: BlobStore> {
    store: S,
    order: Mutex<BinaryHeap<QueuedEntry>>,
}

impl<S: BlobStore> PersistentRetryQueue<S> {
    /// Scans the backing store, drops expired records, and rebuilds the
    /// in-memory priority index (§4.9: "on startup, scan and drop records
    /// whose expiry_time < now").
    pub async fn load(store: S, now: u64) -> std::io::Result<Self> {
        let mut order = BinaryHeap::new();
        for blob in store.iterate().await? {
            match serde_json::from_slice::<RetryRecord>(&blob.bytes) {
                Ok(record) if record.expiry_time < now => {
                    store.delete(blob.id).await?;
                }
                Ok(record) => {
                    order.push(QueuedEntry {
                        blob_id: blob.id,
                        priority: record.priority,
                        enqueue_time: record.enqueue_time,
                    });
                }
                Err(_) => {
                    store.delete(blob.id).await?;
                }
            }
        }
        Ok(Self {
            store,
            order: Mutex::new(order),
        })
    }

    /// `now` and `ttl_ms` are both in milliseconds, matching `RtcClock::millis()`
    /// and the `expiry_time < now` comparison `load` makes on startup.
    pub async fn enqueue(&self, topic: String, payload: Vec<u8>, priority: Priority, now: u64, ttl_ms: u64) -> std::io::Result<()> {
        let record = RetryRecord {
            topic,
            payload,
            priority,
            enqueue_time: now,
            expiry_time: now + ttl_ms,
            attempts: 0,
        };
        let bytes = serde_json::to_vec(&record).expect("RetryRecord serializes");
        let id = self.store.append(bytes).await?;
        self.order.lock().unwrap().push(QueuedEntry {
            blob_id: id,
            priority,
            enqueue_time: now,
        });
        Ok(())
    }

    /// Pops the highest-priority, oldest-enqueued record without removing
    /// it from the backing store yet — callers confirm with `ack_success`
    /// or `requeue_failure`.
    pub async fn peek_next(&self) -> std::io::Result<Option<(u64, RetryRecord)>> {
        let entry = {
            let mut order = self.order.lock().unwrap();
            order.pop()
        };
        let Some(entry) = entry else {
            return Ok(None);
        };
        for blob in self.store.iterate().await? {
            if blob.id == entry.blob_id {
                let record: RetryRecord = serde_json::from_slice(&blob.bytes)
                    .unwrap_or_else(|_| panic!("corrupt retry record {}", blob.id));
                return Ok(Some((entry.blob_id, record)));
            }
        }
        Ok(None)
    }

    pub async fn ack_success(&self, blob_id: u64) -> std::io::Result<()> {
        self.store.delete(blob_id).await
    }

    /// Requeues at the tail of its priority bucket with `attempts`
    /// incremented (§4.9: "on failure, increment attempts and requeue at
    /// tail").
    pub async fn requeue_failure(&self, blob_id: u64, mut record: RetryRecord, now: u64) -> std::io::Result<()> {
        self.store.delete(blob_id).await?;
        record.attempts += 1;
        record.enqueue_time = now;
        let bytes = serde_json::to_vec(&record).expect("RetryRecord serializes");
        let id = self.store.append(bytes).await?;
        self.order.lock().unwrap().push(QueuedEntry {
            blob_id: id,
            priority: record.priority,
            enqueue_time: now,
        });
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.order.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gw_common::ports::BlobRecord;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemStore {
        next_id: AtomicU64,
        records: StdMutex<Vec<BlobRecord>>,
    }

    #[async_trait]
    impl BlobStore for MemStore {
        async fn append(&self, bytes: Vec<u8>) -> std::io::Result<u64> {
            let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
            self.records.lock().unwrap().push(BlobRecord { id, bytes });
            Ok(id)
        }

        async fn iterate(&self) -> std::io::Result<Vec<BlobRecord>> {
            Ok(self.records.lock().unwrap().clone())
        }

        async fn delete(&self, id: u64) -> std::io::Result<()> {
            self.records.lock().unwrap().retain(|r| r.id != id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn strict_priority_ordering() {
        let store = MemStore::default();
        let queue = PersistentRetryQueue::load(store, 0).await.unwrap();
        queue.enqueue("t1".into(), b"low".to_vec(), Priority::Low, 0, 86_400).await.unwrap();
        queue.enqueue("t2".into(), b"high".to_vec(), Priority::High, 1, 86_400).await.unwrap();
        queue.enqueue("t3".into(), b"normal".to_vec(), Priority::Normal, 2, 86_400).await.unwrap();

        let (_, first) = queue.peek_next().await.unwrap().unwrap();
        assert_eq!(first.priority, Priority::High);
    }

    #[tokio::test]
    async fn fifo_within_same_priority() {
        let store = MemStore::default();
        let queue = PersistentRetryQueue::load(store, 0).await.unwrap();
        queue.enqueue("t1".into(), b"first".to_vec(), Priority::Normal, 0, 86_400).await.unwrap();
        queue.enqueue("t2".into(), b"second".to_vec(), Priority::Normal, 1, 86_400).await.unwrap();

        let (_, first) = queue.peek_next().await.unwrap().unwrap();
        assert_eq!(first.topic, "t1");
    }

    #[tokio::test]
    async fn expired_records_dropped_on_load() {
        let store = MemStore::default();
        let expired = RetryRecord {
            topic: "old".into(),
            payload: vec![],
            priority: Priority::Normal,
            enqueue_time: 0,
            expiry_time: 10,
            attempts: 0,
        };
        store.append(serde_json::to_vec(&expired).unwrap()).await.unwrap();
        let queue = PersistentRetryQueue::load(store, 100).await.unwrap();
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn requeue_increments_attempts() {
        let store = MemStore::default();
        let queue = PersistentRetryQueue::load(store, 0).await.unwrap();
        queue.enqueue("t1".into(), b"x".to_vec(), Priority::Normal, 0, 86_400).await.unwrap();
        let (id, record) = queue.peek_next().await.unwrap().unwrap();
        queue.requeue_failure(id, record, 5).await.unwrap();
        let (_, requeued) = queue.peek_next().await.unwrap().unwrap();
        assert_eq!(requeued.attempts, 1);
    }
}
