//! HTTP publisher: same grouped-JSON contract, simple fixed-backoff retry
//! on send failure (§4.8). Grounded on the teacher's `HttpClient`
//! (`reqwest::ClientBuilder`, configurable method/headers/timeout).

use super::{group_samples, validate_payload_shape};
use crate::batch::BatchTracker;
use crate::metrics::Metrics;
use crate::queue::TelemetryQueue;
use crate::retry::{PersistentRetryQueue, Priority};
use gw_common::model::HttpServerConfig;
use gw_common::ports::{BlobStore, RtcClock};
use log::{info, warn};
use reqwest::{Client, Method};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const BATCH_WAIT_TIMEOUT_MS: u64 = 60_000;
const FIXED_RETRY_BACKOFF_MS: u64 = 500;

pub struct HttpPublisher<R: RtcClock, S: BlobStore> {
    cfg: HttpServerConfig,
    client: Client,
    queue: Arc<TelemetryQueue>,
    batch: Arc<BatchTracker>,
    metrics: Arc<Metrics>,
    clock: Arc<R>,
    retry_queue: Arc<PersistentRetryQueue<S>>,
    last_publish: Mutex<u64>,
    first_publish_ready_tick: Mutex<Option<u64>>,
}

impl<R: RtcClock, S: BlobStore> HttpPublisher<R, S> {
    pub fn new(
        cfg: HttpServerConfig,
        queue: Arc<TelemetryQueue>,
        batch: Arc<BatchTracker>,
        metrics: Arc<Metrics>,
        clock: Arc<R>,
        retry_queue: Arc<PersistentRetryQueue<S>>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .expect("reqwest client builds with static config");
        Self {
            cfg,
            client,
            queue,
            batch,
            metrics,
            clock,
            retry_queue,
            last_publish: Mutex::new(0),
            first_publish_ready_tick: Mutex::new(None),
        }
    }

    fn method(&self) -> Method {
        Method::from_bytes(self.cfg.method.as_bytes()).unwrap_or(Method::POST)
    }

    pub async fn tick(&self) {
        let now = self.clock.millis();
        let batch_ready = self.batch.has_complete_batch();

        if batch_ready {
            *self.first_publish_ready_tick.lock().await = None;
        } else {
            let mut first_tick = self.first_publish_ready_tick.lock().await;
            if first_tick.is_none() {
                *first_tick = Some(now);
            }
        }
        let wait_timeout_hit = {
            let first_tick = *self.first_publish_ready_tick.lock().await;
            first_tick.map(|t| now.wrapping_sub(t) >= BATCH_WAIT_TIMEOUT_MS).unwrap_or(false)
        };
        if !batch_ready && !wait_timeout_hit {
            return;
        }

        let mut last_publish = self.last_publish.lock().await;
        if now.wrapping_sub(*last_publish) < self.cfg.interval_ms() {
            return;
        }

        let samples = self.queue.drain_all();
        if samples.is_empty() {
            return;
        }
        self.publish_group(&samples).await;
        *last_publish = now;
    }

    async fn publish_group(&self, samples: &[gw_common::model::TelemetrySample]) {
        let grouped = group_samples(samples, &|_| true, self.clock.now_wall(), self.clock.millis());
        let payload = grouped.json.to_string();

        if !validate_payload_shape(&payload) {
            warn!("http publish aborted: malformed payload shape");
            return;
        }
        if grouped.skipped_registers > 0 {
            info!(
                "skipped {} registers from {} deleted devices",
                grouped.skipped_registers, grouped.skipped_from_devices
            );
        }

        if self.send_with_retry(&payload).await {
            self.metrics.incr_publish_ok();
            for device_id in &grouped.covered_devices {
                self.batch.clear(device_id);
            }
        } else {
            self.metrics.incr_publish_failed();
            let now = self.clock.millis();
            if self
                .retry_queue
                .enqueue(self.cfg.endpoint_url.clone(), payload.into_bytes(), Priority::Normal, now, 24 * 3600 * 1000)
                .await
                .is_err()
            {
                self.metrics.incr_retry_queue_dropped();
            }
        }
    }

    /// Replays one record from the persistent retry queue (§4.9 "replay on
    /// reconnect"): pops highest-priority/oldest, republishes, acks on
    /// success, requeues with `attempts` incremented on failure.
    pub async fn drain_retry_queue(&self) {
        let Ok(Some((blob_id, record))) = self.retry_queue.peek_next().await else {
            return;
        };
        let Ok(payload) = String::from_utf8(record.payload.clone()) else {
            warn!("dropping corrupt retry record {blob_id}: not valid utf-8");
            let _ = self.retry_queue.ack_success(blob_id).await;
            return;
        };
        if self.send_once(&payload).await {
            let _ = self.retry_queue.ack_success(blob_id).await;
        } else {
            let now = self.clock.millis();
            let _ = self.retry_queue.requeue_failure(blob_id, record, now).await;
        }
    }

    async fn send_with_retry(&self, payload: &str) -> bool {
        for attempt in 0..=self.cfg.retry {
            if self.send_once(payload).await {
                return true;
            }
            if attempt < self.cfg.retry {
                tokio::time::sleep(Duration::from_millis(FIXED_RETRY_BACKOFF_MS)).await;
            }
        }
        false
    }

    async fn send_once(&self, payload: &str) -> bool {
        let mut request = self.client.request(self.method(), &self.cfg.endpoint_url);
        for (key, value) in &self.cfg.headers {
            request = request.header(key, value);
        }
        if self.method() != Method::GET {
            request = request.header("Content-Type", "application/json").body(payload.to_string());
        }
        match request.send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("http publish failed with status {}", resp.status());
                false
            }
            Err(e) => {
                warn!("http publish error: {e}");
                false
            }
        }
    }
}
