//! MQTT publisher: default/customize topic modes, dynamic buffer sizing,
//! batch-gated publish cadence (§4.7). Grounded on the teacher's
//! `MqttClient` (`rumqttc::AsyncClient` + background event-loop task).

use super::{group_samples, optimal_buffer_size, validate_payload_shape};
use crate::batch::BatchTracker;
use crate::metrics::Metrics;
use crate::queue::TelemetryQueue;
use crate::retry::{PersistentRetryQueue, Priority};
use gw_common::model::{MqttServerConfig, PublishMode, TelemetrySample};
use gw_common::ports::{BlobStore, RtcClock};
use log::{info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const BATCH_WAIT_TIMEOUT_MS: u64 = 60_000;
const RECONNECT_THROTTLE_MS: u64 = 5_000;
const SOCKET_TIMEOUT_SECS: u64 = 15;
const POST_PUBLISH_DELAY_MS: u64 = 100;

pub struct MqttPublisher<R: RtcClock, S: BlobStore> {
    cfg: MqttServerConfig,
    queue: Arc<TelemetryQueue>,
    batch: Arc<BatchTracker>,
    metrics: Arc<Metrics>,
    clock: Arc<R>,
    retry_queue: Arc<PersistentRetryQueue<S>>,
    client: Mutex<Option<AsyncClient>>,
    connected: Arc<AtomicBool>,
    first_publish_ready_tick: Mutex<Option<u64>>,
    default_last_publish: Mutex<u64>,
    custom_last_publish: Mutex<HashMap<String, u64>>,
    incoming_writes: Mutex<Option<mpsc::UnboundedReceiver<(String, Vec<u8>)>>>,
}

impl<R: RtcClock, S: BlobStore> MqttPublisher<R, S> {
    pub fn new(
        cfg: MqttServerConfig,
        queue: Arc<TelemetryQueue>,
        batch: Arc<BatchTracker>,
        metrics: Arc<Metrics>,
        clock: Arc<R>,
        retry_queue: Arc<PersistentRetryQueue<S>>,
    ) -> Self {
        Self {
            cfg,
            queue,
            batch,
            metrics,
            clock,
            retry_queue,
            client: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            first_publish_ready_tick: Mutex::new(None),
            default_last_publish: Mutex::new(0),
            custom_last_publish: Mutex::new(HashMap::new()),
            incoming_writes: Mutex::new(None),
        }
    }

    pub async fn connect(&self, total_registers: usize) {
        let mut opts = MqttOptions::new(&self.cfg.client_id, &self.cfg.broker_address, self.cfg.broker_port);
        opts.set_keep_alive(Duration::from_secs(self.cfg.keep_alive_s));
        opts.set_connection_timeout(SOCKET_TIMEOUT_SECS);
        if let (Some(u), Some(p)) = (&self.cfg.username, &self.cfg.password) {
            opts.set_credentials(u, p);
        }
        let buf = optimal_buffer_size(total_registers);
        opts.set_max_packet_size(buf, buf);

        let (client, mut event_loop) = AsyncClient::new(opts, 10);
        let connected = self.connected.clone();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        connected.store(true, Ordering::SeqCst);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt disconnected");
                        connected.store(false, Ordering::SeqCst);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let _ = write_tx.send((publish.topic, publish.payload.to_vec()));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt event loop error: {e}");
                        connected.store(false, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(RECONNECT_THROTTLE_MS)).await;
                    }
                }
            }
        });
        *self.client.lock().await = Some(client);
        *self.incoming_writes.lock().await = Some(write_rx);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Subscribes to a topic filter (e.g. the remote-write command
    /// namespace). Returns `false` if the client isn't connected yet.
    pub async fn subscribe(&self, topic_filter: &str) -> bool {
        let client = self.client.lock().await;
        let Some(client) = client.as_ref() else {
            return false;
        };
        client.subscribe(topic_filter, QoS::AtLeastOnce).await.is_ok()
    }

    /// Waits for the next inbound message on a subscribed topic (§4.10's
    /// write-command intake). `None` once the underlying channel closes.
    pub async fn recv_subscribed_message(&self) -> Option<(String, Vec<u8>)> {
        let mut guard = self.incoming_writes.lock().await;
        guard.as_mut()?.recv().await
    }

    /// Publishes a pre-built response payload (§4.10's `.../response` topic)
    /// without going through the telemetry batch/retry path.
    pub async fn publish_response(&self, topic: &str, payload: &str) -> bool {
        self.send(topic, payload).await
    }

    /// One tick of the publisher's loop: checks interval + batch-gate, then
    /// publishes default and/or customize topics as due (§4.7).
    pub async fn tick(&self) {
        let now = self.now_millis();
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

        match self.cfg.publish_mode {
            PublishMode::Default => self.tick_default(now).await,
            PublishMode::Customize => self.tick_customize(now).await,
        }
    }

    async fn tick_default(&self, now: u64) {
        let Some(topic_spec) = &self.cfg.default_topic else {
            return;
        };
        let mut last_publish = self.default_last_publish.lock().await;
        if now.wrapping_sub(*last_publish) < topic_spec.interval_ms() {
            return;
        }
        let samples = self.queue.drain_all();
        if samples.is_empty() {
            return;
        }
        self.publish_group(&topic_spec.topic, &samples).await;
        *last_publish = now;
    }

    async fn tick_customize(&self, now: u64) {
        let samples = self.queue.drain_all();
        if samples.is_empty() {
            return;
        }
        for topic in &self.cfg.custom_topics {
            let mut last_publish = self.custom_last_publish.lock().await;
            let last = *last_publish.get(&topic.topic).unwrap_or(&0);
            if now.wrapping_sub(last) < topic.interval_ms() {
                continue;
            }
            let filtered: Vec<TelemetrySample> = samples
                .iter()
                .filter(|s| topic.registers.contains(&s.register_id))
                .cloned()
                .collect();
            if filtered.is_empty() {
                continue;
            }
            drop(last_publish);
            self.publish_group(&topic.topic, &filtered).await;
            self.custom_last_publish.lock().await.insert(topic.topic.clone(), now);
        }
    }

    async fn publish_group(&self, topic: &str, samples: &[TelemetrySample]) {
        let grouped = group_samples(samples, &|_| true, self.clock.now_wall(), self.clock.millis());
        let payload = grouped.json.to_string();

        if !validate_payload_shape(&payload) {
            warn!("mqtt publish aborted: malformed payload shape");
            return;
        }
        if grouped.skipped_registers > 0 {
            info!(
                "skipped {} registers from {} deleted devices",
                grouped.skipped_registers, grouped.skipped_from_devices
            );
        }

        let published = self.send(topic, &payload).await;
        if published {
            self.metrics.incr_publish_ok();
            for device_id in &grouped.covered_devices {
                self.batch.clear(device_id);
            }
            tokio::time::sleep(Duration::from_millis(POST_PUBLISH_DELAY_MS)).await;
        } else {
            self.metrics.incr_publish_failed();
            let now = self.now_millis();
            if self
                .retry_queue
                .enqueue(topic.to_string(), payload.into_bytes(), Priority::Normal, now, 24 * 3600 * 1000)
                .await
                .is_err()
            {
                self.metrics.incr_retry_queue_dropped();
            }
        }
    }

    /// Replays one record from the persistent retry queue once transport is
    /// connected (§4.9 "replay on reconnect"): pops highest-priority/oldest,
    /// republishes, acks on success, requeues with `attempts` incremented on
    /// failure.
    pub async fn drain_retry_queue(&self) {
        if !self.is_connected() {
            return;
        }
        let Ok(Some((blob_id, record))) = self.retry_queue.peek_next().await else {
            return;
        };
        let Ok(payload) = String::from_utf8(record.payload.clone()) else {
            warn!("dropping corrupt retry record {blob_id}: not valid utf-8");
            let _ = self.retry_queue.ack_success(blob_id).await;
            return;
        };
        if self.send(&record.topic, &payload).await {
            let _ = self.retry_queue.ack_success(blob_id).await;
        } else {
            let now = self.now_millis();
            let _ = self.retry_queue.requeue_failure(blob_id, record, now).await;
        }
    }

    async fn send(&self, topic: &str, payload: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let client = self.client.lock().await;
        let Some(client) = client.as_ref() else {
            return false;
        };
        // Owned copies avoid aliasing the caller's buffers across the await point.
        let topic = topic.to_string();
        let payload = payload.as_bytes().to_vec();
        client.publish(topic, QoS::AtLeastOnce, false, payload).await.is_ok()
    }

    fn now_millis(&self) -> u64 {
        self.clock.millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sizing_matches_formula() {
        assert_eq!(optimal_buffer_size(20), 4096);
        assert_eq!(optimal_buffer_size(200), 15000);
    }
}
