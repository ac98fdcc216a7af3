//! Cooperative polling loop driving the two RTU buses and the pooled TCP
//! endpoints (§4.4, §5). Grounded on the teacher's polling task shape,
//! generalized from a single comsrv protocol to the two-bus + TCP-pool
//! model this gateway requires.

use crate::batch::BatchTracker;
use crate::failure::DeviceFailureTracker;
use crate::metrics::Metrics;
use crate::queue::TelemetryQueue;
use crate::remote_write::{self, WriteErrorCode, WriteResponse};
use gw_common::model::{DeviceConfig, DeviceProtocol, RegisterConfig};
use gw_common::ports::{ConfigStore, RtcClock};
use gw_common::model::TelemetrySample;
use gw_modbus::bus::{BusDriver, RtuBusDriver, TcpBusDriver};
use gw_modbus::decoder::decode_register;
use gw_modbus::pdu::{build_read_request, parse_read_response, ReadPayload};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

const LOOP_IDLE_DELAY_MS: u64 = 2000;
const INTER_REGISTER_DELAY_MS: u64 = 100;
const RTU_LINE_TURNAROUND_MS: u64 = 100;
const TCP_IDLE_CLOSE_SECS: u64 = 30;
const BUS_MUTEX_ACQUIRE_TIMEOUT_MS: u64 = 2000;

struct RtuBus {
    driver: Option<RtuBusDriver>,
    path: String,
    current_baud: Option<u32>,
}

pub struct PollingScheduler<C, R> {
    config_store: Arc<C>,
    clock: Arc<R>,
    queue: Arc<TelemetryQueue>,
    batch: Arc<BatchTracker>,
    metrics: Arc<Metrics>,
    failures: AsyncMutex<DeviceFailureTracker>,
    rtu_buses: [AsyncMutex<RtuBus>; 2],
    tcp_pool: AsyncMutex<HashMap<String, Arc<AsyncMutex<(TcpBusDriver, u64)>>>>,
    last_poll: AsyncMutex<HashMap<String, u64>>,
    shutdown: Arc<AtomicBool>,
}

impl<C, R> PollingScheduler<C, R>
where
    C: ConfigStore,
    R: RtcClock,
{
    pub fn new(
        config_store: Arc<C>,
        clock: Arc<R>,
        queue: Arc<TelemetryQueue>,
        batch: Arc<BatchTracker>,
        metrics: Arc<Metrics>,
        rtu_port1_path: String,
        rtu_port2_path: String,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config_store,
            clock,
            queue,
            batch,
            metrics,
            failures: AsyncMutex::new(DeviceFailureTracker::new()),
            rtu_buses: [
                AsyncMutex::new(RtuBus { driver: None, path: rtu_port1_path, current_baud: None }),
                AsyncMutex::new(RtuBus { driver: None, path: rtu_port2_path, current_baud: None }),
            ],
            tcp_pool: AsyncMutex::new(HashMap::new()),
            last_poll: AsyncMutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Main loop: rebuild device list if changed, poll every due device,
    /// sleep 2s when idle (§4.4.4). Runs until the shutdown flag is set.
    pub async fn run(&self) {
        let mut notifier = self.config_store.subscribe_changes();
        let mut devices = self.config_store.list_devices().await;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("scheduler shutting down");
                return;
            }

            if notifier.changed().await {
                devices = self.config_store.list_devices().await;
                info!("config change detected, rebuilt device list ({} devices)", devices.len());
            }

            let mut any_due = false;
            for device_id in &devices {
                let Some(cfg) = self.config_store.read_device(device_id).await else {
                    continue;
                };
                if !cfg.enabled {
                    continue;
                }
                let now = self.clock.millis();
                if !self.is_due(&cfg, now).await {
                    continue;
                }
                let allowed = {
                    let mut failures = self.failures.lock().await;
                    failures.should_attempt(&cfg.device_id, now)
                };
                if !allowed {
                    continue;
                }
                any_due = true;
                self.poll_device(&cfg, now).await;
            }

            self.evict_idle_tcp_connections().await;

            if !any_due {
                tokio::time::sleep(Duration::from_millis(LOOP_IDLE_DELAY_MS)).await;
            }
        }
    }

    /// Drops pooled TCP connections that have sat idle past `TCP_IDLE_CLOSE_SECS`
    /// (§5) so a dead/stale endpoint doesn't pin a socket open forever.
    async fn evict_idle_tcp_connections(&self) {
        let now = self.clock.millis();
        let mut pool = self.tcp_pool.lock().await;
        pool.retain(|endpoint, conn| {
            let Ok(guard) = conn.try_lock() else {
                return true;
            };
            let idle_ms = now.wrapping_sub(guard.1);
            if idle_ms >= TCP_IDLE_CLOSE_SECS * 1000 {
                info!("closing idle TCP endpoint {endpoint} after {idle_ms}ms idle");
                false
            } else {
                true
            }
        });
    }

    async fn is_due(&self, cfg: &DeviceConfig, now: u64) -> bool {
        let mut last_poll = self.last_poll.lock().await;
        let last = *last_poll.get(&cfg.device_id).unwrap_or(&0);
        now.wrapping_sub(last) >= cfg.refresh_rate_ms
    }

    async fn poll_device(&self, cfg: &DeviceConfig, now: u64) {
        self.batch.start(&cfg.device_id, cfg.registers.len() as u32);

        let result = match cfg.protocol {
            DeviceProtocol::Rtu => self.poll_rtu_device(cfg).await,
            DeviceProtocol::Tcp => self.poll_tcp_device(cfg).await,
        };

        self.batch.finish(&cfg.device_id);
        self.last_poll.lock().await.insert(cfg.device_id.clone(), now);

        let mut failures = self.failures.lock().await;
        if result.any_success {
            failures.record_success(&cfg.device_id, now);
        } else if result.any_timeout {
            let disabled = failures.record_timeout(&cfg.device_id, now);
            if disabled {
                warn!("device {} disabled after consecutive timeouts", cfg.device_id);
            }
        } else {
            let disabled = failures.record_failure(&cfg.device_id, now, cfg.max_retries);
            if disabled {
                warn!("device {} disabled after exceeding max retries", cfg.device_id);
            }
        }
    }

    async fn poll_rtu_device(&self, cfg: &DeviceConfig) -> PollOutcome {
        let bus_index = match cfg.serial_port {
            Some(1) => 0,
            Some(2) => 1,
            _ => {
                warn!("device {} has no valid serial_port, skipping", cfg.device_id);
                return PollOutcome::default();
            }
        };
        let baud = gw_common::model::coerce_baud_rate(cfg.baud_rate.unwrap_or(9600));

        let mut bus = self.rtu_buses[bus_index].lock().await;
        if bus.driver.is_none() || bus.current_baud != Some(baud) {
            match RtuBusDriver::open(&bus.path, baud) {
                Ok(driver) => {
                    bus.driver = Some(driver);
                    bus.current_baud = Some(baud);
                    tokio::time::sleep(Duration::from_millis(50)).await; // line stabilization
                }
                Err(e) => {
                    warn!("failed to open RTU bus {}: {e}", bus.path);
                    return PollOutcome::default();
                }
            }
        }

        let mut outcome = PollOutcome::default();
        for reg in &cfg.registers {
            match self.read_one(bus.driver.as_mut().unwrap(), cfg, reg).await {
                Ok(sample) => {
                    outcome.any_success = true;
                    self.enqueue_sample(sample);
                    self.batch.record_success(&cfg.device_id);
                }
                Err(e) => {
                    if matches!(e, gw_common::BusError::Timeout(_)) {
                        outcome.any_timeout = true;
                    }
                    warn!("register {} on {} failed: {e}", reg.register_id, cfg.device_id);
                    self.batch.record_failure(&cfg.device_id);
                }
            }
            tokio::time::sleep(Duration::from_millis(INTER_REGISTER_DELAY_MS)).await;
            tokio::time::sleep(Duration::from_millis(RTU_LINE_TURNAROUND_MS)).await;
        }
        outcome
    }

    async fn poll_tcp_device(&self, cfg: &DeviceConfig) -> PollOutcome {
        let Some(endpoint) = cfg.tcp_endpoint_key() else {
            warn!("device {} has no ip_address, skipping", cfg.device_id);
            return PollOutcome::default();
        };

        let conn = {
            let mut pool = self.tcp_pool.lock().await;
            if let Some(existing) = pool.get(&endpoint) {
                existing.clone()
            } else {
                match TcpBusDriver::connect(&endpoint).await {
                    Ok(driver) => {
                        let conn = Arc::new(AsyncMutex::new((driver, self.clock.millis())));
                        pool.insert(endpoint.clone(), conn.clone());
                        conn
                    }
                    Err(e) => {
                        warn!("failed to connect TCP endpoint {endpoint}: {e}");
                        return PollOutcome::default();
                    }
                }
            }
        };

        let mut guard = conn.lock().await;
        let (driver, last_used) = &mut *guard;
        *last_used = self.clock.millis();

        let mut outcome = PollOutcome::default();
        for reg in &cfg.registers {
            match self.read_one(driver, cfg, reg).await {
                Ok(sample) => {
                    outcome.any_success = true;
                    self.enqueue_sample(sample);
                    self.batch.record_success(&cfg.device_id);
                }
                Err(e) => {
                    if matches!(e, gw_common::BusError::Timeout(_)) {
                        outcome.any_timeout = true;
                    }
                    warn!("register {} on {} failed: {e}", reg.register_id, cfg.device_id);
                    self.batch.record_failure(&cfg.device_id);
                }
            }
            tokio::time::sleep(Duration::from_millis(INTER_REGISTER_DELAY_MS)).await;
        }
        outcome
    }

    async fn read_one(
        &self,
        driver: &mut dyn BusDriver,
        cfg: &DeviceConfig,
        reg: &RegisterConfig,
    ) -> Result<TelemetrySample, gw_common::BusError> {
        if !reg.address_in_range() {
            return Err(gw_common::BusError::InvalidAddress(format!(
                "register {} address {} overflows with word_count {}",
                reg.register_id, reg.address, reg.data_type.word_count()
            )));
        }

        let pdu = build_read_request(reg.function_code, reg.address, reg.data_type.word_count());
        let max_retries = cfg.max_retries;
        let timeout_ms = cfg.timeout_ms;
        let slave_id = cfg.slave_id;

        let resp = gw_modbus::bus::execute_with_retry(max_retries, 100, 1600, || {
            let pdu = pdu.clone();
            async { driver.request(slave_id, &pdu, timeout_ms).await }
        })
        .await?;

        let payload = parse_read_response(reg.function_code, &resp)
            .map_err(|_| gw_common::BusError::InvalidAddress("malformed response".into()))?;

        let raw_words = match payload {
            ReadPayload::Words(words) => words,
            ReadPayload::Bits(bits) => vec![if bits.first().copied().unwrap_or(false) { 1 } else { 0 }],
        };

        let value = decode_register(reg, &raw_words)
            .map_err(|e| gw_common::BusError::InvalidAddress(e.to_string()))?;

        let timestamp = self
            .clock
            .now_wall()
            .map(|dt| dt.timestamp() as u64)
            .unwrap_or_else(|| self.clock.millis() / 1000);

        Ok(TelemetrySample {
            device_id: cfg.device_id.clone(),
            device_name: cfg.device_name.clone(),
            register_id: reg.register_id.clone(),
            register_name: reg.register_name.clone(),
            register_index: reg.register_index,
            address: reg.address,
            unit: reg.unit.clone(),
            description: String::new(),
            value,
            timestamp,
        })
    }

    /// Serves one remote-write request against the same bus the poller
    /// uses, taking a short-lived lock against it (§4.10: "a short mutex
    /// against the polling scheduler on the same bus"). Times out the lock
    /// acquisition and reports `BusMutexTimeout` (315) rather than blocking
    /// indefinitely behind a stuck poll.
    pub async fn handle_remote_write(&self, device: &DeviceConfig, reg: &RegisterConfig, raw_payload: &str) -> WriteResponse {
        let timeout_ms = device.timeout_ms;
        let lock_timeout = Duration::from_millis(BUS_MUTEX_ACQUIRE_TIMEOUT_MS);

        match device.protocol {
            DeviceProtocol::Rtu => {
                let bus_index = match device.serial_port {
                    Some(1) => 0,
                    Some(2) => 1,
                    _ => return remote_write::dispatch_error(WriteErrorCode::UnknownTarget, "device has no valid serial_port", 0.0),
                };
                match tokio::time::timeout(lock_timeout, self.rtu_buses[bus_index].lock()).await {
                    Ok(mut bus) => {
                        let Some(driver) = bus.driver.as_mut() else {
                            return remote_write::dispatch_error(WriteErrorCode::UnknownTarget, "RTU bus not open", 0.0);
                        };
                        remote_write::handle_write(device, reg, raw_payload, driver, timeout_ms).await
                    }
                    Err(_) => remote_write::dispatch_error(WriteErrorCode::BusMutexTimeout, "timed out acquiring bus mutex", 0.0),
                }
            }
            DeviceProtocol::Tcp => {
                let Some(endpoint) = device.tcp_endpoint_key() else {
                    return remote_write::dispatch_error(WriteErrorCode::UnknownTarget, "device has no ip_address", 0.0);
                };
                let conn = {
                    let mut pool = self.tcp_pool.lock().await;
                    if let Some(existing) = pool.get(&endpoint) {
                        existing.clone()
                    } else {
                        match TcpBusDriver::connect(&endpoint).await {
                            Ok(driver) => {
                                let conn = Arc::new(AsyncMutex::new((driver, self.clock.millis())));
                                pool.insert(endpoint.clone(), conn.clone());
                                conn
                            }
                            Err(_) => {
                                return remote_write::dispatch_error(WriteErrorCode::BusMutexTimeout, "failed to connect TCP endpoint", 0.0)
                            }
                        }
                    }
                };
                match tokio::time::timeout(lock_timeout, conn.lock()).await {
                    Ok(mut guard) => {
                        guard.1 = self.clock.millis();
                        let (driver, _) = &mut *guard;
                        remote_write::handle_write(device, reg, raw_payload, driver, timeout_ms).await
                    }
                    Err(_) => remote_write::dispatch_error(WriteErrorCode::BusMutexTimeout, "timed out acquiring bus mutex", 0.0),
                }
            }
        }
    }

    fn enqueue_sample(&self, sample: TelemetrySample) {
        if self.queue.enqueue(sample) {
            self.metrics.incr_queue_dropped();
        }
    }
}

#[derive(Default)]
struct PollOutcome {
    any_success: bool,
    any_timeout: bool,
}
