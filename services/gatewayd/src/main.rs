mod batch;
mod config;
mod failure;
mod identity;
mod metrics;
mod publish;
mod queue;
mod remote_write;
mod retry;
mod scheduler;
mod stores;

use crate::batch::BatchTracker;
use crate::config::GatewayProcessConfig;
use crate::metrics::Metrics;
use crate::publish::http::HttpPublisher;
use crate::publish::mqtt::MqttPublisher;
use crate::queue::TelemetryQueue;
use crate::remote_write::{self, WriteErrorCode, WriteTargetMap};
use crate::retry::PersistentRetryQueue;
use crate::scheduler::PollingScheduler;
use crate::stores::{FileBlobStore, FileConfigStore, SystemClock};
use clap::Parser;
use gw_common::model::ServerProtocol;
use gw_common::ports::{ConfigStore, RtcClock};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the process configuration file (TOML)
    #[clap(short, long, default_value = "gatewayd.toml")]
    config: PathBuf,
    /// Path to the device/server config snapshot (JSON, until a real
    /// BLE-backed ConfigStore is wired up)
    #[clap(short = 'd', long, default_value = "devices.json")]
    devices: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let process_cfg = GatewayProcessConfig::load(args.config.to_str().unwrap_or("gatewayd.toml"));
    init_logging(&process_cfg);

    info!("starting gatewayd");

    let config_store = match FileConfigStore::load(args.devices.to_str().unwrap_or("devices.json")).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to load device configuration: {e}");
            std::process::exit(1);
        }
    };

    let clock = Arc::new(SystemClock::new());
    let queue = Arc::new(TelemetryQueue::new(process_cfg.queue_capacity));
    let batch = Arc::new(BatchTracker::new());
    let metrics = Arc::new(Metrics::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let blob_store = match FileBlobStore::open(&process_cfg.retry_store_path).await {
        Ok(store) => store,
        Err(e) => {
            error!("failed to open retry store at {}: {e}", process_cfg.retry_store_path);
            std::process::exit(1);
        }
    };
    let retry_queue = Arc::new(
        PersistentRetryQueue::load(blob_store, clock.millis())
            .await
            .expect("retry store scan succeeds"),
    );

    let scheduler = Arc::new(PollingScheduler::new(
        config_store.clone(),
        clock.clone(),
        queue.clone(),
        batch.clone(),
        metrics.clone(),
        process_cfg.rtu_port1_path.clone(),
        process_cfg.rtu_port2_path.clone(),
        shutdown.clone(),
    ));

    let server_cfg = config_store.get_server_config().await;
    let total_registers: usize = {
        let mut total = 0;
        for device_id in config_store.list_devices().await {
            if let Some(device) = config_store.read_device(&device_id).await {
                total += device.registers.len();
            }
        }
        total
    };

    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    // §9 Open Question 3 / SPEC_FULL §E.3: exactly one publisher task runs,
    // selected by `ServerConfig::protocol`.
    let mut background_tasks = vec![scheduler_task];

    match server_cfg.protocol {
        ServerProtocol::Mqtt => {
            let Some(mqtt_cfg) = server_cfg.mqtt.clone() else {
                error!("protocol=MQTT but no mqtt block configured");
                std::process::exit(1);
            };
            let publisher = Arc::new(MqttPublisher::new(
                mqtt_cfg,
                queue.clone(),
                batch.clone(),
                metrics.clone(),
                clock.clone(),
                retry_queue.clone(),
            ));
            publisher.connect(total_registers).await;

            background_tasks.push(tokio::spawn({
                let publisher = publisher.clone();
                async move {
                    loop {
                        publisher.tick().await;
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }));

            background_tasks.push(tokio::spawn({
                let publisher = publisher.clone();
                async move {
                    loop {
                        publisher.drain_retry_queue().await;
                        tokio::time::sleep(Duration::from_millis(1000)).await;
                    }
                }
            }));

            if server_cfg.subscribe.enabled {
                background_tasks.push(tokio::spawn(remote_write_dispatcher(
                    publisher,
                    scheduler.clone(),
                    config_store.clone(),
                    server_cfg.subscribe.topic_prefix.clone(),
                )));
            }
        }
        ServerProtocol::Http => {
            let Some(http_cfg) = server_cfg.http.clone() else {
                error!("protocol=HTTP but no http block configured");
                std::process::exit(1);
            };
            let publisher = Arc::new(HttpPublisher::new(
                http_cfg,
                queue.clone(),
                batch.clone(),
                metrics.clone(),
                clock.clone(),
                retry_queue.clone(),
            ));

            background_tasks.push(tokio::spawn({
                let publisher = publisher.clone();
                async move {
                    loop {
                        publisher.tick().await;
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }));

            background_tasks.push(tokio::spawn({
                let publisher = publisher.clone();
                async move {
                    loop {
                        publisher.drain_retry_queue().await;
                        tokio::time::sleep(Duration::from_millis(1000)).await;
                    }
                }
            }));
        }
    };

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    shutdown.store(true, std::sync::atomic::Ordering::Relaxed);

    for task in background_tasks {
        let _ = task.await;
    }
}

/// Subscribes to `{topic_prefix}/write/+/+`, resolves each inbound message
/// to a device/register via `WriteTargetMap`, serializes the Modbus write
/// through the scheduler's bus mutex, and publishes the `.../response`
/// (§4.10, C10). Runs only when `subscribe.enabled` and `protocol == Mqtt`.
async fn remote_write_dispatcher<C, R>(
    publisher: Arc<MqttPublisher<R, FileBlobStore>>,
    scheduler: Arc<PollingScheduler<C, R>>,
    config_store: Arc<C>,
    topic_prefix: String,
) where
    C: ConfigStore,
    R: RtcClock,
{
    let devices = {
        let mut devices = Vec::new();
        for device_id in config_store.list_devices().await {
            if let Some(device) = config_store.read_device(&device_id).await {
                devices.push(device);
            }
        }
        devices
    };
    let target_map = WriteTargetMap::build(&devices);

    let filter = format!("{topic_prefix}/write/+/+");
    if !publisher.subscribe(&filter).await {
        warn!("failed to subscribe to remote-write topic filter {filter}");
    }

    let write_prefix = format!("{topic_prefix}/write/");
    loop {
        let Some((topic, payload_bytes)) = publisher.recv_subscribed_message().await else {
            return;
        };
        let Some(suffix) = topic.strip_prefix(&write_prefix) else {
            continue;
        };
        let mut parts = suffix.splitn(2, '/');
        let (Some(device_id), Some(register_id)) = (parts.next(), parts.next()) else {
            continue;
        };
        let payload = String::from_utf8_lossy(&payload_bytes).to_string();
        let response_topic = remote_write::response_topic(&remote_write::write_topic(&topic_prefix, device_id, register_id));

        let response = match target_map.resolve(register_id) {
            Some((expected_device, _)) if expected_device == device_id => {
                match config_store.read_device(device_id).await {
                    Some(device) => match device.registers.iter().find(|r| r.register_id == register_id) {
                        Some(reg) => scheduler.handle_remote_write(&device, reg, &payload).await,
                        None => remote_write::dispatch_error(WriteErrorCode::UnknownTarget, "unknown register", 0.0),
                    },
                    None => remote_write::dispatch_error(WriteErrorCode::UnknownTarget, "unknown device", 0.0),
                }
            }
            _ => remote_write::dispatch_error(WriteErrorCode::UnknownTarget, "unknown write target", 0.0),
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
        publisher.publish_response(&response_topic, &body).await;
    }
}

fn init_logging(cfg: &GatewayProcessConfig) {
    let env = env_logger::Env::default().filter_or("RUST_LOG", &cfg.log_level);
    env_logger::Builder::from_env(env).format_timestamp_millis().init();
    info!("logging initialized at level: {}", cfg.log_level);
}
