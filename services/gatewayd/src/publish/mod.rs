//! Shared payload construction for MQTT/HTTP publishers (§4.7, §4.8): both
//! transports consume the same queue contract and emit the same grouped
//! JSON shape.

pub mod http;
pub mod mqtt;

use chrono::{DateTime, Utc};
use gw_common::model::TelemetrySample;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Groups drained samples by device, skipping registers with no name/value
/// (there are none in practice since `TelemetrySample` always carries
/// both, but the skip rule is named explicitly in §4.7) and devices that
/// no longer exist in configuration. Returns the JSON payload plus the
/// set of device ids it actually covers (for `BatchTracker::clear`) and a
/// count of registers skipped due to deletion, for the aggregate log line.
pub struct GroupedPayload {
    pub json: Value,
    pub covered_devices: Vec<String>,
    pub skipped_registers: u64,
    pub skipped_from_devices: u64,
}

pub fn group_samples(
    samples: &[TelemetrySample],
    live_device_ids: &dyn Fn(&str) -> bool,
    now_wall: Option<DateTime<Utc>>,
    now_millis: u64,
) -> GroupedPayload {
    let mut devices: Map<String, Value> = Map::new();
    let mut device_names: HashMap<String, String> = HashMap::new();
    let mut skipped_registers = 0u64;
    let mut skipped_device_ids: std::collections::HashSet<String> = std::collections::HashSet::new();

    for sample in samples {
        if sample.register_name.is_empty() {
            continue; // "missing name" - silently skipped per §4.7
        }
        if !live_device_ids(&sample.device_id) {
            skipped_registers += 1;
            skipped_device_ids.insert(sample.device_id.clone());
            continue;
        }
        device_names.entry(sample.device_id.clone()).or_insert_with(|| sample.device_name.clone());
        let entry = devices
            .entry(sample.device_id.clone())
            .or_insert_with(|| json!({ "device_name": sample.device_name }));
        if let Value::Object(map) = entry {
            map.insert(
                sample.register_name.clone(),
                json!({ "value": sample.value, "unit": sample.unit }),
            );
        }
    }

    let covered_devices: Vec<String> = devices.keys().cloned().collect();

    let timestamp = match now_wall {
        Some(dt) => dt.format("%d/%m/%Y %H:%M:%S").to_string(),
        None => now_millis.to_string(),
    };

    GroupedPayload {
        json: json!({ "timestamp": timestamp, "devices": Value::Object(devices) }),
        covered_devices,
        skipped_registers,
        skipped_from_devices: skipped_device_ids.len() as u64,
    }
}

/// §4.7: "validate the JSON's first character is `{` and last is `}`".
pub fn validate_payload_shape(payload: &str) -> bool {
    let trimmed = payload.trim();
    trimmed.starts_with('{') && trimmed.ends_with('}')
}

/// §4.7: `total_registers*70 + 1000`, clamped to `[4096, 16384]`.
pub fn optimal_buffer_size(total_registers: usize) -> usize {
    (total_registers * 70 + 1000).clamp(4096, 16384)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(device_id: &str, register_name: &str, value: f64) -> TelemetrySample {
        TelemetrySample {
            device_id: device_id.into(),
            device_name: format!("{device_id}-name"),
            register_id: "R1".into(),
            register_name: register_name.into(),
            register_index: 0,
            address: 0,
            unit: "degC".into(),
            description: String::new(),
            value,
            timestamp: 0,
        }
    }

    #[test]
    fn groups_by_device_and_nests_register_values() {
        let samples = vec![sample("d1", "Temperature", 100.5), sample("d1", "Humidity", 40.0)];
        let grouped = group_samples(&samples, &|_| true, None, 1000);
        let devices = grouped.json["devices"].as_object().unwrap();
        assert_eq!(devices["d1"]["Temperature"]["value"], 100.5);
        assert_eq!(devices["d1"]["Humidity"]["value"], 40.0);
    }

    #[test]
    fn skips_registers_from_deleted_devices() {
        let samples = vec![sample("d1", "Temperature", 1.0), sample("gone", "Pressure", 2.0)];
        let grouped = group_samples(&samples, &|id| id == "d1", None, 0);
        assert_eq!(grouped.skipped_registers, 1);
        assert_eq!(grouped.skipped_from_devices, 1);
        assert!(!grouped.json["devices"].as_object().unwrap().contains_key("gone"));
    }

    #[test]
    fn skips_registers_with_empty_name() {
        let samples = vec![sample("d1", "", 1.0)];
        let grouped = group_samples(&samples, &|_| true, None, 0);
        assert!(grouped.json["devices"].as_object().unwrap().is_empty());
    }

    #[test]
    fn buffer_size_clamped() {
        assert_eq!(optimal_buffer_size(0), 4096);
        assert_eq!(optimal_buffer_size(10), 4096); // 10*70+1000=1700, clamped up
        assert_eq!(optimal_buffer_size(1000), 16384); // 71000 clamped down
        assert_eq!(optimal_buffer_size(50), 4500);
    }

    #[test]
    fn payload_shape_validation() {
        assert!(validate_payload_shape("{\"a\":1}"));
        assert!(!validate_payload_shape("[1,2,3]"));
        assert!(!validate_payload_shape(""));
    }
}
