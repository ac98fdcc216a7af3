//! Inbound remote-write path: subscribe topic -> validate -> single-shot
//! Modbus write -> response topic (§4.10). The closed error-code space
//! (301-305, 315-324, 331-334) is part of the external contract and must
//! not be renumbered.

use gw_common::model::{DeviceConfig, FunctionCode, RegisterConfig};
use gw_modbus::bus::BusDriver;
use gw_modbus::pdu::{build_write_single_coil, build_write_single_register, parse_write_response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorCode {
    BusMutexTimeout = 315,
    UnknownTarget = 316,
    UnsupportedFunctionCode = 317,
    NotWritable = 318,
    BelowMinimum = 319,
    AboveMaximum = 320,
    MalformedPayload = 321,
    ModbusExceptionIllegalFunction = 331,
    ModbusExceptionIllegalAddress = 332,
    ModbusExceptionIllegalValue = 333,
    ModbusExceptionSlaveFailure = 334,
    TransportTimeout = 301,
    TransportConnectionFailed = 302,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum WriteResponse {
    Ok {
        status: &'static str,
        value_written: f64,
        raw_value: f64,
        response_time_ms: u64,
    },
    Err {
        status: &'static str,
        error: String,
        error_code: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_value: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        min_value: Option<f64>,
        provided_value: f64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WritePayload {
    Bare(f64),
    Tagged { value: f64, #[allow(dead_code)] uuid: Option<String> },
}

impl WritePayload {
    fn value(&self) -> f64 {
        match self {
            WritePayload::Bare(v) => *v,
            WritePayload::Tagged { value, .. } => *value,
        }
    }
}

/// Maps `{topic_suffix}` back to `(device_id, register_id)`, rebuilt from
/// configuration whenever `ConfigStore` signals a change.
pub struct WriteTargetMap {
    by_suffix: HashMap<String, (String, String)>,
}

impl WriteTargetMap {
    pub fn build(devices: &[DeviceConfig]) -> Self {
        let mut by_suffix = HashMap::new();
        for device in devices {
            for reg in &device.registers {
                let suffix = reg.register_id.clone();
                by_suffix.insert(suffix, (device.device_id.clone(), reg.register_id.clone()));
            }
        }
        Self { by_suffix }
    }

    pub fn resolve(&self, topic_suffix: &str) -> Option<&(String, String)> {
        self.by_suffix.get(topic_suffix)
    }
}

/// `min_value`/`max_value` are passed explicitly rather than pulled
/// wholesale off the register: S6's normative payload for an above-maximum
/// rejection carries only `max_value`, not both bounds.
fn error_response(
    code: WriteErrorCode,
    message: &str,
    provided_value: f64,
    min_value: Option<f64>,
    max_value: Option<f64>,
) -> WriteResponse {
    WriteResponse::Err {
        status: "error",
        error: message.to_string(),
        error_code: code as u16,
        max_value,
        min_value,
        provided_value,
    }
}

/// Handles one inbound write message end to end. `bus` is already
/// serialized by the caller against the polling scheduler's bus mutex
/// (§4.10: "a short mutex against the polling scheduler on the same bus").
pub async fn handle_write(
    device: &DeviceConfig,
    reg: &RegisterConfig,
    raw_payload: &str,
    bus: &mut dyn BusDriver,
    timeout_ms: u64,
) -> WriteResponse {
    let payload: Result<WritePayload, _> = serde_json::from_str(raw_payload)
        .or_else(|_| raw_payload.trim().parse::<f64>().map(WritePayload::Bare));

    let value = match payload {
        Ok(p) => p.value(),
        Err(_) => {
            return error_response(WriteErrorCode::MalformedPayload, "malformed write payload", 0.0, None, None);
        }
    };

    if !reg.writable {
        return error_response(WriteErrorCode::NotWritable, "register is not writable", value, None, None);
    }
    if !matches!(reg.function_code, FunctionCode::Coil | FunctionCode::Holding) {
        return error_response(WriteErrorCode::UnsupportedFunctionCode, "function code does not support write", value, None, None);
    }

    if let Some(min) = reg.min_value {
        if value < min {
            return error_response(WriteErrorCode::BelowMinimum, "Value below minimum", value, Some(min), None);
        }
    }
    if let Some(max) = reg.max_value {
        if value > max {
            return error_response(WriteErrorCode::AboveMaximum, "Value above maximum", value, None, Some(max));
        }
    }

    // Reverse calibration: raw = (value - offset) / scale (§4.10).
    let raw_value = if reg.scale != 0.0 { (value - reg.offset) / reg.scale } else { 0.0 };

    let start = std::time::Instant::now();
    let pdu = match reg.function_code {
        FunctionCode::Coil => build_write_single_coil(reg.address, raw_value != 0.0),
        FunctionCode::Holding => build_write_single_register(reg.address, raw_value as i64 as u16),
        _ => unreachable!("checked above"),
    };
    let expected_fc = pdu[0];

    match bus.request(device.slave_id, &pdu, timeout_ms).await {
        Ok(resp) => match parse_write_response(expected_fc, &resp) {
            Ok(()) => WriteResponse::Ok {
                status: "ok",
                value_written: value,
                raw_value,
                response_time_ms: start.elapsed().as_millis() as u64,
            },
            Err(gw_common::BusError::Exception(code)) => {
                let mapped = match code {
                    0x01 => WriteErrorCode::ModbusExceptionIllegalFunction,
                    0x02 => WriteErrorCode::ModbusExceptionIllegalAddress,
                    0x03 => WriteErrorCode::ModbusExceptionIllegalValue,
                    _ => WriteErrorCode::ModbusExceptionSlaveFailure,
                };
                error_response(mapped, "device returned exception", value, None, None)
            }
            Err(_) => error_response(WriteErrorCode::TransportConnectionFailed, "malformed write response", value, None, None),
        },
        Err(gw_common::BusError::Timeout(_)) => {
            error_response(WriteErrorCode::TransportTimeout, "request timed out", value, None, None)
        }
        Err(_) => error_response(WriteErrorCode::TransportConnectionFailed, "bus connection failed", value, None, None),
    }
}

/// Error response for a target that `WriteTargetMap` couldn't resolve, or a
/// bus mutex that couldn't be acquired before the dispatcher's timeout —
/// both produced outside `handle_write` itself, before a register/bus is in
/// hand.
pub fn dispatch_error(code: WriteErrorCode, message: &str, provided_value: f64) -> WriteResponse {
    error_response(code, message, provided_value, None, None)
}

/// Derives the subscribe topic for a device per §6's grammar.
pub fn write_topic(topic_prefix: &str, device_id: &str, register_id: &str) -> String {
    format!("{topic_prefix}/write/{device_id}/{register_id}")
}

pub fn response_topic(write_topic: &str) -> String {
    format!("{write_topic}/response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_common::model::{DataTypeBase, DeviceProtocol, Endianness};

    fn sample_device() -> DeviceConfig {
        DeviceConfig {
            device_id: "A1B2C3".into(),
            device_name: "Pump".into(),
            protocol: DeviceProtocol::Rtu,
            serial_port: Some(1),
            slave_id: 1,
            baud_rate: Some(9600),
            ip_address: None,
            port: 502,
            refresh_rate_ms: 1000,
            timeout_ms: 3000,
            max_retries: 5,
            enabled: true,
            registers: vec![],
        }
    }

    fn sample_register() -> RegisterConfig {
        RegisterConfig {
            register_id: "R1".into(),
            register_name: "Setpoint".into(),
            address: 0,
            function_code: FunctionCode::Holding,
            data_type: DataTypeBase::Uint16,
            endianness: Endianness::Be,
            scale: 0.1,
            offset: 0.0,
            decimals: 1,
            unit: "degC".into(),
            writable: true,
            min_value: Some(0.0),
            max_value: Some(100.0),
            register_index: 0,
        }
    }

    struct StubBus {
        reply: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl BusDriver for StubBus {
        async fn request(&mut self, _unit_id: u8, pdu: &[u8], _timeout_ms: u64) -> Result<Vec<u8>, gw_common::BusError> {
            let _ = pdu;
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn happy_path_writes_and_responds() {
        let device = sample_device();
        let reg = sample_register();
        let mut bus = StubBus { reply: vec![0x06, 0x00, 0x00, 0x00, 0xFF] };
        let resp = handle_write(&device, &reg, "{\"value\": 25.5}", &mut bus, 1000).await;
        match resp {
            WriteResponse::Ok { value_written, raw_value, .. } => {
                assert_eq!(value_written, 25.5);
                assert_eq!(raw_value, 255.0);
            }
            _ => panic!("expected Ok response"),
        }
    }

    #[tokio::test]
    async fn above_maximum_rejected_without_write() {
        let device = sample_device();
        let reg = sample_register();
        let mut bus = StubBus { reply: vec![] };
        let resp = handle_write(&device, &reg, "{\"value\": 150}", &mut bus, 1000).await;
        match resp {
            WriteResponse::Err { error_code, max_value, min_value, .. } => {
                assert_eq!(error_code, 320);
                assert_eq!(max_value, Some(100.0));
                assert_eq!(min_value, None);
            }
            _ => panic!("expected Err response"),
        }
    }

    #[tokio::test]
    async fn malformed_payload_gets_its_own_code() {
        let device = sample_device();
        let reg = sample_register();
        let mut bus = StubBus { reply: vec![] };
        let resp = handle_write(&device, &reg, "not json or a number", &mut bus, 1000).await;
        match resp {
            WriteResponse::Err { error_code, .. } => assert_eq!(error_code, 321),
            _ => panic!("expected Err response"),
        }
    }

    #[tokio::test]
    async fn non_writable_register_rejected() {
        let device = sample_device();
        let mut reg = sample_register();
        reg.writable = false;
        let mut bus = StubBus { reply: vec![] };
        let resp = handle_write(&device, &reg, "{\"value\": 10}", &mut bus, 1000).await;
        match resp {
            WriteResponse::Err { error_code, .. } => assert_eq!(error_code, 318),
            _ => panic!("expected Err response"),
        }
    }

    #[test]
    fn topic_grammar() {
        let topic = write_topic("suriota/gw1", "A1B2C3", "R1");
        assert_eq!(topic, "suriota/gw1/write/A1B2C3/R1");
        assert_eq!(response_topic(&topic), "suriota/gw1/write/A1B2C3/R1/response");
    }
}
