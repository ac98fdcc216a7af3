//! Shared configuration and telemetry data model (spec §3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable 6-hex-character identifier. Not validated here beyond a type
/// alias — validation of the hex-char shape is a `ConfigStore` concern.
pub type DeviceId = String;
pub type RegisterId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceProtocol {
    Rtu,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    Coil = 1,
    Discrete = 2,
    Holding = 3,
    Input = 4,
}

impl FunctionCode {
    pub fn is_bit_type(self) -> bool {
        matches!(self, FunctionCode::Coil | FunctionCode::Discrete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataTypeBase {
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Int64,
    Uint64,
    Double64,
}

impl DataTypeBase {
    /// Number of 16-bit Modbus registers this type spans (§4.2).
    pub fn word_count(self) -> u16 {
        match self {
            DataTypeBase::Bool | DataTypeBase::Int16 | DataTypeBase::Uint16 => 1,
            DataTypeBase::Int32 | DataTypeBase::Uint32 | DataTypeBase::Float32 => 2,
            DataTypeBase::Int64 | DataTypeBase::Uint64 | DataTypeBase::Double64 => 4,
        }
    }

    pub fn is_16_bit(self) -> bool {
        matches!(self, DataTypeBase::Bool | DataTypeBase::Int16 | DataTypeBase::Uint16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    Be,
    Le,
    BeBs,
    LeBs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub register_id: RegisterId,
    pub register_name: String,
    pub address: u16,
    pub function_code: FunctionCode,
    pub data_type: DataTypeBase,
    pub endianness: Endianness,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// -1 = auto (no rounding), else 0..=6, clamped on update.
    #[serde(default = "default_decimals")]
    pub decimals: i8,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_true")]
    pub writable: bool,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub register_index: u32,
}

fn default_scale() -> f64 {
    1.0
}
fn default_decimals() -> i8 {
    -1
}
fn default_true() -> bool {
    true
}

impl RegisterConfig {
    /// Clamp a requested `decimals` value to the valid range (§8 boundary
    /// behaviors): -1 stays -1 (auto), anything below is coerced to -1,
    /// anything above 6 is coerced to 6.
    pub fn clamp_decimals(requested: i8) -> i8 {
        if requested < -1 {
            -1
        } else if requested > 6 {
            6
        } else {
            requested
        }
    }

    /// §3 invariant: `address + word_count - 1 <= 65535`.
    pub fn address_in_range(&self) -> bool {
        let word_count = self.data_type.word_count();
        (self.address as u32) + (word_count as u32) - 1 <= u16::MAX as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: DeviceId,
    pub device_name: String,
    pub protocol: DeviceProtocol,
    pub serial_port: Option<u8>,
    pub slave_id: u8,
    pub baud_rate: Option<u32>,
    pub ip_address: Option<String>,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    #[serde(default = "default_refresh_rate_ms")]
    pub refresh_rate_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub registers: Vec<RegisterConfig>,
}

fn default_tcp_port() -> u16 {
    502
}
fn default_refresh_rate_ms() -> u64 {
    5000
}
fn default_timeout_ms() -> u64 {
    3000
}
fn default_max_retries() -> u32 {
    5
}

/// Valid RS-485 baud rates (§3). Anything else falls back to 9600 (§4.1).
pub const VALID_BAUD_RATES: [u32; 8] =
    [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

pub fn coerce_baud_rate(requested: u32) -> u32 {
    if VALID_BAUD_RATES.contains(&requested) {
        requested
    } else {
        9600
    }
}

impl DeviceConfig {
    /// `ip:port` key used to pool TCP connections by endpoint (§4.4).
    pub fn tcp_endpoint_key(&self) -> Option<String> {
        self.ip_address.as_ref().map(|ip| format!("{ip}:{}", self.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalUnit {
    Ms,
    S,
    M,
}

impl IntervalUnit {
    pub fn to_millis(self, value: u64) -> u64 {
        match self {
            IntervalUnit::Ms => value,
            IntervalUnit::S => value * 1000,
            IntervalUnit::M => value * 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerProtocol {
    Mqtt,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommunicationMode {
    Eth,
    Wifi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishMode {
    Default,
    Customize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub topic: String,
    pub interval: u64,
    pub interval_unit: IntervalUnit,
}

impl TopicSpec {
    pub fn interval_ms(&self) -> u64 {
        self.interval_unit.to_millis(self.interval)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomTopic {
    pub topic: String,
    pub interval: u64,
    pub interval_unit: IntervalUnit,
    pub registers: Vec<RegisterId>,
}

impl CustomTopic {
    pub fn interval_ms(&self) -> u64 {
        self.interval_unit.to_millis(self.interval)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttServerConfig {
    pub broker_address: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_s")]
    pub keep_alive_s: u64,
    pub publish_mode: PublishMode,
    pub default_topic: Option<TopicSpec>,
    #[serde(default)]
    pub custom_topics: Vec<CustomTopic>,
}

fn default_keep_alive_s() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpServerConfig {
    pub endpoint_url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    pub timeout_ms: u64,
    pub retry: u32,
    pub interval: u64,
    pub interval_unit: IntervalUnit,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_http_method() -> String {
    "POST".to_string()
}

impl HttpServerConfig {
    pub fn interval_ms(&self) -> u64 {
        self.interval_unit.to_millis(self.interval)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeControl {
    pub enabled: bool,
    pub topic_prefix: String,
    pub response_enabled: bool,
    pub default_qos: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub protocol: ServerProtocol,
    pub communication_mode: CommunicationMode,
    pub mqtt: Option<MqttServerConfig>,
    pub http: Option<HttpServerConfig>,
    pub subscribe: SubscribeControl,
}

/// One decoded register reading staged for publication (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub device_id: DeviceId,
    pub device_name: String,
    pub register_id: RegisterId,
    pub register_name: String,
    pub register_index: u32,
    pub address: u16,
    pub unit: String,
    pub description: String,
    pub value: f64,
    /// Wall-clock seconds from `RtcClock`, or monotonic-boot-seconds
    /// fallback when the clock has never synced.
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_rate_coercion() {
        assert_eq!(coerce_baud_rate(19200), 19200);
        assert_eq!(coerce_baud_rate(14400), 9600);
    }

    #[test]
    fn decimals_clamp() {
        assert_eq!(RegisterConfig::clamp_decimals(10), 6);
        assert_eq!(RegisterConfig::clamp_decimals(-5), -1);
        assert_eq!(RegisterConfig::clamp_decimals(3), 3);
    }

    #[test]
    fn address_range_rejects_overflow() {
        let mut reg = sample_register();
        reg.address = 65535;
        reg.data_type = DataTypeBase::Float32; // 2 words -> overflows
        assert!(!reg.address_in_range());

        reg.address = 65534;
        assert!(reg.address_in_range());
    }

    fn sample_register() -> RegisterConfig {
        RegisterConfig {
            register_id: "A1B2C3".into(),
            register_name: "Temperature".into(),
            address: 0,
            function_code: FunctionCode::Holding,
            data_type: DataTypeBase::Float32,
            endianness: Endianness::Be,
            scale: 1.0,
            offset: 0.0,
            decimals: 2,
            unit: "degC".into(),
            writable: true,
            min_value: None,
            max_value: None,
            register_index: 0,
        }
    }
}
