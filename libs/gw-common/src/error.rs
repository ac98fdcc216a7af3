use thiserror::Error;

/// Errors raised by the Modbus transport layer (C1 `BusDriver`).
///
/// Carries a typed kind so callers can distinguish transient transport
/// failures from protocol-level ones without string matching (§4.1, §7).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("invalid MBAP header: {0}")]
    InvalidMbap(String),

    #[error("device returned exception code {0:#04X}")]
    Exception(u8),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid address/quantity: {0}")]
    InvalidAddress(String),
}

/// Errors raised decoding register words or calibrating the result (C2).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("expected {expected} words, got {actual}")]
    WrongWordCount { expected: usize, actual: usize },

    #[error("register address range overflows 0..=65535: address {address}, word_count {word_count}")]
    AddressOverflow { address: u16, word_count: u16 },
}

/// Errors raised by the gateway's runtime components (scheduler, queue,
/// publishers, retry queue, remote-write handler).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("write validation failed, code {0}")]
    WriteRejected(u16),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
