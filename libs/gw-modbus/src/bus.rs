//! Bus transports: one serial port per RS-485 bus, one pooled TCP socket per
//! `ip:port` endpoint (§4.1, §4.4). Grounded on the teacher's
//! `ModbusRtuClient::execute` retry wrapper.

use crate::frame::{build_rtu_frame, build_tcp_frame, parse_rtu_frame, parse_tcp_frame};
use async_trait::async_trait;
use gw_common::BusError;
use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::SerialPortBuilderExt;

/// A single request/response exchange over whichever transport backs a
/// device. Implementors own framing; callers only see PDUs.
#[async_trait]
pub trait BusDriver: Send + Sync {
    async fn request(&mut self, unit_id: u8, pdu: &[u8], timeout_ms: u64) -> Result<Vec<u8>, BusError>;
}

/// One open serial port, shared by every device configured on that bus
/// (§5: devices on the same RS-485 bus must not poll concurrently, so
/// callers serialize access with their own per-bus lock before calling in).
pub struct RtuBusDriver {
    port: tokio_serial::SerialStream,
}

impl RtuBusDriver {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, BusError> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| BusError::ConnectionFailed(format!("{path}: {e}")))?;
        Ok(Self { port })
    }
}

#[async_trait]
impl BusDriver for RtuBusDriver {
    async fn request(&mut self, unit_id: u8, pdu: &[u8], timeout_ms: u64) -> Result<Vec<u8>, BusError> {
        let frame = build_rtu_frame(unit_id, pdu);
        timeout(Duration::from_millis(timeout_ms), self.port.write_all(&frame))
            .await
            .map_err(|_| BusError::Timeout(timeout_ms))?
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        let mut buf = vec![0u8; 256];
        let n = timeout(Duration::from_millis(timeout_ms), self.port.read(&mut buf))
            .await
            .map_err(|_| BusError::Timeout(timeout_ms))?
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        let (_, resp_pdu) = parse_rtu_frame(&buf[..n])?;
        Ok(resp_pdu.to_vec())
    }
}

/// One pooled TCP socket for an `ip:port` endpoint, shared across every
/// device that resolves to that endpoint (§4.4).
pub struct TcpBusDriver {
    stream: TcpStream,
    next_transaction_id: u16,
}

impl TcpBusDriver {
    pub async fn connect(endpoint: &str) -> Result<Self, BusError> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| BusError::ConnectionFailed(format!("{endpoint}: {e}")))?;
        Ok(Self {
            stream,
            next_transaction_id: 1,
        })
    }
}

#[async_trait]
impl BusDriver for TcpBusDriver {
    async fn request(&mut self, unit_id: u8, pdu: &[u8], timeout_ms: u64) -> Result<Vec<u8>, BusError> {
        let txn_id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);

        let frame = build_tcp_frame(txn_id, unit_id, pdu);
        timeout(Duration::from_millis(timeout_ms), self.stream.write_all(&frame))
            .await
            .map_err(|_| BusError::Timeout(timeout_ms))?
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        let mut buf = vec![0u8; 260];
        let n = timeout(Duration::from_millis(timeout_ms), self.stream.read(&mut buf))
            .await
            .map_err(|_| BusError::Timeout(timeout_ms))?
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        let (resp_txn, _, resp_pdu) = parse_tcp_frame(&buf[..n])?;
        if resp_txn != txn_id {
            return Err(BusError::ConnectionFailed(format!(
                "transaction id mismatch: sent {txn_id}, got {resp_txn}"
            )));
        }
        Ok(resp_pdu.to_vec())
    }
}

/// Exponential backoff with jitter for retrying a failed exchange (§4.1,
/// §7). Base doubles per attempt, capped, plus up to 20% random jitter.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(cap_ms);
    let jitter_max = capped / 5;
    let jitter = if jitter_max > 0 {
        rand::thread_rng().gen_range(0..jitter_max)
    } else {
        0
    };
    Duration::from_millis(capped + jitter)
}

/// Retries a bus exchange up to `max_retries` times with backoff between
/// attempts, giving up on the first success or on exhaustion (§4.1).
pub async fn execute_with_retry<F, Fut>(
    max_retries: u32,
    base_backoff_ms: u64,
    cap_backoff_ms: u64,
    mut attempt_fn: F,
) -> Result<Vec<u8>, BusError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<u8>, BusError>>,
{
    let mut last_err = BusError::ConnectionFailed("no attempts made".into());
    for attempt in 0..=max_retries {
        match attempt_fn().await {
            Ok(pdu) => return Ok(pdu),
            Err(e) => {
                last_err = e;
                if attempt < max_retries {
                    tokio::time::sleep(backoff_delay(attempt, base_backoff_ms, cap_backoff_ms)).await;
                }
            }
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let d0 = backoff_delay(0, 100, 5000);
        let d5 = backoff_delay(5, 100, 5000);
        assert!(d0.as_millis() >= 100 && d0.as_millis() < 120);
        assert!(d5.as_millis() <= 6000);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let mut calls = 0;
        let result = execute_with_retry(2, 1, 5, || {
            calls += 1;
            async move { Err::<Vec<u8>, BusError>(BusError::Timeout(10)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn retry_succeeds_on_second_attempt() {
        let mut calls = 0;
        let result = execute_with_retry(3, 1, 5, || {
            calls += 1;
            let current = calls;
            async move {
                if current < 2 {
                    Err(BusError::Timeout(10))
                } else {
                    Ok(vec![0x03, 0x02, 0x00, 0x01])
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls, 2);
    }
}
