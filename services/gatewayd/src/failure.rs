//! Per-device failure bookkeeping: retry counters, backoff deadlines, and
//! the independent consecutive-timeout disable path (§4.3).

use rand::Rng;
use std::collections::HashMap;

const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 1600;

#[derive(Debug, Clone)]
pub struct FailureState {
    pub consecutive_failures: u32,
    pub retry_count: u32,
    pub next_retry_deadline: u64,
    pub last_attempt: u64,
    pub last_success: u64,
    pub consecutive_timeouts: u32,
    pub enabled: bool,
}

impl Default for FailureState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            retry_count: 0,
            next_retry_deadline: 0,
            last_attempt: 0,
            last_success: 0,
            consecutive_timeouts: 0,
            enabled: true,
        }
    }
}

/// Tracks one `FailureState` per configured device, keyed by `device_id`.
#[derive(Debug, Default)]
pub struct DeviceFailureTracker {
    states: HashMap<String, FailureState>,
}

impl DeviceFailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_mut(&mut self, device_id: &str) -> &mut FailureState {
        self.states.entry(device_id.to_string()).or_default()
    }

    pub fn should_attempt(&mut self, device_id: &str, now: u64) -> bool {
        let state = self.state_mut(device_id);
        state.enabled && (state.retry_count == 0 || now >= state.next_retry_deadline)
    }

    pub fn record_success(&mut self, device_id: &str, now: u64) {
        let state = self.state_mut(device_id);
        state.consecutive_failures = 0;
        state.retry_count = 0;
        state.consecutive_timeouts = 0;
        state.last_success = now;
    }

    /// Returns `true` if this failure just disabled the device (max retries
    /// exceeded), so the caller can log the transition once.
    pub fn record_failure(&mut self, device_id: &str, now: u64, max_retries: u32) -> bool {
        let state = self.state_mut(device_id);
        state.consecutive_failures += 1;
        state.last_attempt = now;

        if state.retry_count < max_retries {
            state.retry_count += 1;
            let backoff = backoff_delay_ms(state.retry_count);
            state.next_retry_deadline = now + backoff;
            false
        } else {
            state.enabled = false;
            true
        }
    }

    /// Timeout-specific disable path, independent of `retry_count` (§4.3:
    /// "a separate timeout tracker"). Returns `true` if this call disabled
    /// the device.
    pub fn record_timeout(&mut self, device_id: &str, now: u64) -> bool {
        let state = self.state_mut(device_id);
        state.consecutive_timeouts += 1;
        state.last_attempt = now;
        if state.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
            state.enabled = false;
            true
        } else {
            false
        }
    }

    pub fn re_enable(&mut self, device_id: &str) {
        let state = self.state_mut(device_id);
        state.enabled = true;
        state.retry_count = 0;
        state.consecutive_failures = 0;
        state.consecutive_timeouts = 0;
        state.next_retry_deadline = 0;
    }

    pub fn get(&self, device_id: &str) -> Option<&FailureState> {
        self.states.get(device_id)
    }
}

/// `base = 100ms * 2^(retry_count-1)`, capped at 1600ms, plus uniform
/// jitter in `[0, base/2)` (§4.3, invariant §8.4: `100ms <= wait <= 2400ms`).
fn backoff_delay_ms(retry_count: u32) -> u64 {
    let shift = retry_count.saturating_sub(1).min(16);
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << shift).min(BACKOFF_CAP_MS);
    let jitter_bound = base / 2;
    let jitter = if jitter_bound > 0 {
        rand::thread_rng().gen_range(0..jitter_bound)
    } else {
        0
    };
    base + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_attempt_true_on_first_try() {
        let mut t = DeviceFailureTracker::new();
        assert!(t.should_attempt("d1", 0));
    }

    #[test]
    fn backoff_bounds_respect_invariant() {
        for rc in 1..=6 {
            let ms = backoff_delay_ms(rc);
            assert!(ms >= 100 && ms <= 2400, "retry_count {rc} produced {ms}ms");
        }
    }

    #[test]
    fn disables_after_max_retries_exceeded() {
        let mut t = DeviceFailureTracker::new();
        let mut disabled = false;
        for now in 0..10 {
            if t.should_attempt("d1", now * 10_000) {
                disabled = t.record_failure("d1", now * 10_000, 5);
            }
        }
        assert!(disabled);
        assert!(!t.get("d1").unwrap().enabled);
    }

    #[test]
    fn timeout_disable_independent_of_retry_count() {
        let mut t = DeviceFailureTracker::new();
        t.record_timeout("d1", 0);
        t.record_timeout("d1", 1);
        assert!(t.get("d1").unwrap().enabled);
        let disabled = t.record_timeout("d1", 2);
        assert!(disabled);
    }

    #[test]
    fn success_resets_counters() {
        let mut t = DeviceFailureTracker::new();
        t.record_failure("d1", 0, 5);
        t.record_success("d1", 1);
        let state = t.get("d1").unwrap();
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.consecutive_failures, 0);
    }
}
