//! Per-device batch completion tracking gating publishers (§4.6).

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchState {
    pub expected: u32,
    pub enqueued_success: u32,
    pub enqueued_failed: u32,
    pub scheduler_done: bool,
}

impl BatchState {
    pub fn is_complete(&self) -> bool {
        self.scheduler_done && (self.enqueued_success + self.enqueued_failed) == self.expected
    }
}

/// Guarded by a single mutex, shared between the scheduler (writer) and
/// publisher tasks (readers) as §5 names it as the one allowed piece of
/// shared mutable state beyond `ConfigStore`.
#[derive(Debug, Default)]
pub struct BatchTracker {
    devices: Mutex<HashMap<String, BatchState>>,
}

impl BatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, device_id: &str, expected_register_count: u32) {
        let mut devices = self.devices.lock().unwrap();
        devices.insert(
            device_id.to_string(),
            BatchState {
                expected: expected_register_count,
                enqueued_success: 0,
                enqueued_failed: 0,
                scheduler_done: false,
            },
        );
    }

    pub fn record_success(&self, device_id: &str) {
        if let Some(state) = self.devices.lock().unwrap().get_mut(device_id) {
            state.enqueued_success += 1;
        }
    }

    pub fn record_failure(&self, device_id: &str) {
        if let Some(state) = self.devices.lock().unwrap().get_mut(device_id) {
            state.enqueued_failed += 1;
        }
    }

    pub fn finish(&self, device_id: &str) {
        if let Some(state) = self.devices.lock().unwrap().get_mut(device_id) {
            state.scheduler_done = true;
        }
    }

    /// A snapshot, not a live lock — callers must not assume the state is
    /// unchanged by the time they act on it (§4.6 deadlock-safety note).
    pub fn has_complete_batch(&self) -> bool {
        self.devices.lock().unwrap().values().any(|s| s.is_complete())
    }

    pub fn complete_device_ids(&self) -> Vec<String> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.is_complete())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn clear(&self, device_id: &str) {
        self.devices.lock().unwrap().remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_until_scheduler_done() {
        let t = BatchTracker::new();
        t.start("d1", 2);
        t.record_success("d1");
        t.record_success("d1");
        assert!(!t.has_complete_batch()); // scheduler hasn't finished the iteration
        t.finish("d1");
        assert!(t.has_complete_batch());
    }

    #[test]
    fn partial_enqueue_is_not_complete() {
        let t = BatchTracker::new();
        t.start("d1", 10);
        for _ in 0..5 {
            t.record_success("d1");
        }
        t.finish("d1");
        assert!(!t.has_complete_batch());
    }

    #[test]
    fn clear_removes_device() {
        let t = BatchTracker::new();
        t.start("d1", 1);
        t.record_success("d1");
        t.finish("d1");
        t.clear("d1");
        assert!(t.complete_device_ids().is_empty());
    }
}
