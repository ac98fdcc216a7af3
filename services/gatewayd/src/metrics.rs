//! Internal counters named informally throughout §4-§7. Plain atomics, no
//! external metrics sink — Non-goals exclude dashboards/UIs, not
//! in-process observability.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub queue_dropped: AtomicU64,
    pub retry_queue_dropped: AtomicU64,
    pub registers_skipped_deleted_device: AtomicU64,
    pub publishes_ok: AtomicU64,
    pub publishes_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_queue_dropped(&self) {
        self.queue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_retry_queue_dropped(&self) {
        self.retry_queue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_skipped_registers(&self, n: u64) {
        self.registers_skipped_deleted_device.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_publish_ok(&self) {
        self.publishes_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_publish_failed(&self) {
        self.publishes_failed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.incr_queue_dropped();
        m.incr_queue_dropped();
        m.add_skipped_registers(3);
        assert_eq!(m.queue_dropped.load(Ordering::Relaxed), 2);
        assert_eq!(m.registers_skipped_deleted_device.load(Ordering::Relaxed), 3);
    }
}
