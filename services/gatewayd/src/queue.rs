//! Bounded telemetry FIFO plus a parallel BLE-streaming sub/unsub pair
//! (§4.5). The single cross-task channel between scheduler and publishers.

use gw_common::model::TelemetrySample;
use std::collections::VecDeque;
use std::sync::Mutex;

pub struct TelemetryQueue {
    main: Mutex<VecDeque<TelemetrySample>>,
    capacity: usize,
    stream: Mutex<StreamState>,
}

struct StreamState {
    target_device: Option<String>,
    buffer: VecDeque<TelemetrySample>,
}

impl TelemetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            main: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            stream: Mutex::new(StreamState {
                target_device: None,
                buffer: VecDeque::new(),
            }),
        }
    }

    /// Drops the oldest sample on overflow, returning `true` if a drop
    /// occurred so the caller can bump the dropped-count metric.
    pub fn enqueue(&self, sample: TelemetrySample) -> bool {
        let mut main = self.main.lock().unwrap();
        let dropped = if main.len() >= self.capacity {
            main.pop_front();
            true
        } else {
            false
        };
        main.push_back(sample.clone());
        drop(main);

        let mut stream = self.stream.lock().unwrap();
        if stream.target_device.as_deref() == Some(sample.device_id.as_str()) {
            stream.buffer.push_back(sample);
        }
        dropped
    }

    pub fn dequeue(&self) -> Option<TelemetrySample> {
        self.main.lock().unwrap().pop_front()
    }

    /// Drains everything currently queued without consuming one at a time;
    /// publishers group by device before emission regardless of order.
    pub fn drain_all(&self) -> Vec<TelemetrySample> {
        self.main.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.main.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stream_subscribe(&self, device_id: &str) {
        let mut stream = self.stream.lock().unwrap();
        stream.target_device = Some(device_id.to_string());
        stream.buffer.clear();
    }

    pub fn stream_unsubscribe(&self) {
        let mut stream = self.stream.lock().unwrap();
        stream.target_device = None;
        stream.buffer.clear();
    }

    pub fn stream_dequeue(&self) -> Option<TelemetrySample> {
        self.stream.lock().unwrap().buffer.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(device_id: &str) -> TelemetrySample {
        TelemetrySample {
            device_id: device_id.into(),
            device_name: "dev".into(),
            register_id: "R1".into(),
            register_name: "Temp".into(),
            register_index: 0,
            address: 0,
            unit: "degC".into(),
            description: String::new(),
            value: 1.0,
            timestamp: 0,
        }
    }

    #[test]
    fn overflow_drops_oldest() {
        let q = TelemetryQueue::new(2);
        assert!(!q.enqueue(sample("d1")));
        assert!(!q.enqueue(sample("d2")));
        assert!(q.enqueue(sample("d3"))); // drops d1's sample
        let drained = q.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].device_id, "d2");
    }

    #[test]
    fn fifo_order_preserved_per_device() {
        let q = TelemetryQueue::new(10);
        q.enqueue(sample("d1"));
        q.enqueue(sample("d1"));
        let first = q.dequeue().unwrap();
        let second = q.dequeue().unwrap();
        assert_eq!(first.device_id, "d1");
        assert_eq!(second.device_id, "d1");
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn stream_only_captures_subscribed_device() {
        let q = TelemetryQueue::new(10);
        q.stream_subscribe("d1");
        q.enqueue(sample("d1"));
        q.enqueue(sample("d2"));
        assert!(q.stream_dequeue().is_some());
        assert!(q.stream_dequeue().is_none());
    }

    #[test]
    fn unsubscribe_clears_stream_buffer() {
        let q = TelemetryQueue::new(10);
        q.stream_subscribe("d1");
        q.enqueue(sample("d1"));
        q.stream_unsubscribe();
        assert!(q.stream_dequeue().is_none());
    }
}
