//! Structured event sink between the pipeline thread and the transport layer.
//!
//! The queue is bounded and never blocks the producer: when full, the oldest
//! event is dropped and a counter records the loss. Detection events are
//! recoverable from the next frame, so dropping old ones under backpressure
//! is safe. Events for frame F are enqueued strictly before events for
//! frame F+1; the single producer thread guarantees the ordering.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::aggregate::IncidentTransition;
use crate::detect::DetectionSignal;

/// Per-frame detection record pushed to the transport layer.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionRecord {
    pub timestamp_s: f64,
    pub signals: Vec<DetectionSignal>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SinkEvent {
    Detections(DetectionRecord),
    Incident(IncidentTransition),
}

/// Bounded, non-blocking event queue with drop-oldest overflow.
pub struct EventQueue {
    inner: Mutex<VecDeque<SinkEvent>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an event, evicting the oldest entry if the queue is full.
    pub fn push(&self, event: SinkEvent) {
        let mut queue = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if queue.len() == self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
    }

    /// Take the oldest pending event, if any. Consumed by the transport side.
    pub fn pop(&self) -> Option<SinkEvent> {
        let mut queue = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    /// Drain everything currently queued (shutdown path).
    pub fn drain(&self) -> Vec<SinkEvent> {
        let mut queue = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events lost to backpressure since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(ts: f64) -> SinkEvent {
        SinkEvent::Detections(DetectionRecord {
            timestamp_s: ts,
            signals: Vec::new(),
        })
    }

    #[test]
    fn preserves_fifo_order() {
        let queue = EventQueue::new(8);
        queue.push(detection(1.0));
        queue.push(detection(2.0));
        match queue.pop() {
            Some(SinkEvent::Detections(rec)) => assert_eq!(rec.timestamp_s, 1.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let queue = EventQueue::new(2);
        queue.push(detection(1.0));
        queue.push(detection(2.0));
        queue.push(detection(3.0));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);
        match queue.pop() {
            Some(SinkEvent::Detections(rec)) => assert_eq!(rec.timestamp_s, 2.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn drain_empties_queue() {
        let queue = EventQueue::new(4);
        queue.push(detection(1.0));
        queue.push(detection(2.0));
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
