use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::warn;

use crate::kernel::event::TelemetryEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued,
    /// The queue was full; the oldest event was dropped to make room.
    QueuedDroppedOldest,
    /// The queue is closed for shutdown; the event was not taken.
    Closed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_dropped: u64,
    pub drop_rate: f64,
    pub closed: bool,
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<TelemetryEvent>,
    closed: bool,
    total_enqueued: u64,
    total_dequeued: u64,
    total_dropped: u64,
}

/// Bounded multi-producer buffer between call sites and the transport stage.
///
/// Producers never wait: when full, the oldest event is evicted. Consumers
/// can poll (`try_dequeue`) or await (`dequeue`).
pub struct EventQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(65_536)),
                closed: false,
                total_enqueued: 0,
                total_dequeued: 0,
                total_dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn enqueue(&self, event: TelemetryEvent) -> EnqueueResult {
        let result = {
            let mut state = self.state.lock();
            if state.closed {
                return EnqueueResult::Closed;
            }
            let mut result = EnqueueResult::Queued;
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.total_dropped += 1;
                result = EnqueueResult::QueuedDroppedOldest;
            }
            state.items.push_back(event);
            state.total_enqueued += 1;
            if result == EnqueueResult::QueuedDroppedOldest && state.total_dropped.is_power_of_two() {
                warn!("Event queue full, dropped oldest. Total dropped: {}", state.total_dropped);
            }
            result
        };
        self.notify.notify_one();
        result
    }

    pub fn try_dequeue(&self) -> Option<TelemetryEvent> {
        let mut state = self.state.lock();
        let event = state.items.pop_front();
        if event.is_some() {
            state.total_dequeued += 1;
        }
        event
    }

    /// Waits for the next event. Returns `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<TelemetryEvent> {
        loop {
            // Register before checking so a concurrent enqueue cannot be missed.
            let notified = self.notify.notified();
            if let Some(event) = self.try_dequeue() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting events and wake every waiting consumer.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Remove every queued event, e.g. to discard them at shutdown.
    pub fn clear(&self) -> Vec<TelemetryEvent> {
        let mut state = self.state.lock();
        state.items.drain(..).collect()
    }

    pub fn size(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn utilization(&self) -> f64 {
        self.size() as f64 / self.capacity as f64
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            size: state.items.len(),
            capacity: self.capacity,
            utilization: state.items.len() as f64 / self.capacity as f64,
            total_enqueued: state.total_enqueued,
            total_dequeued: state.total_dequeued,
            total_dropped: state.total_dropped,
            drop_rate: if state.total_enqueued > 0 {
                state.total_dropped as f64 / state.total_enqueued as f64
            } else {
                0.0
            },
            closed: state.closed,
        }
    }
}

/// Anything the backpressure controller can measure.
pub trait Occupancy {
    fn size(&self) -> usize;
    fn capacity(&self) -> usize;
}

impl Occupancy for EventQueue {
    fn size(&self) -> usize {
        EventQueue::size(self)
    }

    fn capacity(&self) -> usize {
        EventQueue::capacity(self)
    }
}
