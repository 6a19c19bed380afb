//! In-process publish/subscribe. Each subscriber owns a bounded queue;
//! when a queue overflows, the oldest droppable event is evicted so the
//! publishing session never blocks on a slow consumer. Terminal job and
//! spool transitions are never evicted.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::events::Event;

const DEFAULT_QUEUE_CAP: usize = 256;

struct SubscriberQueue {
    name: &'static str,
    buffer: std::sync::Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
}

struct Shared {
    subscribers: std::sync::Mutex<Vec<Arc<SubscriberQueue>>>,
    closed: std::sync::atomic::AtomicBool,
}

/// Handle for publishing and subscribing. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: std::sync::Mutex::new(Vec::new()),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Register a named subscriber with the default queue capacity.
    pub fn subscribe(&self, name: &'static str) -> Subscription {
        self.subscribe_with_capacity(name, DEFAULT_QUEUE_CAP)
    }

    pub fn subscribe_with_capacity(&self, name: &'static str, capacity: usize) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            name,
            buffer: std::sync::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        });
        self.shared
            .subscribers
            .lock()
            .expect("bus subscriber list poisoned")
            .push(Arc::clone(&queue));
        Subscription {
            queue,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fan the event out to every subscriber. Never blocks.
    pub fn publish(&self, event: Event) {
        if self.shared.closed.load(std::sync::atomic::Ordering::Acquire) {
            tracing::debug!(topic = event.topic(), "event dropped after bus close");
            return;
        }
        let subscribers = self
            .shared
            .subscribers
            .lock()
            .expect("bus subscriber list poisoned")
            .clone();
        for queue in subscribers {
            queue.push(event.clone());
        }
    }

    /// Stop accepting events and wake all subscribers so they can
    /// drain. Callers bound the drain with their own deadline.
    pub fn close(&self) {
        self.shared
            .closed
            .store(true, std::sync::atomic::Ordering::Release);
        let subscribers = self
            .shared
            .subscribers
            .lock()
            .expect("bus subscriber list poisoned")
            .clone();
        for queue in subscribers {
            queue.notify.notify_waiters();
        }
    }
}

impl SubscriberQueue {
    fn push(&self, event: Event) {
        let mut buffer = self.buffer.lock().expect("subscriber queue poisoned");
        buffer.push_back(event);
        if buffer.len() > self.capacity {
            // Evict the oldest droppable event. A queue holding only
            // terminal events grows instead of losing one.
            if let Some(index) = buffer.iter().position(|e| !e.is_terminal()) {
                if let Some(dropped) = buffer.remove(index) {
                    tracing::warn!(
                        subscriber = self.name,
                        topic = dropped.topic(),
                        "subscriber lagging, dropped oldest event"
                    );
                }
            }
        }
        drop(buffer);
        self.notify.notify_one();
    }
}

/// Receiving side of one subscription.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Next event, or `None` once the bus is closed and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut buffer = self.queue.buffer.lock().expect("subscriber queue poisoned");
                if let Some(event) = buffer.pop_front() {
                    return Some(event);
                }
            }
            if self.shared.closed.load(std::sync::atomic::Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking variant for tests and shutdown drains.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue
            .buffer
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front()
    }
}

/// Collect every event currently queued, for tests.
#[cfg(test)]
pub fn drain(subscription: &mut Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        events.push(event);
    }
    events
}
