//! Bounded per-connection outbound queue.
//!
//! Every connection owns one queue; the dispatcher pushes, the connection
//! task pops. When the queue is full the oldest heartbeat is shed first,
//! then the oldest informational event. If nothing can be shed the push
//! reports overflow and the dispatcher evicts the connection — a slow
//! client must never stall the dispatcher.

use beacon_protocol::{DeliveryClass, Event};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Default outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Result of pushing an event onto a connection's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Event enqueued.
    Queued,
    /// Event enqueued after shedding an older non-critical event.
    Shed,
    /// Queue full of undroppable events; the connection should be evicted.
    Overflow,
    /// Queue already closed; the connection is going away.
    Closed,
}

struct Inner {
    items: VecDeque<Arc<Event>>,
    closed: bool,
}

/// Bounded FIFO queue of events awaiting delivery to one connection.
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    /// Create a queue with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Push an event, applying the drop policy on overflow.
    pub fn push(&self, event: Arc<Event>) -> PushOutcome {
        let mut inner = self.inner.lock().expect("outbound queue poisoned");
        if inner.closed {
            return PushOutcome::Closed;
        }

        let mut outcome = PushOutcome::Queued;
        if inner.items.len() >= self.capacity {
            let shed = Self::position_of(&inner.items, DeliveryClass::Heartbeat)
                .or_else(|| Self::position_of(&inner.items, DeliveryClass::Info));
            match shed {
                Some(pos) => {
                    inner.items.remove(pos);
                    outcome = PushOutcome::Shed;
                }
                None => return PushOutcome::Overflow,
            }
        }

        inner.items.push_back(event);
        drop(inner);
        self.notify.notify_one();
        outcome
    }

    fn position_of(items: &VecDeque<Arc<Event>>, class: DeliveryClass) -> Option<usize> {
        items.iter().position(|e| e.class() == class)
    }

    /// Pop the next event, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Arc<Event>> {
        loop {
            {
                let mut inner = self.inner.lock().expect("outbound queue poisoned");
                if let Some(event) = inner.items.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<Arc<Event>> {
        self.inner
            .lock()
            .expect("outbound queue poisoned")
            .items
            .pop_front()
    }

    /// Close the queue, discarding pending events and waking the consumer.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("outbound queue poisoned");
        inner.closed = true;
        inner.items.clear();
        drop(inner);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("outbound queue poisoned").items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("outbound queue poisoned").closed
    }
}
