//! Fan-Out Bus
//!
//! Single-producer pub/sub with bounded per-subscriber queues and
//! drop-oldest backpressure: when a queue is full the stalest element is
//! evicted to make room, so a lagging consumer can never block the publish
//! path or reorder delivery.
//!
//! Each queue is a `VecDeque` guarded by its own short `parking_lot::Mutex`
//! critical section; wakeups go through `tokio::sync::Notify`. Publish is
//! O(number of subscribers).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::metrics;
use crate::model::TickEvent;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

struct SubscriberState {
    id: u64,
    name: String,
    capacity: usize,
    queue: Mutex<VecDeque<Arc<TickEvent>>>,
    dropped: AtomicU64,
    delivered: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl SubscriberState {
    fn push(&self, event: Arc<TickEvent>) {
        {
            let mut queue = self.queue.lock();
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::global().drops_total.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Arc<TickEvent>> {
        let event = self.queue.lock().pop_front();
        if event.is_some() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        event
    }
}

struct BusShared {
    subs: Mutex<Vec<Arc<SubscriberState>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    published: AtomicU64,
}

/// Handle to the fan-out bus. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    shared: Arc<BusShared>,
}

impl Bus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            shared: Arc::new(BusShared {
                subs: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                queue_capacity,
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new subscriber with a fresh bounded queue.
    pub fn subscribe(&self, name: &str) -> Subscription {
        let state = Arc::new(SubscriberState {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            capacity: self.shared.queue_capacity,
            queue: Mutex::new(VecDeque::with_capacity(self.shared.queue_capacity)),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        self.shared.subs.lock().push(state.clone());
        Subscription {
            state,
            bus: self.shared.clone(),
        }
    }

    /// Deliver an event to every active subscriber. Never blocks: full
    /// queues evict their oldest element first.
    pub fn publish(&self, event: Arc<TickEvent>) {
        let subs = self.shared.subs.lock();
        for sub in subs.iter() {
            if sub.closed.load(Ordering::Acquire) {
                continue;
            }
            sub.push(event.clone());
        }
        drop(subs);
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        metrics::global().events_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark every subscription closed and wake receivers. Queued events are
    /// still drained by their consumers.
    pub fn close_all(&self) {
        let subs = self.shared.subs.lock();
        for sub in subs.iter() {
            sub.closed.store(true, Ordering::Release);
            sub.notify.notify_waiters();
        }
    }

    /// (name, queue depth, dropped) per live subscription.
    pub fn depths(&self) -> Vec<(String, usize, u64)> {
        self.shared
            .subs
            .lock()
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    s.queue.lock().len(),
                    s.dropped.load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subs.lock().len()
    }

    pub fn published_total(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.shared
            .subs
            .lock()
            .iter()
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

/// Consumer-side handle to one bounded queue. Unsubscribes on drop.
pub struct Subscription {
    state: Arc<SubscriberState>,
    bus: Arc<BusShared>,
}

impl Subscription {
    /// Await the next event in publish order. Returns `None` once the
    /// subscription is closed and its queue is drained.
    pub async fn recv(&self) -> Option<Arc<TickEvent>> {
        loop {
            // Arm the wakeup before checking the queue so a publish between
            // the check and the await cannot be missed.
            let notified = self.state.notify.notified();
            if let Some(event) = self.state.pop() {
                return Some(event);
            }
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-suspending variant for tests and opportunistic drains.
    pub fn try_recv(&self) -> Option<Arc<TickEvent>> {
        self.state.pop()
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn depth(&self) -> usize {
        self.state.queue.lock().len()
    }

    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.state.delivered.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Remove this subscription from the bus; queued events are discarded.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        let mut subs = self.bus.subs.lock();
        subs.retain(|s| s.id != self.state.id);
        drop(subs);
        self.state.queue.lock().clear();
        self.state.notify.notify_waiters();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
