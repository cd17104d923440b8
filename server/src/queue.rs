//! Bounded sliding queue used for per-player inbound frames.
//!
//! Tokio's `mpsc` drops the *newest* element when full (`try_send`), which
//! is what outbound queues want. Inbound wants the opposite: under
//! backpressure the freshest input should survive and the oldest should go,
//! so the network reader never blocks and never starves recency. This
//! primitive is that drop-oldest counterpart, built from a `Mutex<VecDeque>`
//! and a `Notify`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct Inner<T> {
    buf: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

/// Producer half. Dropping it closes the queue once drained.
pub struct SlidingSender<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer half.
pub struct SlidingReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a sliding queue with the given capacity. One producer, one
/// consumer; a push onto a full queue evicts the oldest element.
pub fn sliding_channel<T>(capacity: usize) -> (SlidingSender<T>, SlidingReceiver<T>) {
    assert!(capacity > 0, "sliding queue capacity must be positive");
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
        }),
        notify: Notify::new(),
    });
    (
        SlidingSender {
            shared: shared.clone(),
        },
        SlidingReceiver { shared },
    )
}

impl<T> SlidingSender<T> {
    /// Enqueues an element, evicting the oldest one when the queue is full.
    /// Returns the evicted element, if any. A push onto a closed queue (the
    /// receiver is gone) discards the element.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut inner = match self.shared.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if inner.closed {
                return Some(item);
            }
            let evicted = if inner.buf.len() == inner.capacity {
                inner.buf.pop_front()
            } else {
                None
            };
            inner.buf.push_back(item);
            evicted
        };
        self.shared.notify.notify_one();
        evicted
    }
}

impl<T> Drop for SlidingSender<T> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.closed = true;
        }
        self.shared.notify.notify_one();
    }
}

impl<T> SlidingReceiver<T> {
    /// Receives the oldest queued element without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        let mut inner = match self.shared.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.buf.pop_front()
    }

    /// Receives the oldest queued element, waiting for one to arrive.
    /// Returns `None` once the sender is dropped and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut inner = match self.shared.inner.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(item) = inner.buf.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            // notify_one stores a permit when no task is waiting, so a push
            // between the check above and this await is not lost.
            self.shared.notify.notified().await;
        }
    }
}

impl<T> Drop for SlidingReceiver<T> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.closed = true;
            inner.buf.clear();
        }
    }
}
