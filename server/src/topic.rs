//! Topic-keyed publication point for a session's outbound stream.
//!
//! One publisher, many subscribers. Each message is classified into one of
//! the four [`Topic`]s and copied to every subscriber of that topic.
//! Subscribers come in two flavors:
//!
//! - **Queues**: a player's outbound `mpsc::Sender`. Delivery uses
//!   `try_send`, so a slow client drops the newest messages instead of
//!   stalling the publisher.
//! - **Slots**: a one-element `watch` cell holding only the latest message
//!   of its topic. The sync mediator uses one of these as its sliding tap.

use std::sync::Mutex;

use log::debug;
use shared::{Object, Topic};
use tokio::sync::{mpsc, watch};

struct QueueSub {
    topics: Vec<Topic>,
    tx: mpsc::Sender<Object>,
}

struct SlotSub {
    token: u64,
    topic: Topic,
    tx: watch::Sender<Option<Object>>,
}

#[derive(Default)]
struct HubInner {
    queues: Vec<QueueSub>,
    slots: Vec<SlotSub>,
    next_token: u64,
}

/// Publish/subscribe hub over the finite topic set.
pub struct TopicHub {
    inner: Mutex<HubInner>,
}

impl TopicHub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Subscribes a queue sink to the given topics.
    pub fn subscribe(&self, topics: &[Topic], tx: mpsc::Sender<Object>) {
        let mut inner = self.lock();
        // A sink already present just widens its topic set.
        if let Some(sub) = inner.queues.iter_mut().find(|s| s.tx.same_channel(&tx)) {
            for t in topics {
                if !sub.topics.contains(t) {
                    sub.topics.push(*t);
                }
            }
            return;
        }
        inner.queues.push(QueueSub {
            topics: topics.to_vec(),
            tx,
        });
    }

    /// Removes a queue sink from every topic.
    pub fn unsubscribe(&self, tx: &mpsc::Sender<Object>) {
        let mut inner = self.lock();
        inner.queues.retain(|s| !s.tx.same_channel(tx));
    }

    /// Subscribes a one-slot tap to a single topic. Returns the token to
    /// tear the tap down with and the receiving end, which starts empty.
    pub fn watch(&self, topic: Topic) -> (u64, watch::Receiver<Option<Object>>) {
        let (tx, rx) = watch::channel(None);
        let mut inner = self.lock();
        let token = inner.next_token;
        inner.next_token += 1;
        inner.slots.push(SlotSub { token, topic, tx });
        (token, rx)
    }

    /// Removes a one-slot tap.
    pub fn unwatch(&self, token: u64) {
        let mut inner = self.lock();
        inner.slots.retain(|s| s.token != token);
    }

    /// Classifies a message and copies it to every subscriber of its topic.
    pub fn publish(&self, obj: Object) {
        let topic = Topic::of(&obj);
        let mut inner = self.lock();
        inner.queues.retain(|sub| {
            if !sub.topics.contains(&topic) {
                return true;
            }
            match sub.tx.try_send(obj.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("subscriber queue full, dropping {topic:?} message");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        inner.slots.retain(|sub| {
            if sub.topic != topic {
                return true;
            }
            sub.tx.send(Some(obj.clone())).is_ok()
        });
    }
}
