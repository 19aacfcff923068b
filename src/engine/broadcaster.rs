use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::watch;

use crate::models::update::TrackingUpdate;

struct Topic {
    generation: u64,
    tx: watch::Sender<Option<TrackingUpdate>>,
}

#[derive(Default)]
pub struct TrackingBroadcaster {
    topics: DashMap<String, Topic>,
    next_generation: AtomicU64,
}

impl TrackingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, delivery_id: &str) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, _rx) = watch::channel(None);
        self.topics
            .insert(delivery_id.to_string(), Topic { generation, tx });
        generation
    }

    pub fn publish(&self, update: &TrackingUpdate) -> bool {
        let Some(topic) = self.topics.get(&update.delivery_id) else {
            return false;
        };

        topic.tx.send_if_modified(|current| {
            let is_newer = current
                .as_ref()
                .is_none_or(|previous| update.captured_at > previous.captured_at);
            if is_newer {
                *current = Some(update.clone());
            }
            is_newer
        })
    }

    pub fn subscribe(&self, delivery_id: &str) -> Option<Subscription> {
        let topic = self.topics.get(delivery_id)?;
        Some(Subscription {
            delivery_id: delivery_id.to_string(),
            rx: Some(topic.tx.subscribe()),
            primed: false,
        })
    }

    pub fn latest(&self, delivery_id: &str) -> Option<TrackingUpdate> {
        self.topics.get(delivery_id)?.tx.borrow().clone()
    }

    pub fn subscriber_count(&self, delivery_id: &str) -> usize {
        self.topics
            .get(delivery_id)
            .map(|topic| topic.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Closes the topic if it still belongs to `generation`. Dropping the
    /// sender ends every subscriber's stream.
    pub fn close(&self, delivery_id: &str, generation: u64) -> bool {
        self.topics
            .remove_if(delivery_id, |_, topic| topic.generation == generation)
            .is_some()
    }
}

pub struct Subscription {
    delivery_id: String,
    rx: Option<watch::Receiver<Option<TrackingUpdate>>>,
    primed: bool,
}

impl Subscription {
    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    /// The first call returns the current latest update, if any.
    pub async fn recv(&mut self) -> Option<TrackingUpdate> {
        let rx = self.rx.as_mut()?;

        if !self.primed {
            self.primed = true;
            let current = rx.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
        }

        loop {
            if rx.changed().await.is_err() {
                self.rx = None;
                return None;
            }
            let latest = rx.borrow_and_update().clone();
            if latest.is_some() {
                return latest;
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.rx = None;
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }

    pub fn into_stream(self) -> impl Stream<Item = TrackingUpdate> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            let update = subscription.recv().await?;
            Some((update, subscription))
        })
    }
}
