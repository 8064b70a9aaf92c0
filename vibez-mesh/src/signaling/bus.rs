//! In-process channel hub

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{ChannelMessage, SignalingChannel, Subscription};
use crate::error::{Error, Result};

struct Subscriber {
    tx: mpsc::UnboundedSender<ChannelMessage>,
    cancel: CancellationToken,
}

impl Subscriber {
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }
}

/// [`SignalingChannel`] that delivers broadcasts between sessions of the same
/// process. Senders receive their own broadcasts, like a realtime channel
/// joined with `self: true`.
pub struct LocalBus {
    topics: DashMap<String, Vec<Subscriber>>,
    online: AtomicBool,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate the realtime connection dropping or coming back
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Number of live subscriptions on `topic`
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|s| s.is_active()).count())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingChannel for LocalBus {
    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        if !self.online.load(Ordering::Acquire) {
            return Err(Error::NotConnected(topic.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                tx,
                cancel: cancel.clone(),
            });

        debug!(topic = %topic, "Subscribed to topic");
        Ok(Subscription::new(topic, rx, cancel))
    }

    async fn broadcast(&self, topic: &str, event: &str, payload: serde_json::Value) -> Result<()> {
        if !self.online.load(Ordering::Acquire) {
            return Err(Error::NotConnected(topic.to_string()));
        }

        let Some(mut subscribers) = self.topics.get_mut(topic) else {
            trace!(topic = %topic, event = %event, "Broadcast with no subscribers");
            return Ok(());
        };

        subscribers.retain(Subscriber::is_active);
        for subscriber in subscribers.iter() {
            let _ = subscriber.tx.send(ChannelMessage {
                topic: topic.to_string(),
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }
}
