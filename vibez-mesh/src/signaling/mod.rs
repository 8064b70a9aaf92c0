//! Signaling over the space's publish/subscribe channels
//!
//! Negotiation messages travel as [`SignalEnvelope`]s addressed to one peer;
//! role changes and speaking indicators are broadcast to the whole space.

mod bus;
mod transport;

pub use bus::LocalBus;
pub use transport::{Inbound, SignalingTransport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::UserId;

/// Broadcast event names used on the channels
pub mod events {
    pub const SIGNAL: &str = "signal";
    pub const SPEAKER_JOINED: &str = "speaker-joined";
    pub const SPEAKER_LEFT: &str = "speaker-left";
    pub const USER_SPEAKING: &str = "user-speaking";
}

/// Negotiation message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Addressed negotiation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub sender_id: UserId,
    /// Absent means every participant of the space
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<UserId>,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub payload: serde_json::Value,
}

impl SignalEnvelope {
    /// Whether `local` should process this envelope
    #[must_use]
    pub fn is_for(&self, local: &UserId) -> bool {
        if &self.sender_id == local {
            return false;
        }
        self.target_id.as_ref().map_or(true, |target| target == local)
    }
}

/// Body of `speaker-joined` / `speaker-left`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAnnouncement {
    pub user_id: UserId,
}

/// Body of `user-speaking`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingUpdate {
    pub user_id: UserId,
    pub is_speaking: bool,
}

/// A broadcast received on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub topic: String,
    pub event: String,
    pub payload: serde_json::Value,
}

/// Live subscription to one topic. Dropping it unsubscribes as well.
pub struct Subscription {
    topic: String,
    messages: mpsc::UnboundedReceiver<ChannelMessage>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        messages: mpsc::UnboundedReceiver<ChannelMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            topic: topic.into(),
            messages,
            cancel,
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once unsubscribed or the channel went away
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            message = self.messages.recv() => message,
        }
    }

    /// Token cancelled on unsubscribe, usable to stop tasks reading this subscription
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Publish/subscribe channel provided by the realtime backend
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// Fire-and-forget broadcast to every subscriber of `topic`
    async fn broadcast(&self, topic: &str, event: &str, payload: serde_json::Value) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(sender: &str, target: Option<&str>) -> SignalEnvelope {
        SignalEnvelope {
            sender_id: UserId::from(sender),
            target_id: target.map(UserId::from),
            kind: SignalKind::Offer,
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn test_envelope_filtering() {
        let me = UserId::from("alice");

        assert!(envelope("bob", Some("alice")).is_for(&me));
        assert!(envelope("bob", None).is_for(&me));
        assert!(!envelope("bob", Some("carol")).is_for(&me));
        assert!(!envelope("alice", Some("alice")).is_for(&me));
        assert!(!envelope("alice", None).is_for(&me));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let json = serde_json::to_value(SignalEnvelope {
            sender_id: UserId::from("bob"),
            target_id: Some(UserId::from("alice")),
            kind: SignalKind::IceCandidate,
            payload: serde_json::json!({ "candidate": "c" }),
        })
        .unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "senderId": "bob",
                "targetId": "alice",
                "type": "ice-candidate",
                "payload": { "candidate": "c" }
            })
        );
    }

    #[test]
    fn test_broadcast_envelope_omits_target() {
        let json = serde_json::to_value(envelope("bob", None)).unwrap();
        assert!(json.get("targetId").is_none());
        let parsed: SignalEnvelope = serde_json::from_value(json).unwrap();
        assert!(parsed.target_id.is_none());
    }

    #[tokio::test]
    async fn test_subscription_stops_after_unsubscribe() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Subscription::new("t", rx, CancellationToken::new());
        tx.send(ChannelMessage {
            topic: "t".to_string(),
            event: "e".to_string(),
            payload: serde_json::Value::Null,
        })
        .unwrap();

        sub.unsubscribe();
        assert!(sub.recv().await.is_none());
    }
}
