//! Signaling Transport: addressed envelopes and role announcements for one space

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    events, ChannelMessage, RoleAnnouncement, SignalEnvelope, SignalKind, SignalingChannel,
    SpeakingUpdate, Subscription,
};
use crate::connection::{IceCandidate, SessionDescription};
use crate::error::Result;
use crate::roster::Roster;
use crate::types::{ParticipantRole, PeerId, SpaceId, UserId};

/// Decoded message addressed to the local participant
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Offer {
        from: PeerId,
        description: SessionDescription,
    },
    Answer {
        from: PeerId,
        description: SessionDescription,
    },
    IceCandidate {
        from: PeerId,
        candidate: IceCandidate,
    },
    SpeakerJoined(UserId),
    SpeakerLeft(UserId),
    UserSpeaking {
        user_id: UserId,
        is_speaking: bool,
    },
}

pub struct SignalingTransport {
    space_id: SpaceId,
    local_id: UserId,
    relay_topic: String,
    channel: Arc<dyn SignalingChannel>,
    roster: Arc<dyn Roster>,
}

impl SignalingTransport {
    pub fn new(
        space_id: SpaceId,
        local_id: UserId,
        relay_topic: impl Into<String>,
        channel: Arc<dyn SignalingChannel>,
        roster: Arc<dyn Roster>,
    ) -> Self {
        Self {
            space_id,
            local_id,
            relay_topic: relay_topic.into(),
            channel,
            roster,
        }
    }

    #[must_use]
    pub fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    #[must_use]
    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    #[must_use]
    pub fn space_topic(&self) -> String {
        format!("space:{}", self.space_id)
    }

    /// Subscribe to the relay topic and the space topic
    pub async fn subscribe(&self) -> Result<Vec<Subscription>> {
        let relay = self.channel.subscribe(&self.relay_topic).await?;
        let space = self.channel.subscribe(&self.space_topic()).await?;
        debug!(
            space_id = %self.space_id,
            user_id = %self.local_id,
            "Signaling channels subscribed"
        );
        Ok(vec![relay, space])
    }

    /// Send a negotiation message to one peer. Returns whether the channel
    /// accepted it; delivery is never confirmed.
    pub async fn send<T: Serialize>(&self, target: &PeerId, kind: SignalKind, body: &T) -> bool {
        let payload = match serde_json::to_value(body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer_id = %target, kind = ?kind, error = %e, "Failed to encode signal");
                return false;
            }
        };

        let envelope = SignalEnvelope {
            sender_id: self.local_id.clone(),
            target_id: Some(target.clone()),
            kind,
            payload,
        };
        self.publish(events::SIGNAL, &envelope).await
    }

    /// Tell the space this participant started or stopped speaking, then
    /// mirror the change into the roster
    pub async fn announce_role(&self, became_speaker: bool) {
        let event = if became_speaker {
            events::SPEAKER_JOINED
        } else {
            events::SPEAKER_LEFT
        };
        let announcement = RoleAnnouncement {
            user_id: self.local_id.clone(),
        };
        self.publish(event, &announcement).await;

        if let Err(e) = self.update_roster_role(became_speaker).await {
            warn!(
                space_id = %self.space_id,
                user_id = %self.local_id,
                error = %e,
                "Failed to update participant role"
            );
        }
    }

    async fn update_roster_role(&self, became_speaker: bool) -> Result<()> {
        let current = self.roster.role_of(&self.space_id, &self.local_id).await?;
        let next = match (current, became_speaker) {
            (Some(ParticipantRole::Listener), true) => ParticipantRole::Speaker,
            (Some(ParticipantRole::Speaker), false) => ParticipantRole::Listener,
            // Hosts keep their role, missing rows are not ours to create
            _ => return Ok(()),
        };

        self.roster
            .set_role(&self.space_id, &self.local_id, next)
            .await?;
        info!(
            space_id = %self.space_id,
            user_id = %self.local_id,
            role = %next,
            "Participant role updated"
        );
        Ok(())
    }

    /// Broadcast the local speaking indicator
    pub async fn broadcast_speaking(&self, is_speaking: bool) -> bool {
        let update = SpeakingUpdate {
            user_id: self.local_id.clone(),
            is_speaking,
        };
        self.publish(events::USER_SPEAKING, &update).await
    }

    async fn publish<T: Serialize>(&self, event: &str, body: &T) -> bool {
        let topic = self.space_topic();
        let result = match serde_json::to_value(body) {
            Ok(payload) => self.channel.broadcast(&topic, event, payload).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(topic = %topic, event = %event, error = %e, "Signaling broadcast failed");
                false
            }
        }
    }

    /// Decode a channel message, dropping anything not meant for this participant
    #[must_use]
    pub fn decode(&self, message: &ChannelMessage) -> Option<Inbound> {
        match message.event.as_str() {
            events::SIGNAL => self.decode_signal(&message.payload),
            events::SPEAKER_JOINED | events::SPEAKER_LEFT => {
                let announcement: RoleAnnouncement = parse(&message.payload, &message.event)?;
                if announcement.user_id == self.local_id {
                    return None;
                }
                if message.event == events::SPEAKER_JOINED {
                    Some(Inbound::SpeakerJoined(announcement.user_id))
                } else {
                    Some(Inbound::SpeakerLeft(announcement.user_id))
                }
            }
            events::USER_SPEAKING => {
                let update: SpeakingUpdate = parse(&message.payload, &message.event)?;
                if update.user_id == self.local_id {
                    return None;
                }
                Some(Inbound::UserSpeaking {
                    user_id: update.user_id,
                    is_speaking: update.is_speaking,
                })
            }
            other => {
                debug!(topic = %message.topic, event = %other, "Ignoring unknown event");
                None
            }
        }
    }

    fn decode_signal(&self, payload: &serde_json::Value) -> Option<Inbound> {
        let envelope: SignalEnvelope = parse(payload, events::SIGNAL)?;
        if !envelope.is_for(&self.local_id) {
            return None;
        }

        let from = envelope.sender_id;
        match envelope.kind {
            SignalKind::Offer => Some(Inbound::Offer {
                description: parse(&envelope.payload, "offer")?,
                from,
            }),
            SignalKind::Answer => Some(Inbound::Answer {
                description: parse(&envelope.payload, "answer")?,
                from,
            }),
            SignalKind::IceCandidate => Some(Inbound::IceCandidate {
                candidate: parse(&envelope.payload, "ice-candidate")?,
                from,
            }),
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: &serde_json::Value, what: &str) -> Option<T> {
    match serde_json::from_value(payload.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(message = %what, error = %e, "Dropping malformed signaling message");
            None
        }
    }
}
