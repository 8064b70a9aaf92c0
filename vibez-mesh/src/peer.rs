//! Per-peer session record
//!
//! A [`Peer`] is reserved in the manager's map before any await so that an
//! inbound offer and an outbound connect for the same id can never both
//! create one. The `generation` tells a live attempt apart from a superseded
//! one after each suspension point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::connection::{IceCandidate, MediaConnection, SessionDescription};
use crate::media::{AudioSink, RemoteStream};
use crate::types::PeerId;

/// Negotiation state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Offer or answer in flight, no remote audio yet
    Connecting,
    /// Remote audio received
    Connected,
    Closed,
}

/// Which side started the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

pub struct Peer {
    pub id: PeerId,
    pub generation: u64,
    pub direction: Direction,
    pub state: PeerState,
    /// Set once the connector returned; `None` while the connection is being built
    pub connection: Option<Arc<dyn MediaConnection>>,
    pub remote_stream: Option<RemoteStream>,
    pub sink: Option<Box<dyn AudioSink>>,
    /// Whether peer-connected was reported for this entry
    pub announced: bool,
    pub remote_description_set: bool,
    /// SDP of the offer an inbound peer was created from
    pub offer_sdp: Option<String>,
    /// Offer sent by an outbound peer, kept until it is answered
    pub local_offer: Option<SessionDescription>,
    /// Local candidates sent alongside `local_offer`
    pub sent_candidates: Vec<IceCandidate>,
    /// Remote candidates received before the remote description was applied
    pub pending_candidates: Vec<IceCandidate>,
    pub events_task: Option<JoinHandle<()>>,
    pub created_at: DateTime<Utc>,
}

impl Peer {
    #[must_use]
    pub fn reserve(id: PeerId, generation: u64, direction: Direction) -> Self {
        Self {
            id,
            generation,
            direction,
            state: PeerState::Connecting,
            connection: None,
            remote_stream: None,
            sink: None,
            announced: false,
            remote_description_set: false,
            offer_sdp: None,
            local_offer: None,
            sent_candidates: Vec::new(),
            pending_candidates: Vec::new(),
            events_task: None,
            created_at: Utc::now(),
        }
    }

    /// Outbound offer sent and still waiting for an answer
    #[must_use]
    pub fn awaits_answer(&self) -> bool {
        self.direction == Direction::Outbound
            && self.state == PeerState::Connecting
            && !self.remote_description_set
    }

    /// Release playback and remote media. Safe to call more than once.
    pub fn release_media(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.release();
        }
        if let Some(stream) = self.remote_stream.take() {
            stream.stop();
        }
        self.state = PeerState::Closed;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("announced", &self.announced)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a peer for inspection and UI listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub direction: Direction,
    pub state: PeerState,
    pub created_at: DateTime<Utc>,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id.clone(),
            direction: peer.direction,
            state: peer.state,
            created_at: peer.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeRemote, RecordingSinks};
    use crate::media::AudioSinkFactory;

    #[test]
    fn test_reserved_peer_is_connecting() {
        let peer = Peer::reserve(PeerId::from("bob"), 1, Direction::Outbound);
        assert_eq!(peer.state, PeerState::Connecting);
        assert!(peer.connection.is_none());
        assert!(peer.awaits_answer());

        let inbound = Peer::reserve(PeerId::from("bob"), 2, Direction::Inbound);
        assert!(!inbound.awaits_answer());
    }

    #[test]
    fn test_release_media_is_idempotent() {
        let sinks = RecordingSinks::default();
        let remote: RemoteStream = Arc::new(FakeRemote::new("r1"));
        let sink = sinks.create(&PeerId::from("bob"));
        sink.bind(Arc::clone(&remote)).unwrap();

        let mut peer = Peer::reserve(PeerId::from("bob"), 1, Direction::Inbound);
        peer.sink = Some(sink);
        peer.remote_stream = Some(remote);

        peer.release_media();
        peer.release_media();

        assert_eq!(peer.state, PeerState::Closed);
        assert_eq!(sinks.releases(&PeerId::from("bob")), 1);
    }

    #[test]
    fn test_peer_info_snapshot() {
        let peer = Peer::reserve(PeerId::from("bob"), 7, Direction::Inbound);
        let info = PeerInfo::from(&peer);
        assert_eq!(info.id, PeerId::from("bob"));
        assert_eq!(info.direction, Direction::Inbound);
        assert_eq!(info.state, PeerState::Connecting);
    }
}
