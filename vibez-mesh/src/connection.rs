//! Peer connection seam
//!
//! The Peer Connection Manager drives negotiation through [`MediaConnection`]
//! and learns about candidates, remote tracks and state changes from the
//! [`ConnectionEvent`] channel handed to [`PeerConnector::connect`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::IceServerConfig;
use crate::error::Result;
use crate::media::{LocalAudioTrack, RemoteStream};
use crate::types::PeerId;

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

/// Session description, serialized like a browser `RTCSessionDescriptionInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate, serialized like a browser `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Connection state reported by the underlying transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the peer is torn down
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Event raised by a live connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A local candidate was gathered and must be forwarded to the peer
    IceCandidate(IceCandidate),
    /// Remote audio arrived
    Track(RemoteStream),
    StateChanged(ConnectionState),
}

pub type ConnectionEvents = mpsc::UnboundedSender<ConnectionEvent>;

/// One bidirectional media session with a remote peer
#[async_trait]
pub trait MediaConnection: Send + Sync {
    async fn add_local_track(&self, track: &Arc<LocalAudioTrack>) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Factory for peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        peer_id: &PeerId,
        ice_servers: &[IceServerConfig],
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>>;
}
