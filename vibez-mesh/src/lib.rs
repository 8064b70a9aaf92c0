//! Vibez audio mesh
//!
//! Peer-to-peer voice for live audio spaces. Every host and speaker of a space
//! holds one direct WebRTC connection to every other host and speaker; there
//! is no media server in between.
//!
//! ## Architecture
//!
//! - **`MeshCoordinator`**: application entry point, holds the active session
//! - **`MeshSession`**: capture, detector and peers of one user in one space
//! - **`PeerConnectionManager`**: offer / answer / candidate exchange per peer
//! - **`SignalingTransport`**: addressed envelopes and role announcements over a
//!   publish/subscribe channel
//! - **`LevelDetector`**: debounced speaking indicator from capture energy
//!
//! Hardware and network access sit behind traits ([`AudioCapture`],
//! [`AudioSinkFactory`], [`PeerConnector`], [`SignalingChannel`], [`Roster`]),
//! with `webrtc`-backed implementations in [`rtc`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vibez_mesh::{MeshCoordinator, MeshDeps};
//!
//! let coordinator = MeshCoordinator::new(deps);
//! coordinator.initialize("space-id", "user-id").await?;
//! if coordinator.enable_speaking(true).await {
//!     coordinator.set_muted(true).await;
//! }
//! coordinator.cleanup().await;
//! ```

pub mod config;
pub mod connection;
mod coordinator;
pub mod detector;
pub mod error;
pub mod logging;
mod manager;
pub mod media;
mod peer;
pub mod roster;
pub mod rtc;
mod session;
pub mod signaling;
pub mod types;

#[cfg(test)]
mod test_helpers;

pub use config::{Config, DetectorConfig, IceServerConfig, LoggingConfig, MeshConfig};
pub use connection::{
    ConnectionEvent, ConnectionState, IceCandidate, MediaConnection, PeerConnector, SdpType,
    SessionDescription,
};
pub use coordinator::MeshCoordinator;
pub use detector::LevelDetector;
pub use error::{Error, Result};
pub use manager::{MeshListener, PeerConnectionManager};
pub use media::{
    media_id, AudioCapture, AudioSink, AudioSinkFactory, CaptureConstraints, FrequencyAnalyser,
    LocalAudioTrack, LocalStream, RemoteAudio, RemoteStream,
};
pub use peer::{Direction, PeerInfo, PeerState};
pub use roster::{MemoryRoster, Participant, RestRoster, Roster};
pub use rtc::{PlaybackFrame, PlaybackSinkFactory, RtcConnector};
pub use session::{MeshDeps, MeshSession};
pub use signaling::{Inbound, LocalBus, SignalingChannel, SignalingTransport, Subscription};
pub use types::{ParticipantRole, PeerId, SpaceId, UserId};
