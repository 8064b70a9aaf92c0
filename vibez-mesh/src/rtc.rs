//! `webrtc` crate backend for [`PeerConnector`] and [`AudioSink`]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceServerConfig;
use crate::connection::{
    ConnectionEvent, ConnectionEvents, ConnectionState, IceCandidate, MediaConnection,
    PeerConnector, SdpType, SessionDescription,
};
use crate::error::{Error, Result};
use crate::media::{AudioSink, AudioSinkFactory, LocalAudioTrack, RemoteAudio, RemoteStream};
use crate::types::PeerId;

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(Error::Negotiation(
                "rollback descriptions are not supported".to_string(),
            ))
        }
    };
    parsed.map_err(|e| Error::Negotiation(format!("invalid {} sdp: {e}", desc.sdp_type.as_str())))
}

fn from_rtc_description(desc: &RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::Negotiation("unspecified sdp type".to_string()))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp.clone(),
    })
}

fn to_rtc_configuration(ice_servers: &[IceServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// Builds `RTCPeerConnection`s with Opus registered and default interceptors
pub struct RtcConnector {
    api: API,
}

impl RtcConnector {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        peer_id: &PeerId,
        ice_servers: &[IceServerConfig],
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(to_rtc_configuration(ice_servers))
                .await?,
        );

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(ConnectionEvent::IceCandidate(init.into()));
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize local ICE candidate"),
                }
            })
        }));

        let track_tx = events.clone();
        pc.on_track(Box::new(move |track, receiver, _transceiver| {
            let tx = track_tx.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    debug!(kind = %track.kind(), "Ignoring non-audio remote track");
                    return;
                }
                let remote: RemoteStream = Arc::new(RtcRemoteAudio::new(track, receiver));
                let _ = tx.send(ConnectionEvent::Track(remote));
            })
        }));

        let state_tx = events;
        let state_peer = peer_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(peer_id = %state_peer, state = %state, "Peer connection state changed");
            let _ = state_tx.send(ConnectionEvent::StateChanged(state.into()));
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcConnection { pc }))
    }
}

/// `RTCPeerConnection` adapter
pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaConnection for RtcConnection {
    async fn add_local_track(&self, track: &Arc<LocalAudioTrack>) -> Result<()> {
        let rtp_track = track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>;
        let sender = self.pc.add_track(rtp_track).await?;

        // RTCP must be drained for interceptors to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Remote audio backed by a `TrackRemote`
pub struct RtcRemoteAudio {
    stream_id: String,
    track_id: String,
    track: Arc<TrackRemote>,
    receiver: Arc<RTCRtpReceiver>,
}

impl RtcRemoteAudio {
    fn new(track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>) -> Self {
        Self {
            stream_id: track.stream_id(),
            track_id: track.id(),
            track,
            receiver,
        }
    }
}

impl std::fmt::Debug for RtcRemoteAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcRemoteAudio")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .finish_non_exhaustive()
    }
}

impl RemoteAudio for RtcRemoteAudio {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn track_id(&self) -> &str {
        &self.track_id
    }

    fn stop(&self) {
        let receiver = Arc::clone(&self.receiver);
        tokio::spawn(async move {
            if let Err(e) = receiver.stop().await {
                debug!(error = %e, "Failed to stop RTP receiver");
            }
        });
    }

    fn rtp_track(&self) -> Option<Arc<TrackRemote>> {
        Some(Arc::clone(&self.track))
    }
}

/// Encoded audio frame received from a peer
#[derive(Debug, Clone)]
pub struct PlaybackFrame {
    pub peer_id: PeerId,
    pub payload: Bytes,
    pub timestamp: u32,
}

/// Sink that pumps RTP payloads of a remote stream into a playback channel
pub struct PlaybackSink {
    peer_id: PeerId,
    output: mpsc::Sender<PlaybackFrame>,
    pump: Mutex<Option<JoinHandle<()>>>,
    stream: Mutex<Option<RemoteStream>>,
}

impl AudioSink for PlaybackSink {
    fn bind(&self, stream: RemoteStream) -> Result<()> {
        let track = stream.rtp_track().ok_or_else(|| {
            Error::InvalidInput(format!("stream {} has no RTP track", stream.stream_id()))
        })?;

        let peer_id = self.peer_id.clone();
        let output = self.output.clone();
        let pump = tokio::spawn(async move {
            while let Ok((packet, _)) = track.read_rtp().await {
                if packet.payload.is_empty() {
                    continue;
                }
                let frame = PlaybackFrame {
                    peer_id: peer_id.clone(),
                    payload: packet.payload,
                    timestamp: packet.header.timestamp,
                };
                if output.send(frame).await.is_err() {
                    break;
                }
            }
            debug!(peer_id = %peer_id, "Playback pump finished");
        });

        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }
        *self.stream.lock() = Some(stream);
        info!(peer_id = %self.peer_id, "Remote audio bound to playback");
        Ok(())
    }

    fn release(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if let Some(stream) = self.stream.lock().take() {
            stream.stop();
        }
    }
}

/// Creates [`PlaybackSink`]s that all feed one playback channel
pub struct PlaybackSinkFactory {
    output: mpsc::Sender<PlaybackFrame>,
}

impl PlaybackSinkFactory {
    /// Returns the factory and the receiving end consumed by the audio output
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PlaybackFrame>) {
        let (output, rx) = mpsc::channel(capacity);
        (Self { output }, rx)
    }
}

impl AudioSinkFactory for PlaybackSinkFactory {
    fn create(&self, peer_id: &PeerId) -> Box<dyn AudioSink> {
        Box::new(PlaybackSink {
            peer_id: peer_id.clone(),
            output: self.output.clone(),
            pump: Mutex::new(None),
            stream: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::test_helpers::{FakeRemote, StaticAnalyser};

    #[test]
    fn test_rtc_configuration_keeps_turn_credentials() {
        let config = to_rtc_configuration(&MeshConfig::default().ice_servers);
        assert_eq!(config.ice_servers.len(), 4);
        let turn = config
            .ice_servers
            .iter()
            .find(|s| s.urls[0].starts_with("turn:"))
            .unwrap();
        assert_eq!(turn.username, "openrelayproject");
        assert_eq!(turn.credential, "openrelayproject");
    }

    #[test]
    fn test_candidate_conversion_round_trip() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };
        let init: RTCIceCandidateInit = candidate.clone().into();
        assert_eq!(IceCandidate::from(init), candidate);
    }

    #[test]
    fn test_rollback_is_rejected() {
        let desc = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(to_rtc_description(desc), Err(Error::Negotiation(_))));
    }

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::New),
            ConnectionState::New
        );
    }

    #[tokio::test]
    async fn test_loopback_offer_answer() {
        let connector = RtcConnector::new().unwrap();
        let peer = PeerId::from("bob");
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        // No ICE servers: host candidates only, nothing leaves the machine
        let a = connector.connect(&peer, &[], tx_a).await.unwrap();
        let b = connector.connect(&peer, &[], tx_b).await.unwrap();

        let track = Arc::new(LocalAudioTrack::opus(
            "mic",
            "local",
            Arc::new(StaticAnalyser::new(0)),
        ));
        a.add_local_track(&track).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("opus"));
        a.set_local_description(offer.clone()).await.unwrap();

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_playback_sink_requires_rtp_track() {
        let (factory, _rx) = PlaybackSinkFactory::new(8);
        let sink = factory.create(&PeerId::from("bob"));
        let result = sink.bind(Arc::new(FakeRemote::new("stream")));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        sink.release();
    }
}
