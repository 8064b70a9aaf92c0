//! Local capture and remote playback primitives
//!
//! The mesh never touches audio hardware directly. Capture is acquired through
//! [`AudioCapture`], level sampling goes through [`FrequencyAnalyser`], and
//! remote audio is handed to an [`AudioSink`] created per peer.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, Result};
use crate::types::PeerId;

/// Opus frame carrying digital silence, sent in place of captured audio while muted
const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Fresh random id for a capture stream or track
#[must_use]
pub fn media_id() -> String {
    nanoid::nanoid!()
}

/// Processing requested from the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Frequency-domain view of a capture, one byte (0-255) per bin
pub trait FrequencyAnalyser: Send + Sync {
    fn byte_frequency_data(&self) -> Vec<u8>;
}

/// A live local audio track.
///
/// `enabled` is the mute gate: a disabled track stays attached to every peer
/// connection but only emits silence. `stop` ends the track for good and runs
/// the release hook registered by the capture backend.
pub struct LocalAudioTrack {
    id: String,
    enabled: AtomicBool,
    ended: AtomicBool,
    rtp_track: Arc<TrackLocalStaticSample>,
    analyser: Arc<dyn FrequencyAnalyser>,
    on_stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl LocalAudioTrack {
    /// Create an Opus track fed by the capture pipeline
    pub fn opus(
        id: impl Into<String>,
        stream_id: impl Into<String>,
        analyser: Arc<dyn FrequencyAnalyser>,
    ) -> Self {
        let id = id.into();
        let rtp_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            id.clone(),
            stream_id.into(),
        ));

        Self {
            id,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            rtp_track,
            analyser,
            on_stop: Mutex::new(None),
        }
    }

    /// Register the hook that releases the underlying device once the track stops
    #[must_use]
    pub fn with_release(self, on_stop: impl FnOnce() + Send + 'static) -> Self {
        *self.on_stop.lock() = Some(Box::new(on_stop));
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.ended.load(Ordering::Acquire)
    }

    /// Stop the track and release the capture device. Repeated calls are no-ops.
    pub fn stop(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(release) = self.on_stop.lock().take() {
            release();
        }
        debug!(track_id = %self.id, "Local audio track stopped");
    }

    #[must_use]
    pub fn analyser(&self) -> &Arc<dyn FrequencyAnalyser> {
        &self.analyser
    }

    /// Outbound RTP track attached to peer connections
    #[must_use]
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp_track)
    }

    /// Push one encoded Opus frame to every connected peer.
    ///
    /// While the track is disabled the frame is replaced with silence so
    /// receivers keep a continuous stream.
    pub async fn write_frame(&self, frame: Bytes, duration: Duration) -> Result<()> {
        if !self.is_live() {
            return Err(Error::Capture(format!("track {} has ended", self.id)));
        }
        let data = if self.is_enabled() {
            frame
        } else {
            Bytes::from_static(&OPUS_SILENCE_FRAME)
        };
        self.rtp_track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

impl fmt::Debug for LocalAudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAudioTrack")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

/// A microphone capture: one stream id and its audio tracks
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalAudioTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalAudioTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn audio_tracks(&self) -> &[Arc<LocalAudioTrack>] {
        &self.tracks
    }

    /// First live, enabled track, used for level detection
    #[must_use]
    pub fn primary_track(&self) -> Option<&Arc<LocalAudioTrack>> {
        self.tracks.iter().find(|t| t.is_live() && t.is_enabled())
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }

    /// Stop every track, releasing the device
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Source of microphone captures
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Acquire a new capture. Permission or device failures are returned as errors.
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalStream>;
}

/// Remote audio received from a peer
pub trait RemoteAudio: Send + Sync + fmt::Debug {
    fn stream_id(&self) -> &str;
    fn track_id(&self) -> &str;

    /// Stop receiving media for this stream
    fn stop(&self);

    /// Underlying RTP track when the stream comes from a real peer connection
    fn rtp_track(&self) -> Option<Arc<webrtc::track::track_remote::TrackRemote>> {
        None
    }
}

pub type RemoteStream = Arc<dyn RemoteAudio>;

/// Output for a single peer's audio
pub trait AudioSink: Send + Sync {
    fn bind(&self, stream: RemoteStream) -> Result<()>;

    /// Stop playback and drop the bound stream. Must be idempotent.
    fn release(&self);
}

/// Creates one sink per connected peer
pub trait AudioSinkFactory: Send + Sync {
    fn create(&self, peer_id: &PeerId) -> Box<dyn AudioSink>;
}
