//! In-memory fakes for the hardware and network seams

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::config::IceServerConfig;
use crate::connection::{
    ConnectionEvent, ConnectionEvents, ConnectionState, IceCandidate, MediaConnection,
    PeerConnector, SdpType, SessionDescription,
};
use crate::error::{Error, Result};
use crate::manager::MeshListener;
use crate::media::{
    media_id, AudioCapture, AudioSink, AudioSinkFactory, CaptureConstraints, FrequencyAnalyser,
    LocalAudioTrack, LocalStream, RemoteAudio, RemoteStream,
};
use crate::types::{PeerId, UserId};

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub struct StaticAnalyser(u8);

impl StaticAnalyser {
    pub fn new(level: u8) -> Self {
        Self(level)
    }
}

impl FrequencyAnalyser for StaticAnalyser {
    fn byte_frequency_data(&self) -> Vec<u8> {
        vec![self.0; 32]
    }
}

/// Analyser whose level the test moves around
#[derive(Clone, Default)]
pub struct ScriptedAnalyser {
    level: Arc<AtomicU8>,
    samples: Arc<AtomicUsize>,
}

impl ScriptedAnalyser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_level(&self, level: u8) {
        self.level.store(level, Ordering::SeqCst);
    }

    pub fn samples_taken(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

impl FrequencyAnalyser for ScriptedAnalyser {
    fn byte_frequency_data(&self) -> Vec<u8> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        vec![self.level.load(Ordering::SeqCst); 32]
    }
}

/// Single-track stream plus a counter of device releases
pub fn test_stream(id: &str, analyser: ScriptedAnalyser) -> (LocalStream, Arc<AtomicUsize>) {
    let released = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&released);
    let track = LocalAudioTrack::opus(format!("{id}-mic"), id, Arc::new(analyser)).with_release(
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );
    (LocalStream::new(id, vec![Arc::new(track)]), released)
}

#[derive(Debug)]
pub struct FakeRemote {
    id: String,
    stopped: AtomicBool,
}

impl FakeRemote {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl RemoteAudio for FakeRemote {
    fn stream_id(&self) -> &str {
        &self.id
    }

    fn track_id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct SinkCounts {
    binds: usize,
    releases: usize,
}

/// Sink factory counting binds and releases per peer
#[derive(Default)]
pub struct RecordingSinks {
    counts: Arc<Mutex<HashMap<PeerId, SinkCounts>>>,
}

impl RecordingSinks {
    pub fn binds(&self, peer_id: &PeerId) -> usize {
        self.counts.lock().get(peer_id).map_or(0, |c| c.binds)
    }

    pub fn releases(&self, peer_id: &PeerId) -> usize {
        self.counts.lock().get(peer_id).map_or(0, |c| c.releases)
    }
}

struct RecordingSink {
    peer_id: PeerId,
    counts: Arc<Mutex<HashMap<PeerId, SinkCounts>>>,
}

impl AudioSink for RecordingSink {
    fn bind(&self, _stream: RemoteStream) -> Result<()> {
        self.counts
            .lock()
            .entry(self.peer_id.clone())
            .or_default()
            .binds += 1;
        Ok(())
    }

    fn release(&self) {
        self.counts
            .lock()
            .entry(self.peer_id.clone())
            .or_default()
            .releases += 1;
    }
}

impl AudioSinkFactory for RecordingSinks {
    fn create(&self, peer_id: &PeerId) -> Box<dyn AudioSink> {
        Box::new(RecordingSink {
            peer_id: peer_id.clone(),
            counts: Arc::clone(&self.counts),
        })
    }
}

/// Capture that hands out scripted streams, or fails like a denied permission
#[derive(Default)]
pub struct FakeCapture {
    failing: AtomicBool,
    acquisitions: AtomicUsize,
    analyser: ScriptedAnalyser,
    released: Arc<AtomicUsize>,
    last_constraints: Mutex<Option<CaptureConstraints>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn analyser(&self) -> ScriptedAnalyser {
        self.analyser.clone()
    }

    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        *self.last_constraints.lock()
    }
}

#[async_trait]
impl AudioCapture for FakeCapture {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalStream> {
        *self.last_constraints.lock() = Some(*constraints);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Capture("permission denied".to_string()));
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        let stream_id = media_id();
        let released = Arc::clone(&self.released);
        let track = LocalAudioTrack::opus(
            media_id(),
            stream_id.clone(),
            Arc::new(self.analyser.clone()),
        )
        .with_release(move || {
            released.fetch_add(1, Ordering::SeqCst);
        });
        Ok(LocalStream::new(stream_id, vec![Arc::new(track)]))
    }
}

/// Shared medium that pairs fake connections of different participants.
///
/// An answerer registers under the offer it answered; the offerer links up
/// when it applies that answer. Only linked, open pairs ever carry audio.
#[derive(Default)]
pub struct FakeNetwork {
    answerers: Mutex<HashMap<String, Weak<FakeConnection>>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// In-memory connection. Standalone ones complete as soon as both
/// descriptions are applied; networked ones only once paired.
pub struct FakeConnection {
    peer_id: PeerId,
    events: ConnectionEvents,
    network: Option<Arc<FakeNetwork>>,
    this: Weak<FakeConnection>,
    partner: Mutex<Weak<FakeConnection>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    tracks: AtomicUsize,
    completed: AtomicBool,
    closed: AtomicBool,
}

impl FakeConnection {
    fn new(
        peer_id: &PeerId,
        events: ConnectionEvents,
        network: Option<Arc<FakeNetwork>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            peer_id: peer_id.clone(),
            events,
            network,
            this: this.clone(),
            partner: Mutex::new(Weak::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            tracks: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn emit_state(&self, state: ConnectionState) {
        let _ = self.events.send(ConnectionEvent::StateChanged(state));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether remote audio started flowing on this connection
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// The open connection at the other end, if paired
    pub fn partner(&self) -> Option<Arc<FakeConnection>> {
        self.partner.lock().upgrade().filter(|p| !p.is_closed())
    }

    pub fn track_count(&self) -> usize {
        self.tracks.load(Ordering::SeqCst)
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Negotiation("connection closed".to_string()));
        }
        Ok(())
    }

    fn complete(&self) {
        if self.is_closed() || self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit_state(ConnectionState::Connected);
        let remote = FakeRemote::new(&format!("remote-{}", self.peer_id));
        let _ = self.events.send(ConnectionEvent::Track(Arc::new(remote)));
    }

    fn maybe_complete(&self) {
        if self.network.is_some() {
            return;
        }
        if self.local.lock().is_some() && self.remote.lock().is_some() {
            self.complete();
        }
    }

    /// Register as the answerer of the offer currently applied as remote
    fn register_answer(&self) {
        let Some(network) = &self.network else {
            return;
        };
        let Some(offer) = self.remote.lock().as_ref().map(|d| d.sdp.clone()) else {
            return;
        };
        network.answerers.lock().insert(offer, self.this.clone());
    }

    /// Link with the connection that produced `answer` to our own offer
    fn pair_with_answerer(&self, answer: &SessionDescription) {
        let Some(network) = &self.network else {
            return;
        };
        let Some(offer) = self
            .local
            .lock()
            .as_ref()
            .filter(|d| d.sdp_type == SdpType::Offer)
            .map(|d| d.sdp.clone())
        else {
            return;
        };
        let Some(answerer) = network.answerers.lock().get(&offer).and_then(Weak::upgrade) else {
            return;
        };
        let answered = answerer.local.lock().as_ref().map(|d| d.sdp.clone());
        if answerer.is_closed() || answered.as_deref() != Some(answer.sdp.as_str()) {
            return;
        }

        *self.partner.lock() = Arc::downgrade(&answerer);
        *answerer.partner.lock() = self.this.clone();
        answerer.complete();
        self.complete();
    }
}

#[async_trait]
impl MediaConnection for FakeConnection {
    async fn add_local_track(&self, _track: &Arc<LocalAudioTrack>) -> Result<()> {
        self.check_open()?;
        self.tracks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        Ok(SessionDescription::offer(format!(
            "offer-for-{}-{}",
            self.peer_id,
            nanoid::nanoid!(8)
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        let Some(offer) = self.remote.lock().as_ref().map(|d| d.sdp.clone()) else {
            return Err(Error::Negotiation("no remote offer".to_string()));
        };
        Ok(SessionDescription::answer(format!("answer-to-{offer}")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.check_open()?;
        let is_answer = desc.sdp_type == SdpType::Answer;
        *self.local.lock() = Some(desc);
        if is_answer {
            self.register_answer();
        }
        let _ = self.events.send(ConnectionEvent::IceCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        self.maybe_complete();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.check_open()?;
        if desc.sdp == "bad" {
            return Err(Error::Negotiation("malformed sdp".to_string()));
        }
        if desc.sdp_type == SdpType::Answer {
            self.pair_with_answerer(&desc);
        }
        *self.remote.lock() = Some(desc);
        self.maybe_complete();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.check_open()?;
        if candidate.candidate == "bad" {
            return Err(Error::Negotiation("malformed candidate".to_string()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.emit_state(ConnectionState::Closed);
        let partner = self.partner.lock().upgrade();
        if let Some(partner) = partner.filter(|p| !p.is_closed()) {
            partner.emit_state(ConnectionState::Disconnected);
        }
        Ok(())
    }
}

/// Connector handing out fake connections, standalone or on a shared network
#[derive(Default)]
pub struct FakeConnector {
    network: Option<Arc<FakeNetwork>>,
    failing: AtomicBool,
    connections: Mutex<Vec<(PeerId, Arc<FakeConnection>)>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(network: &Arc<FakeNetwork>) -> Self {
        Self {
            network: Some(Arc::clone(network)),
            ..Self::default()
        }
    }

    pub fn set_fail_connect(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn latest(&self, peer_id: &PeerId) -> Option<Arc<FakeConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == peer_id)
            .map(|(_, c)| Arc::clone(c))
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        peer_id: &PeerId,
        _ice_servers: &[IceServerConfig],
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("connector unavailable".to_string()));
        }
        let connection = FakeConnection::new(peer_id, events, self.network.clone());
        self.connections
            .lock()
            .push((peer_id.clone(), Arc::clone(&connection)));
        Ok(connection)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Speaking(UserId, bool),
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<MeshEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<MeshEvent> {
        self.events.lock().clone()
    }

    pub fn connected_count(&self, peer_id: &PeerId) -> usize {
        self.count(&MeshEvent::Connected(peer_id.clone()))
    }

    pub fn disconnected_count(&self, peer_id: &PeerId) -> usize {
        self.count(&MeshEvent::Disconnected(peer_id.clone()))
    }

    fn count(&self, event: &MeshEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }
}

impl MeshListener for RecordingListener {
    fn on_peer_connected(&self, peer_id: &PeerId, _stream: RemoteStream) {
        self.events
            .lock()
            .push(MeshEvent::Connected(peer_id.clone()));
    }

    fn on_peer_disconnected(&self, peer_id: &PeerId) {
        self.events
            .lock()
            .push(MeshEvent::Disconnected(peer_id.clone()));
    }

    fn on_speaking_changed(&self, user_id: &UserId, is_speaking: bool) {
        self.events
            .lock()
            .push(MeshEvent::Speaking(user_id.clone(), is_speaking));
    }
}
