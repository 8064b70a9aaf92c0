//! Mesh session for one (space, user) pair
//!
//! A [`MeshSession`] owns the local capture, the level detector and the peer
//! connection manager of a participant in one space. It reacts to inbound
//! signaling on its own tasks and sequences speaking transitions so that
//! enabling, disabling, promotion-on-offer and cleanup never interleave.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::connection::{PeerConnector, SessionDescription};
use crate::detector::LevelDetector;
use crate::error::Result;
use crate::manager::{MeshListener, PeerConnectionManager};
use crate::media::{AudioCapture, AudioSinkFactory, LocalStream};
use crate::peer::{PeerInfo, PeerState};
use crate::roster::Roster;
use crate::signaling::{Inbound, SignalingChannel, SignalingTransport, Subscription};
use crate::types::{ParticipantRole, PeerId, SpaceId, UserId};

/// Collaborators a session is built from
#[derive(Clone)]
pub struct MeshDeps {
    pub config: MeshConfig,
    pub capture: Arc<dyn AudioCapture>,
    pub roster: Arc<dyn Roster>,
    pub channel: Arc<dyn SignalingChannel>,
    pub connector: Arc<dyn PeerConnector>,
    pub sinks: Arc<dyn AudioSinkFactory>,
    pub listener: Arc<dyn MeshListener>,
}

#[derive(Default)]
struct SessionState {
    /// Present iff speaking is enabled
    stream: Option<LocalStream>,
    detector: Option<LevelDetector>,
    speaking_enabled: bool,
    vocalizing: bool,
    muted: bool,
    known_speakers: HashSet<UserId>,
}

pub struct MeshSession {
    space_id: SpaceId,
    user_id: UserId,
    config: MeshConfig,
    capture: Arc<dyn AudioCapture>,
    roster: Arc<dyn Roster>,
    listener: Arc<dyn MeshListener>,
    transport: Arc<SignalingTransport>,
    manager: Arc<PeerConnectionManager>,
    state: Mutex<SessionState>,
    /// Serializes enable / disable / promotion / cleanup
    transition: tokio::sync::Mutex<()>,
    vocal_tx: mpsc::UnboundedSender<bool>,
    cancel: CancellationToken,
    /// Unsubscribe handles of the signaling subscriptions
    subscriptions: Mutex<Vec<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshSession {
    /// Subscribe to the space's signaling topics and pre-load its speakers
    pub async fn open(space_id: SpaceId, user_id: UserId, deps: &MeshDeps) -> Result<Arc<Self>> {
        let transport = Arc::new(SignalingTransport::new(
            space_id.clone(),
            user_id.clone(),
            deps.config.relay_topic.clone(),
            Arc::clone(&deps.channel),
            Arc::clone(&deps.roster),
        ));
        let subscriptions = transport.subscribe().await?;

        let manager = PeerConnectionManager::new(
            deps.config.ice_servers.clone(),
            Arc::clone(&deps.connector),
            Arc::clone(&deps.sinks),
            Arc::clone(&transport),
            Arc::clone(&deps.listener),
        );

        let (vocal_tx, vocal_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            space_id,
            user_id,
            config: deps.config.clone(),
            capture: Arc::clone(&deps.capture),
            roster: Arc::clone(&deps.roster),
            listener: Arc::clone(&deps.listener),
            transport,
            manager,
            state: Mutex::new(SessionState::default()),
            transition: tokio::sync::Mutex::new(()),
            vocal_tx,
            cancel: CancellationToken::new(),
            subscriptions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::with_capacity(subscriptions.len() + 1);
        let mut handles = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            handles.push(subscription.cancellation());
            tasks.push(tokio::spawn(dispatch_loop(
                Arc::downgrade(&session),
                subscription,
                session.cancel.clone(),
            )));
        }
        tasks.push(tokio::spawn(vocalizing_loop(
            Arc::downgrade(&session),
            vocal_rx,
            session.cancel.clone(),
        )));
        *session.tasks.lock() = tasks;
        *session.subscriptions.lock() = handles;

        match session.fetch_speakers().await {
            Ok(speakers) => session.state.lock().known_speakers = speakers,
            Err(e) => warn!(
                space_id = %session.space_id,
                error = %e,
                "Failed to pre-load speakers"
            ),
        }

        info!(
            space_id = %session.space_id,
            user_id = %session.user_id,
            "Mesh session opened"
        );
        Ok(session)
    }

    #[must_use]
    pub fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn is_speaking_enabled(&self) -> bool {
        self.state.lock().speaking_enabled
    }

    /// Whether the local detector currently hears the user speaking
    #[must_use]
    pub fn is_vocalizing(&self) -> bool {
        self.state.lock().vocalizing
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn has_local_stream(&self) -> bool {
        self.state.lock().stream.is_some()
    }

    /// Hosts and speakers this session would connect to, ordered by id
    #[must_use]
    pub fn known_speakers(&self) -> Vec<UserId> {
        let mut speakers: Vec<UserId> = self.state.lock().known_speakers.iter().cloned().collect();
        speakers.sort();
        speakers
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.manager.peers().into_iter().map(|p| p.id).collect()
    }

    #[must_use]
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.manager.peers()
    }

    #[must_use]
    pub fn peer_state(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.manager.peer_state(peer_id)
    }

    fn local_stream(&self) -> Option<LocalStream> {
        self.state.lock().stream.clone()
    }

    /// Turn speaking on or off. Returns the resulting state for no-op calls,
    /// `false` when capture could not be acquired and `true` otherwise.
    pub async fn enable_speaking(&self, enable: bool) -> bool {
        let _transition = self.transition.lock().await;
        if self.is_closed() {
            warn!(space_id = %self.space_id, "Speaking change on a closed session");
            return false;
        }

        let current = self.is_speaking_enabled();
        if current == enable {
            debug!(space_id = %self.space_id, enabled = current, "Speaking state unchanged");
            return current;
        }

        if enable {
            self.start_speaking(None).await
        } else {
            self.stop_speaking().await;
            true
        }
    }

    /// Caller holds the transition lock
    async fn start_speaking(&self, skip: Option<&PeerId>) -> bool {
        let stream = match self.capture.acquire(&self.config.capture).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(space_id = %self.space_id, error = %e, "Failed to acquire audio capture");
                return false;
            }
        };

        let tx = self.vocal_tx.clone();
        let detector = match LevelDetector::start(
            &stream,
            &self.config.detector,
            Arc::new(move |speaking| {
                let _ = tx.send(speaking);
            }),
        ) {
            Ok(detector) => Some(detector),
            Err(e) => {
                warn!(space_id = %self.space_id, error = %e, "Level detector not started");
                None
            }
        };

        {
            let mut state = self.state.lock();
            state.stream = Some(stream.clone());
            state.detector = detector;
            state.speaking_enabled = true;
            state.vocalizing = false;
            state.muted = false;
        }

        self.transport.announce_role(true).await;

        match self.fetch_speakers().await {
            Ok(speakers) => self.state.lock().known_speakers.extend(speakers),
            Err(e) => warn!(space_id = %self.space_id, error = %e, "Failed to load speakers"),
        }

        let targets: Vec<UserId> = self
            .known_speakers()
            .into_iter()
            .filter(|id| id != &self.user_id && Some(id) != skip)
            .collect();
        let connected = join_all(
            targets
                .iter()
                .map(|peer_id| self.manager.connect_to_peer(peer_id, &stream)),
        )
        .await;

        info!(
            space_id = %self.space_id,
            user_id = %self.user_id,
            targets = targets.len(),
            offers = connected.iter().filter(|ok| **ok).count(),
            "Speaking enabled"
        );
        true
    }

    /// Caller holds the transition lock
    async fn stop_speaking(&self) {
        let (stream, detector, was_vocalizing) = {
            let mut state = self.state.lock();
            state.speaking_enabled = false;
            state.muted = false;
            let was_vocalizing = std::mem::replace(&mut state.vocalizing, false);
            (state.stream.take(), state.detector.take(), was_vocalizing)
        };

        if let Some(stream) = stream {
            stream.stop();
        }
        if let Some(detector) = detector {
            detector.stop();
        }
        self.manager.disconnect_from_all_peers().await;

        if was_vocalizing {
            self.transport.broadcast_speaking(false).await;
        }
        self.transport.announce_role(false).await;
        info!(space_id = %self.space_id, user_id = %self.user_id, "Speaking disabled");
    }

    /// Gate the local tracks. Connections stay up and carry silence while muted.
    pub async fn set_muted(&self, muted: bool) {
        {
            let mut state = self.state.lock();
            let Some(stream) = state.stream.as_ref() else {
                debug!(space_id = %self.space_id, "Mute without capture ignored");
                return;
            };
            stream.set_enabled(!muted);
            state.muted = muted;
            if muted {
                if let Some(detector) = state.detector.as_ref() {
                    detector.force_silent();
                }
                state.vocalizing = false;
            }
        }

        debug!(space_id = %self.space_id, muted, "Local audio gated");
        if muted {
            self.transport.broadcast_speaking(false).await;
        }
    }

    /// Re-query the roster and drop peers that are no longer hosts or speakers
    pub async fn refresh_roster(&self) -> Result<usize> {
        let speakers = self.fetch_speakers().await?;
        let count = speakers.len();
        self.state.lock().known_speakers = speakers.clone();
        self.manager.retain_peers(&speakers).await;
        debug!(space_id = %self.space_id, speakers = count, "Roster refreshed");
        Ok(count)
    }

    async fn fetch_speakers(&self) -> Result<HashSet<UserId>> {
        let participants = self
            .roster
            .participants(&self.space_id, &ParticipantRole::MESH_ROLES)
            .await?;
        Ok(participants
            .into_iter()
            .map(|p| p.user_id)
            .filter(|id| id != &self.user_id)
            .collect())
    }

    /// Stop capture, detector, peers and subscriptions. Safe to repeat.
    pub async fn cleanup(&self) {
        let _transition = self.transition.lock().await;
        self.cancel.cancel();

        let (stream, detector) = {
            let mut state = self.state.lock();
            let taken = (state.stream.take(), state.detector.take());
            *state = SessionState::default();
            taken
        };
        if let Some(stream) = stream {
            stream.stop();
        }
        if let Some(detector) = detector {
            detector.stop();
        }
        self.manager.disconnect_from_all_peers().await;

        for subscription in self.subscriptions.lock().drain(..) {
            subscription.cancel();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if !tasks.is_empty() {
            for task in tasks {
                task.abort();
            }
            info!(space_id = %self.space_id, user_id = %self.user_id, "Mesh session closed");
        }
    }

    async fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Offer { from, description } => self.on_offer(from, description).await,
            Inbound::Answer { from, description } => {
                self.manager.handle_answer(&from, description).await;
            }
            Inbound::IceCandidate { from, candidate } => {
                self.manager.handle_ice_candidate(&from, candidate).await;
            }
            Inbound::SpeakerJoined(user_id) => {
                debug!(space_id = %self.space_id, user_id = %user_id, "Speaker joined");
                // An offer sent before the speaker subscribed was never heard.
                // Crossing offers are settled by the glare rule on arrival.
                self.manager.resend_offer(&user_id).await;
                self.state.lock().known_speakers.insert(user_id);
            }
            Inbound::SpeakerLeft(user_id) => {
                debug!(space_id = %self.space_id, user_id = %user_id, "Speaker left");
                self.state.lock().known_speakers.remove(&user_id);
                self.manager.disconnect_from_peer(&user_id).await;
            }
            Inbound::UserSpeaking {
                user_id,
                is_speaking,
            } => self.listener.on_speaking_changed(&user_id, is_speaking),
        }
    }

    async fn on_offer(&self, from: PeerId, offer: SessionDescription) {
        let _transition = self.transition.lock().await;
        if self.is_closed() {
            return;
        }

        if !self.is_speaking_enabled() {
            if !self.config.promote_on_offer {
                warn!(peer_id = %from, "Offer received while not speaking, rejected");
                return;
            }
            info!(peer_id = %from, "Promoting to speaker to answer offer");
            if !self.start_speaking(Some(&from)).await {
                warn!(peer_id = %from, "Promotion failed, offer dropped");
                return;
            }
        }

        let Some(stream) = self.local_stream() else {
            return;
        };
        self.state.lock().known_speakers.insert(from.clone());
        self.manager.handle_offer(&from, offer, &stream).await;
    }

    async fn on_local_vocalizing(&self, speaking: bool) {
        {
            let mut state = self.state.lock();
            if !state.speaking_enabled {
                return;
            }
            state.vocalizing = speaking;
        }
        self.transport.broadcast_speaking(speaking).await;
    }
}

impl Drop for MeshSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn dispatch_loop(
    session: Weak<MeshSession>,
    mut subscription: Subscription,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            message = subscription.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let Some(session) = session.upgrade() else {
            break;
        };
        if let Some(inbound) = session.transport.decode(&message) {
            session.handle_inbound(inbound).await;
        }
    }
    debug!(topic = %subscription.topic(), "Signaling dispatch stopped");
}

async fn vocalizing_loop(
    session: Weak<MeshSession>,
    mut changes: mpsc::UnboundedReceiver<bool>,
    cancel: CancellationToken,
) {
    loop {
        let speaking = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            change = changes.recv() => match change {
                Some(speaking) => speaking,
                None => break,
            },
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        session.on_local_vocalizing(speaking).await;
    }
}
