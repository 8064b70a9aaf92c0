//! Peer Connection Manager
//!
//! Owns every per-peer media session of the local participant and drives
//! each one through offer / answer / candidate exchange:
//! - one [`Peer`] per remote id, reserved before the first await
//! - superseded attempts are closed and abandoned after each await
//! - terminal connection states tear the peer down, no reconnection
//! - peer-connected / peer-disconnected fire once per entry

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::IceServerConfig;
use crate::connection::{
    ConnectionEvent, IceCandidate, MediaConnection, PeerConnector, SessionDescription,
};
use crate::error::Result;
use crate::media::{AudioSinkFactory, LocalStream, RemoteStream};
use crate::peer::{Direction, Peer, PeerInfo, PeerState};
use crate::signaling::{SignalKind, SignalingTransport};
use crate::types::{PeerId, UserId};

/// Upper bound of remote candidates buffered per peer before its remote
/// description is applied
const MAX_PENDING_CANDIDATES: usize = 64;

/// Notifications delivered to the application layer.
///
/// Callbacks run synchronously on the mesh's tasks and must not block.
pub trait MeshListener: Send + Sync {
    fn on_peer_connected(&self, peer_id: &PeerId, stream: RemoteStream);
    fn on_peer_disconnected(&self, peer_id: &PeerId);

    /// A remote participant started or stopped vocalizing
    fn on_speaking_changed(&self, _user_id: &UserId, _is_speaking: bool) {}
}

pub struct PeerConnectionManager {
    local_id: UserId,
    ice_servers: Vec<IceServerConfig>,
    connector: Arc<dyn PeerConnector>,
    sinks: Arc<dyn AudioSinkFactory>,
    transport: Arc<SignalingTransport>,
    listener: Arc<dyn MeshListener>,
    peers: Mutex<HashMap<PeerId, Peer>>,
    /// Serializes listener notifications with the peer mutations causing them
    notify: Mutex<()>,
    next_generation: AtomicU64,
}

impl PeerConnectionManager {
    #[must_use]
    pub fn new(
        ice_servers: Vec<IceServerConfig>,
        connector: Arc<dyn PeerConnector>,
        sinks: Arc<dyn AudioSinkFactory>,
        transport: Arc<SignalingTransport>,
        listener: Arc<dyn MeshListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id: transport.local_id().clone(),
            ice_servers,
            connector,
            sinks,
            transport,
            listener,
            peers: Mutex::new(HashMap::new()),
            notify: Mutex::new(()),
            next_generation: AtomicU64::new(1),
        })
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn is_current(&self, peer_id: &PeerId, generation: u64) -> bool {
        self.peers
            .lock()
            .get(peer_id)
            .is_some_and(|p| p.generation == generation)
    }

    /// Start an outbound connection. Returns false when a peer already exists
    /// or the attempt was abandoned.
    pub async fn connect_to_peer(self: &Arc<Self>, peer_id: &PeerId, stream: &LocalStream) -> bool {
        if peer_id == &self.local_id {
            return false;
        }

        let generation = {
            let mut peers = self.peers.lock();
            if peers.contains_key(peer_id) {
                debug!(peer_id = %peer_id, "Peer already present, skipping connect");
                return false;
            }
            let generation = self.next_generation();
            peers.insert(
                peer_id.clone(),
                Peer::reserve(peer_id.clone(), generation, Direction::Outbound),
            );
            generation
        };

        debug!(peer_id = %peer_id, generation, "Connecting to peer");
        let result = self.negotiate_offer(peer_id, generation, stream).await;
        self.finish_negotiation(peer_id, generation, "offer", result).await
    }

    async fn negotiate_offer(
        self: &Arc<Self>,
        peer_id: &PeerId,
        generation: u64,
        stream: &LocalStream,
    ) -> Result<bool> {
        let Some(connection) = self.open_connection(peer_id, generation).await? else {
            return Ok(false);
        };

        for track in stream.audio_tracks() {
            connection.add_local_track(track).await?;
        }
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;

        let recorded = {
            let mut peers = self.peers.lock();
            match peers.get_mut(peer_id).filter(|p| p.generation == generation) {
                Some(peer) => {
                    peer.local_offer = Some(offer.clone());
                    true
                }
                None => false,
            }
        };
        if !recorded {
            return Ok(false);
        }
        self.transport.send(peer_id, SignalKind::Offer, &offer).await;
        Ok(true)
    }

    /// Answer a remote offer. The caller guarantees speaking is enabled and
    /// hands in the local capture.
    pub async fn handle_offer(
        self: &Arc<Self>,
        peer_id: &PeerId,
        offer: SessionDescription,
        stream: &LocalStream,
    ) -> bool {
        if peer_id == &self.local_id {
            return false;
        }

        let (generation, replaced) = {
            let _notify = self.notify.lock();
            let mut peers = self.peers.lock();

            if let Some(existing) = peers.get(peer_id) {
                if existing.direction == Direction::Inbound
                    && existing.offer_sdp.as_deref() == Some(offer.sdp.as_str())
                {
                    debug!(peer_id = %peer_id, "Duplicate offer ignored");
                    return false;
                }
                // Both sides offered at once: the larger id keeps its own offer
                if existing.awaits_answer() && self.local_id > *peer_id {
                    debug!(peer_id = %peer_id, "Colliding offer ignored");
                    return false;
                }
            }

            let generation = self.next_generation();
            let mut peer = Peer::reserve(peer_id.clone(), generation, Direction::Inbound);
            peer.offer_sdp = Some(offer.sdp.clone());

            let replaced = peers.insert(peer_id.clone(), peer);
            drop(peers);

            let replaced = replaced.map(|mut old| {
                old.release_media();
                if old.announced {
                    self.listener.on_peer_disconnected(peer_id);
                }
                old
            });
            (generation, replaced)
        };

        if let Some(old) = replaced {
            debug!(peer_id = %peer_id, old_generation = old.generation, "Replacing peer session");
            shutdown(old).await;
        }

        let result = self.negotiate_answer(peer_id, generation, offer, stream).await;
        self.finish_negotiation(peer_id, generation, "answer", result).await
    }

    async fn negotiate_answer(
        self: &Arc<Self>,
        peer_id: &PeerId,
        generation: u64,
        offer: SessionDescription,
        stream: &LocalStream,
    ) -> Result<bool> {
        let Some(connection) = self.open_connection(peer_id, generation).await? else {
            return Ok(false);
        };

        connection.set_remote_description(offer).await?;
        self.flush_candidates(peer_id, generation, &connection).await;

        for track in stream.audio_tracks() {
            connection.add_local_track(track).await?;
        }
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;

        if !self.is_current(peer_id, generation) {
            return Ok(false);
        }
        self.transport.send(peer_id, SignalKind::Answer, &answer).await;
        Ok(true)
    }

    async fn finish_negotiation(
        &self,
        peer_id: &PeerId,
        generation: u64,
        step: &str,
        result: Result<bool>,
    ) -> bool {
        match result {
            Ok(true) => {
                info!(peer_id = %peer_id, step, "Sent session description");
                true
            }
            Ok(false) => {
                debug!(peer_id = %peer_id, generation, "Negotiation superseded");
                false
            }
            Err(e) => {
                if self.is_current(peer_id, generation) {
                    warn!(peer_id = %peer_id, step, error = %e, "Negotiation failed");
                    self.disconnect_generation(peer_id, generation).await;
                } else {
                    debug!(peer_id = %peer_id, error = %e, "Abandoned negotiation failed");
                }
                false
            }
        }
    }

    /// Build the connection for a reserved peer. `None` when the reservation
    /// was superseded meanwhile; the fresh connection is closed in that case.
    async fn open_connection(
        self: &Arc<Self>,
        peer_id: &PeerId,
        generation: u64,
    ) -> Result<Option<Arc<dyn MediaConnection>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = self
            .connector
            .connect(peer_id, &self.ice_servers, tx)
            .await?;
        let pump = self.spawn_event_pump(peer_id.clone(), generation, rx);

        {
            let mut peers = self.peers.lock();
            if let Some(peer) = peers
                .get_mut(peer_id)
                .filter(|p| p.generation == generation)
            {
                peer.connection = Some(Arc::clone(&connection));
                peer.events_task = Some(pump);
                return Ok(Some(connection));
            }
        }

        pump.abort();
        if let Err(e) = connection.close().await {
            debug!(peer_id = %peer_id, error = %e, "Closing abandoned connection failed");
        }
        Ok(None)
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        peer_id: PeerId,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager
                    .on_connection_event(&peer_id, generation, event)
                    .await;
            }
        })
    }

    async fn on_connection_event(&self, peer_id: &PeerId, generation: u64, event: ConnectionEvent) {
        match event {
            ConnectionEvent::IceCandidate(candidate) => {
                {
                    let mut peers = self.peers.lock();
                    let Some(peer) = peers
                        .get_mut(peer_id)
                        .filter(|p| p.generation == generation)
                    else {
                        return;
                    };
                    if peer.awaits_answer() && peer.sent_candidates.len() < MAX_PENDING_CANDIDATES {
                        peer.sent_candidates.push(candidate.clone());
                    }
                }
                self.transport
                    .send(peer_id, SignalKind::IceCandidate, &candidate)
                    .await;
            }
            ConnectionEvent::Track(stream) => self.attach_remote(peer_id, generation, stream),
            ConnectionEvent::StateChanged(state) => {
                debug!(peer_id = %peer_id, generation, state = ?state, "Connection state");
                if state.is_terminal() {
                    self.disconnect_generation(peer_id, generation).await;
                }
            }
        }
    }

    fn attach_remote(&self, peer_id: &PeerId, generation: u64, stream: RemoteStream) {
        let _notify = self.notify.lock();
        let announce = {
            let mut peers = self.peers.lock();
            let Some(peer) = peers
                .get_mut(peer_id)
                .filter(|p| p.generation == generation)
            else {
                stream.stop();
                return;
            };
            if peer.remote_stream.is_some() {
                debug!(
                    peer_id = %peer_id,
                    track_id = %stream.track_id(),
                    "Extra remote track ignored"
                );
                return;
            }

            let sink = self.sinks.create(peer_id);
            if let Err(e) = sink.bind(Arc::clone(&stream)) {
                warn!(peer_id = %peer_id, error = %e, "Failed to bind remote audio");
            }
            peer.sink = Some(sink);
            peer.remote_stream = Some(Arc::clone(&stream));
            peer.state = PeerState::Connected;
            !std::mem::replace(&mut peer.announced, true)
        };

        if announce {
            info!(peer_id = %peer_id, stream_id = %stream.stream_id(), "Peer connected");
            self.listener.on_peer_connected(peer_id, stream);
        }
    }

    /// Apply the answer to an outbound offer
    pub async fn handle_answer(&self, peer_id: &PeerId, answer: SessionDescription) -> bool {
        let (generation, connection) = {
            let peers = self.peers.lock();
            match peers.get(peer_id) {
                Some(peer) if peer.awaits_answer() => match &peer.connection {
                    Some(connection) => (peer.generation, Arc::clone(connection)),
                    None => {
                        warn!(peer_id = %peer_id, "Answer before offer was sent, dropped");
                        return false;
                    }
                },
                Some(peer) => {
                    warn!(
                        peer_id = %peer_id,
                        state = ?peer.state,
                        direction = ?peer.direction,
                        "Unexpected answer dropped"
                    );
                    return false;
                }
                None => {
                    warn!(peer_id = %peer_id, "Answer from unknown peer dropped");
                    return false;
                }
            }
        };

        if let Err(e) = connection.set_remote_description(answer).await {
            warn!(peer_id = %peer_id, error = %e, "Failed to apply answer");
            self.disconnect_generation(peer_id, generation).await;
            return false;
        }
        self.flush_candidates(peer_id, generation, &connection).await;
        true
    }

    /// Add a remote candidate, buffering it until the remote description is set
    pub async fn handle_ice_candidate(&self, peer_id: &PeerId, candidate: IceCandidate) -> bool {
        let connection = {
            let mut peers = self.peers.lock();
            let Some(peer) = peers.get_mut(peer_id) else {
                warn!(peer_id = %peer_id, "Candidate from unknown peer dropped");
                return false;
            };
            match &peer.connection {
                Some(connection) if peer.remote_description_set => Arc::clone(connection),
                _ => {
                    if peer.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
                        warn!(peer_id = %peer_id, "Candidate buffer full, dropping candidate");
                        return false;
                    }
                    peer.pending_candidates.push(candidate);
                    return true;
                }
            }
        };

        if let Err(e) = connection.add_ice_candidate(candidate).await {
            warn!(peer_id = %peer_id, error = %e, "Failed to add ICE candidate");
            return false;
        }
        true
    }

    async fn flush_candidates(
        &self,
        peer_id: &PeerId,
        generation: u64,
        connection: &Arc<dyn MediaConnection>,
    ) {
        let pending = {
            let mut peers = self.peers.lock();
            match peers
                .get_mut(peer_id)
                .filter(|p| p.generation == generation)
            {
                Some(peer) => {
                    peer.remote_description_set = true;
                    peer.local_offer = None;
                    peer.sent_candidates.clear();
                    std::mem::take(&mut peer.pending_candidates)
                }
                None => return,
            }
        };

        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!(peer_id = %peer_id, error = %e, "Failed to add buffered ICE candidate");
            }
        }
    }

    /// Tear down one peer. Returns false when there was nothing to tear down.
    pub async fn disconnect_from_peer(&self, peer_id: &PeerId) -> bool {
        self.remove_peer(peer_id, None).await
    }

    async fn disconnect_generation(&self, peer_id: &PeerId, generation: u64) -> bool {
        self.remove_peer(peer_id, Some(generation)).await
    }

    async fn remove_peer(&self, peer_id: &PeerId, generation: Option<u64>) -> bool {
        let removed = {
            let _notify = self.notify.lock();
            let mut peers = self.peers.lock();
            let matches = peers
                .get(peer_id)
                .is_some_and(|p| generation.map_or(true, |g| g == p.generation));
            if !matches {
                return false;
            }
            let Some(mut peer) = peers.remove(peer_id) else {
                return false;
            };
            drop(peers);

            peer.release_media();
            if peer.announced {
                self.listener.on_peer_disconnected(peer_id);
            }
            peer
        };

        info!(peer_id = %peer_id, generation = removed.generation, "Peer disconnected");
        shutdown(removed).await;
        true
    }

    /// Send the pending offer of an outbound peer again, followed by the
    /// candidates gathered for it. Used when the peer announces itself after
    /// the offer went out and may never have received it. Returns false when
    /// there is no unanswered offer for `peer_id`.
    pub async fn resend_offer(&self, peer_id: &PeerId) -> bool {
        let (offer, candidates) = {
            let peers = self.peers.lock();
            match peers.get(peer_id) {
                Some(peer) if peer.awaits_answer() => match &peer.local_offer {
                    Some(offer) => (offer.clone(), peer.sent_candidates.clone()),
                    None => return false,
                },
                _ => return false,
            }
        };

        debug!(peer_id = %peer_id, candidates = candidates.len(), "Re-sending unanswered offer");
        self.transport.send(peer_id, SignalKind::Offer, &offer).await;
        for candidate in &candidates {
            self.transport
                .send(peer_id, SignalKind::IceCandidate, candidate)
                .await;
        }
        true
    }

    /// Tear down every peer
    pub async fn disconnect_from_all_peers(&self) {
        let ids: Vec<PeerId> = self.peers.lock().keys().cloned().collect();
        for id in ids {
            self.disconnect_from_peer(&id).await;
        }
    }

    /// Disconnect every peer that is not in `allowed`
    pub async fn retain_peers(&self, allowed: &HashSet<PeerId>) {
        let stale: Vec<PeerId> = self
            .peers
            .lock()
            .keys()
            .filter(|id| !allowed.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            debug!(peer_id = %id, "Pruning stale peer");
            self.disconnect_from_peer(&id).await;
        }
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.lock().contains_key(peer_id)
    }

    #[must_use]
    pub fn peer_state(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.peers.lock().get(peer_id).map(|p| p.state)
    }

    /// Snapshot of all peers, ordered by id
    #[must_use]
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.lock().values().map(PeerInfo::from).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }
}

/// Close the connection of a peer already removed from the map, then stop its
/// event pump. The pump may be the caller, so it is aborted last.
async fn shutdown(mut peer: Peer) {
    peer.release_media();
    if let Some(connection) = peer.connection.take() {
        if let Err(e) = connection.close().await {
            debug!(peer_id = %peer.id, error = %e, "Error closing connection");
        }
    }
    if let Some(task) = peer.events_task.take() {
        task.abort();
    }
}
