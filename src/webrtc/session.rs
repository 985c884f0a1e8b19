//! Connection registry
//!
//! Owns every live [`Connection`], wires media between them and drives
//! their negotiation on behalf of the HTTP signaling surface.

use super::data_channel::{self, ChannelMessage, MessageChannel, ReliableOptions};
use super::media_track::{InboundMedia, MediaKind, RouteTable, TrackRouter};
use super::negotiation::{ConnectionState, GatheringProgress, Negotiation, NegotiationState, Readiness};
use super::peer_connection::{LinkState, PeerSession, SessionEvent, SessionFactory, SessionRole, SessionSink};
use super::signaling::{ConnectionJson, IceCandidate, SdpType, SessionDescription, StreamMap};
use super::WebRTCError;
use crate::config::{Config, NegotiationConfig, ReliabilityConfig};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Connection lifecycle notifications for the application
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Transport connected for the first time
    Connected { id: String, user_data: Value },
    /// Connection closed after having connected
    Disconnected { id: String },
    /// Application message received from a connection
    Message { id: String, message: ChannelMessage },
}

/// One registered peer connection
pub struct Connection {
    pub id: String,
    pub user_data: Value,
    pub(crate) session: Arc<dyn PeerSession>,
    pub(crate) negotiation: Negotiation,
    /// Serializes negotiation rounds
    signaling: tokio::sync::Mutex<()>,
    /// Local candidates not yet fetched by the peer
    pending_candidates: Mutex<Vec<IceCandidate>>,
    audio_route: Option<String>,
    video_route: Option<String>,
    pub(crate) inbound: InboundMedia,
    /// Other peers' media forwarded to this connection, by peer id
    pub(crate) peer_routes: Mutex<RouteTable>,
    channel: MessageChannel,
    renegotiation_needed: AtomicBool,
    /// Set once the first offer is being produced
    round_started: AtomicBool,
    announced: AtomicBool,
    pub(crate) cancel: CancellationToken,
    created_at: Instant,
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        self.negotiation.state().connection_state()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation.state()
    }

    /// Route carrying this connection's own audio
    pub fn audio_route(&self) -> Option<&str> {
        self.audio_route.as_deref()
    }

    /// Route carrying this connection's own video
    pub fn video_route(&self) -> Option<&str> {
        self.video_route.as_deref()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids = self.peer_routes.lock().peer_ids();
        ids.sort();
        ids
    }

    pub fn has_peer_route(&self, peer_id: &str, kind: MediaKind) -> bool {
        self.peer_routes.lock().contains(peer_id, kind)
    }

    /// Media routes were added after the last description went out
    pub fn renegotiation_needed(&self) -> bool {
        self.renegotiation_needed.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Take the local candidates gathered since the last call
    pub fn take_candidates(&self) -> Vec<IceCandidate> {
        std::mem::take(&mut *self.pending_candidates.lock())
    }

    fn queue_candidate(&self, candidate: IceCandidate) {
        self.pending_candidates.lock().push(candidate);
    }

    /// Routes added before the first offer starts are part of it; any
    /// later route may have missed the offer and needs another round.
    pub(crate) fn note_route_added(&self) {
        if self.round_started.load(Ordering::Acquire) {
            self.renegotiation_needed.store(true, Ordering::Release);
        }
    }

    pub async fn to_json(&self) -> ConnectionJson {
        ConnectionJson {
            user_data: self.user_data.clone(),
            id: self.id.clone(),
            ice_connection_state: self.session.ice_connection_state(),
            local_description: self.session.local_description().await,
            remote_description: self.session.remote_description().await,
            signaling_state: self.session.signaling_state(),
            state: Some(self.state()),
            renegotiation_needed: self.renegotiation_needed(),
        }
    }

    /// Send an event; reliable events are resent in the background
    pub async fn emit(&self, event: &str, data: &Value, reliable: Option<ReliableOptions>) -> Result<(), WebRTCError> {
        match reliable {
            None => data_channel::send_event(self.session.as_ref(), event, data).await,
            Some(options) => {
                data_channel::send_reliable(self.session.clone(), event, data, options, self.cancel.child_token());
                Ok(())
            }
        }
    }

    pub async fn emit_raw(&self, data: Bytes) -> Result<(), WebRTCError> {
        data_channel::send_raw(self.session.as_ref(), data).await
    }
}

/// Registry of live connections
pub struct SessionManager {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    factory: Arc<dyn SessionFactory>,
    router: TrackRouter,
    negotiation: NegotiationConfig,
    reliability: ReliabilityConfig,
    max_connections: usize,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl SessionManager {
    pub fn new(
        config: &Config,
        factory: Arc<dyn SessionFactory>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            factory,
            router: TrackRouter::new(&config.webrtc),
            negotiation: config.negotiation.clone(),
            reliability: config.reliability.clone(),
            max_connections: config.webrtc.max_connections,
            events,
        }
    }

    /// Create a connection, route media with every live peer and produce
    /// the initial offer once candidate gathering settles
    pub async fn create_connection(self: &Arc<Self>, user_data: Value) -> Result<Arc<Connection>, WebRTCError> {
        if self.connection_count() >= self.max_connections {
            return Err(WebRTCError::ConnectionFailed("Maximum connections reached".to_string()));
        }

        let id = self.allocate_id();
        let (sink, events) = SessionSink::new();
        let inbound = sink.media.clone();
        let session = self.factory.create(SessionRole::Offerer, sink).await?;

        let (audio_route, video_route) = match self.add_own_routes(&session).await {
            Ok(routes) => routes,
            Err(e) => {
                let _ = session.close().await;
                return Err(e);
            }
        };

        let (gathering_tx, gathering_rx) = watch::channel(GatheringProgress::default());
        let cancel = CancellationToken::new();
        let connection = Arc::new(Connection {
            id: id.clone(),
            user_data,
            negotiation: Negotiation::new(session.clone(), gathering_rx, cancel.clone()),
            session,
            signaling: tokio::sync::Mutex::new(()),
            pending_candidates: Mutex::new(Vec::new()),
            audio_route,
            video_route,
            inbound,
            peer_routes: Mutex::new(RouteTable::default()),
            channel: MessageChannel::new(self.reliability.window()),
            renegotiation_needed: AtomicBool::new(false),
            round_started: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            cancel,
            created_at: Instant::now(),
        });
        self.spawn_event_pump(&connection, events, gathering_tx);

        // Insert and snapshot under one guard so each pair is linked once.
        let others = {
            let mut connections = self.connections.write();
            if connections.len() >= self.max_connections {
                None
            } else {
                let others: Vec<_> = connections.values().cloned().collect();
                connections.insert(id.clone(), connection.clone());
                Some(others)
            }
        };
        let Some(others) = others else {
            connection.negotiation.close().await;
            return Err(WebRTCError::ConnectionFailed("Maximum connections reached".to_string()));
        };
        info!("Created connection {} ({} other peer(s))", id, others.len());

        if let Err(e) = self.link_new_connection(&connection, &others).await {
            warn!("Failed to route media for {}: {}", id, e);
            self.discard(&connection).await;
            return Err(e);
        }

        let negotiated = {
            let _round = connection.signaling.lock().await;
            self.first_round(&connection).await
        };
        match negotiated {
            Ok(Readiness::Ready) => debug!("Connection {} gathered all candidates", id),
            Ok(Readiness::Degraded) => warn!("Connection {} offered with a partial candidate set", id),
            Err(e) => {
                warn!("Negotiation for {} failed: {}", id, e);
                self.discard(&connection).await;
                return Err(e);
            }
        }

        // Candidates gathered so far are part of the offer.
        connection.take_candidates();
        Ok(connection)
    }

    async fn first_round(&self, connection: &Connection) -> Result<Readiness, WebRTCError> {
        connection.round_started.store(true, Ordering::Release);
        connection.negotiation.initiate().await?;
        connection
            .negotiation
            .await_readiness(self.negotiation.readiness_timeout())
            .await
    }

    fn allocate_id(&self) -> String {
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            if !self.connections.read().contains_key(&id) {
                return id;
            }
        }
    }

    async fn add_own_routes(
        &self,
        session: &Arc<dyn PeerSession>,
    ) -> Result<(Option<String>, Option<String>), WebRTCError> {
        let audio = if self.router.carries(MediaKind::Audio) {
            Some(session.add_receiver(MediaKind::Audio).await?)
        } else {
            None
        };
        let video = if self.router.carries(MediaKind::Video) {
            Some(session.add_receiver(MediaKind::Video).await?)
        } else {
            None
        };
        Ok((audio, video))
    }

    async fn link_new_connection(&self, connection: &Arc<Connection>, others: &[Arc<Connection>]) -> Result<(), WebRTCError> {
        if self.router.kinds().is_empty() {
            return Ok(());
        }

        for other in others {
            let linked = self.router.link(connection, other).await;
            if !self.contains(&other.id) {
                // Closed while being wired up.
                connection.peer_routes.lock().remove_peer(&other.id);
                continue;
            }
            linked?;
            if !self.contains(&connection.id) {
                self.router.unlink(&connection.id, others);
                return Err(WebRTCError::Closed);
            }
        }
        Ok(())
    }

    /// Close a connection that failed before it was handed out
    async fn discard(&self, connection: &Connection) {
        if self.close_connection(&connection.id).await.is_err() {
            connection.negotiation.close().await;
        }
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        gathering: watch::Sender<GatheringProgress>,
    ) {
        let manager = Arc::downgrade(self);
        let weak = Arc::downgrade(connection);
        let cancel = connection.cancel.clone();
        let id = connection.id.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                gathering.send_if_modified(|progress| progress.observe(&event));

                let Some(connection) = weak.upgrade() else { break };
                match event {
                    SessionEvent::Candidate(candidate) => connection.queue_candidate(candidate),
                    SessionEvent::GatheringComplete => debug!("Connection {} finished gathering", id),
                    SessionEvent::ChannelOpen => debug!("Data channel open on {}", id),
                    SessionEvent::Link(LinkState::Connected) => {
                        if connection.negotiation.transport_connected() {
                            info!("Connection {} is active", id);
                        }
                        if !connection.announced.swap(true, Ordering::AcqRel) {
                            if let Some(manager) = manager.upgrade() {
                                manager.notify(ServerEvent::Connected {
                                    id: id.clone(),
                                    user_data: connection.user_data.clone(),
                                });
                            }
                        }
                    }
                    SessionEvent::Link(link) => {
                        let reason = WebRTCError::TransportDisconnected(format!("{:?}", link));
                        info!("Connection {}: {}", id, reason);
                        if let Some(manager) = manager.upgrade() {
                            let id = id.clone();
                            // Close outside the pump; closing waits on the session.
                            tokio::spawn(async move {
                                let _ = manager.close_connection(&id).await;
                            });
                        }
                    }
                    SessionEvent::Message(payload) => {
                        if let Some(message) = connection.channel.receive(&payload) {
                            if let Some(manager) = manager.upgrade() {
                                manager.notify(ServerEvent::Message { id: id.clone(), message });
                            }
                        }
                    }
                }
            }
            debug!("Event pump for {} stopped", id);
        });
    }

    fn notify(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!("Server event dropped: no listener");
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.connections.read().contains_key(id)
    }

    pub fn get_connection(&self, id: &str) -> Result<Arc<Connection>, WebRTCError> {
        self.connections
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| WebRTCError::UnknownConnection(id.to_string()))
    }

    /// Install the peer's answer and return the description now in place
    pub async fn apply_remote_description(
        &self,
        id: &str,
        description: SessionDescription,
    ) -> Result<SessionDescription, WebRTCError> {
        let connection = self.get_connection(id)?;
        if description.kind != SdpType::Answer {
            return Err(WebRTCError::MalformedSignal(format!(
                "expected an answer, got {}",
                description.kind
            )));
        }

        let applied = {
            let _round = connection.signaling.lock().await;
            connection.negotiation.apply_remote(&description).await
        };
        if let Err(e) = applied {
            if connection.negotiation_state() == NegotiationState::Failed {
                warn!("Closing {} after failed answer: {}", id, e);
                let _ = self.close_connection(id).await;
            }
            return Err(e);
        }

        connection
            .session
            .remote_description()
            .await
            .ok_or_else(|| WebRTCError::SdpError("Remote description missing after apply".to_string()))
    }

    /// Local candidates discovered since the last fetch
    pub fn drain_candidates(&self, id: &str) -> Result<Vec<IceCandidate>, WebRTCError> {
        Ok(self.get_connection(id)?.take_candidates())
    }

    /// Start a renegotiation round on an active connection
    pub async fn reconnect(&self, id: &str) -> Result<ConnectionJson, WebRTCError> {
        let connection = self.get_connection(id)?;
        let _round = connection.signaling.lock().await;

        let was_needed = connection.renegotiation_needed.swap(false, Ordering::AcqRel);
        if let Err(e) = connection.negotiation.renegotiate().await {
            if was_needed {
                connection.renegotiation_needed.store(true, Ordering::Release);
            }
            return Err(e);
        }
        info!("Connection {} renegotiating", id);
        Ok(connection.to_json().await)
    }

    pub async fn streams(&self, id: &str) -> Result<StreamMap, WebRTCError> {
        let connection = self.get_connection(id)?;
        Ok(self.router.stream_map(&connection).await)
    }

    /// Remove a connection, scrub its routes from every peer and release it
    pub async fn close_connection(&self, id: &str) -> Result<(), WebRTCError> {
        let (connection, remaining) = {
            let mut connections = self.connections.write();
            let connection = connections
                .remove(id)
                .ok_or_else(|| WebRTCError::UnknownConnection(id.to_string()))?;
            let remaining: Vec<_> = connections.values().cloned().collect();
            (connection, remaining)
        };

        self.router.unlink(id, &remaining);
        connection.peer_routes.lock().clear();
        connection.negotiation.close().await;
        info!("Closed connection {} ({} remaining)", id, remaining.len());

        if connection.announced.load(Ordering::Acquire) {
            self.notify(ServerEvent::Disconnected { id: id.to_string() });
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.connections.read().keys().cloned().collect();
        for id in ids {
            let _ = self.close_connection(&id).await;
        }
    }

    /// Send an event to one connection
    pub async fn emit(&self, id: &str, event: &str, data: &Value, reliable: bool) -> Result<(), WebRTCError> {
        let connection = self.get_connection(id)?;
        connection.emit(event, data, self.reliable_options(reliable)).await
    }

    /// Send an event to every connected peer except `except`
    pub async fn broadcast(&self, event: &str, data: &Value, reliable: bool, except: Option<&str>) -> usize {
        let mut sent = 0;
        for connection in self.active_connections(except) {
            match connection.emit(event, data, self.reliable_options(reliable)).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("broadcast: send to {} failed: {}", connection.id, e),
            }
        }
        sent
    }

    /// Send a binary payload to every connected peer except `except`
    pub async fn broadcast_raw(&self, data: Bytes, except: Option<&str>) -> usize {
        let mut sent = 0;
        for connection in self.active_connections(except) {
            match connection.emit_raw(data.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("broadcast_raw: send to {} failed: {}", connection.id, e),
            }
        }
        sent
    }

    fn reliable_options(&self, reliable: bool) -> Option<ReliableOptions> {
        reliable.then(|| ReliableOptions::from_config(&self.reliability))
    }

    fn active_connections(&self, except: Option<&str>) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .values()
            .filter(|c| Some(c.id.as_str()) != except)
            // The transport stays up while a new round is pending.
            .filter(|c| matches!(c.state(), ConnectionState::Active | ConnectionState::Renegotiating))
            .cloned()
            .collect()
    }

    pub fn get_all_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}
