//! Multi-party media routing
//!
//! Every live connection publishes its inbound audio/video on a broadcast
//! channel. For each other live connection the router adds a send-only
//! forwarding track on that connection's session and pumps the packets
//! across, recording the route in the receiving connection's [`RouteTable`]
//! under the publishing peer's id. Connections never hold each other; routes
//! are keyed by id and resolved through the registry.

use super::session::Connection;
use super::signaling::StreamMap;
use super::WebRTCError;
use crate::config::{VideoCodec, WebRTCConfig};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

/// Packets buffered per inbound media broadcast before slow forwarders lag
const INBOUND_MEDIA_BUFFER: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// A connection's inbound media, fanned out to its forwarding routes
#[derive(Clone)]
pub struct InboundMedia {
    audio: broadcast::Sender<Packet>,
    video: broadcast::Sender<Packet>,
}

impl InboundMedia {
    pub fn new() -> Self {
        let (audio, _) = broadcast::channel(INBOUND_MEDIA_BUFFER);
        let (video, _) = broadcast::channel(INBOUND_MEDIA_BUFFER);
        Self { audio, video }
    }

    pub fn sender(&self, kind: MediaKind) -> broadcast::Sender<Packet> {
        match kind {
            MediaKind::Audio => self.audio.clone(),
            MediaKind::Video => self.video.clone(),
        }
    }

    pub fn subscribe(&self, kind: MediaKind) -> broadcast::Receiver<Packet> {
        match kind {
            MediaKind::Audio => self.audio.subscribe(),
            MediaKind::Video => self.video.subscribe(),
        }
    }
}

impl Default for InboundMedia {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer's media re-published on the owning connection
pub struct ForwardingRoute {
    pub route_id: String,
    pub track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
}

impl ForwardingRoute {
    fn stop(&self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
pub struct PeerRoutes {
    pub audio: Option<ForwardingRoute>,
    pub video: Option<ForwardingRoute>,
}

impl PeerRoutes {
    pub fn get(&self, kind: MediaKind) -> Option<&ForwardingRoute> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    fn slot(&mut self, kind: MediaKind) -> &mut Option<ForwardingRoute> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    fn stop(&self) {
        for route in self.audio.iter().chain(self.video.iter()) {
            route.stop();
        }
    }
}

/// Per-connection map from other peers' ids to the routes carrying their media
#[derive(Default)]
pub struct RouteTable {
    peers: HashMap<String, PeerRoutes>,
    /// Routes whose sender is being attached
    pending: HashSet<(String, MediaKind)>,
}

impl RouteTable {
    pub fn contains(&self, peer_id: &str, kind: MediaKind) -> bool {
        self.peers.get(peer_id).and_then(|routes| routes.get(kind)).is_some()
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Claim a route before attaching its sender; false if it exists or is claimed
    pub fn reserve(&mut self, peer_id: &str, kind: MediaKind) -> bool {
        if self.contains(peer_id, kind) {
            return false;
        }
        self.pending.insert((peer_id.to_string(), kind))
    }

    /// Drop a claim whose sender could not be attached
    pub fn release(&mut self, peer_id: &str, kind: MediaKind) {
        self.pending.remove(&(peer_id.to_string(), kind));
    }

    /// Record a route; returns false (and leaves the table as is) if one already exists
    pub fn insert(&mut self, peer_id: &str, kind: MediaKind, route: ForwardingRoute) -> bool {
        self.release(peer_id, kind);
        let slot = self.peers.entry(peer_id.to_string()).or_default().slot(kind);
        if slot.is_some() {
            return false;
        }
        *slot = Some(route);
        true
    }

    /// Drop every route carrying `peer_id`, stopping their forwarders
    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        match self.peers.remove(peer_id) {
            Some(routes) => {
                routes.stop();
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        for routes in self.peers.values() {
            routes.stop();
        }
        self.peers.clear();
        self.pending.clear();
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// (route id, peer id) pairs for one media kind
    pub fn routes(&self, kind: MediaKind) -> Vec<(String, String)> {
        self.peers
            .iter()
            .filter_map(|(peer, routes)| routes.get(kind).map(|r| (r.route_id.clone(), peer.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Wires media between live connections
pub struct TrackRouter {
    kinds: Vec<MediaKind>,
    video_codec: VideoCodec,
}

impl TrackRouter {
    pub fn new(config: &WebRTCConfig) -> Self {
        let mut kinds = Vec::new();
        if config.audio {
            kinds.push(MediaKind::Audio);
        }
        if config.video {
            kinds.push(MediaKind::Video);
        }
        Self {
            kinds,
            video_codec: config.video_codec,
        }
    }

    /// Media kinds routed between connections
    pub fn kinds(&self) -> &[MediaKind] {
        &self.kinds
    }

    pub fn carries(&self, kind: MediaKind) -> bool {
        self.kinds.contains(&kind)
    }

    fn codec_capability(&self, kind: MediaKind) -> RTCRtpCodecCapability {
        match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: self.video_codec.mime_type().to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: self.video_codec.sdp_fmtp_line().to_string(),
                rtcp_feedback: vec![],
            },
        }
    }

    /// Wire `a` and `b` to each other for every routed media kind
    pub async fn link(&self, a: &Arc<Connection>, b: &Arc<Connection>) -> Result<(), WebRTCError> {
        for &kind in &self.kinds {
            self.add_route(a, b, kind).await?;
            self.add_route(b, a, kind).await?;
        }
        Ok(())
    }

    /// Forward `source`'s inbound `kind` media onto `target`'s session
    async fn add_route(&self, source: &Connection, target: &Connection, kind: MediaKind) -> Result<bool, WebRTCError> {
        if !target.peer_routes.lock().reserve(&source.id, kind) {
            return Ok(false);
        }

        let track = Arc::new(TrackLocalStaticRTP::new(
            self.codec_capability(kind),
            format!("{}-{}", kind, source.id),
            format!("peer-{}", source.id),
        ));
        let route_id = match target.session.add_sender(track.clone()).await {
            Ok(route_id) => route_id,
            Err(e) => {
                target.peer_routes.lock().release(&source.id, kind);
                return Err(e);
            }
        };

        let cancel = source.cancel.child_token();
        let route = ForwardingRoute {
            route_id,
            track: track.clone(),
            cancel: cancel.clone(),
        };
        if !target.peer_routes.lock().insert(&source.id, kind, route) {
            debug!("Duplicate {} route {} -> {} discarded", kind, source.id, target.id);
            cancel.cancel();
            return Ok(false);
        }

        spawn_forwarder(
            source.inbound.subscribe(kind),
            track,
            cancel,
            target.cancel.clone(),
            format!("{} {} -> {}", kind, source.id, target.id),
        );
        target.note_route_added();
        debug!("Routed {} of {} to {}", kind, source.id, target.id);
        Ok(true)
    }

    /// Remove `closed_id` from every other connection's route table
    pub fn unlink(&self, closed_id: &str, others: &[Arc<Connection>]) {
        for other in others {
            if other.peer_routes.lock().remove_peer(closed_id) {
                debug!("Removed routes of {} from {}", closed_id, other.id);
            }
        }
    }

    /// Correlation id → peer id map, once the connection has negotiated at least once
    pub async fn stream_map(&self, connection: &Connection) -> StreamMap {
        let mut map = StreamMap::default();
        if !connection.negotiation.has_negotiated() {
            return map;
        }

        for kind in [MediaKind::Audio, MediaKind::Video] {
            let routes = connection.peer_routes.lock().routes(kind);
            for (route_id, peer_id) in routes {
                // Routes added after the last round have no correlation id yet.
                let Some(mid) = connection.session.correlation_id(&route_id).await else {
                    continue;
                };
                match kind {
                    MediaKind::Audio => map.audio.insert(mid, peer_id),
                    MediaKind::Video => map.video.insert(mid, peer_id),
                };
            }
        }
        map
    }
}

fn spawn_forwarder(
    mut rx: broadcast::Receiver<Packet>,
    track: Arc<TrackLocalStaticRTP>,
    route_cancel: CancellationToken,
    target_cancel: CancellationToken,
    label: String,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = route_cancel.cancelled() => {
                    debug!("{label} forwarder stopped");
                    break;
                }
                _ = target_cancel.cancelled() => {
                    debug!("{label} forwarder stopped (target closed)");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(packet) => {
                            if let Err(e) = track.write_rtp(&packet).await {
                                warn!("{label} write_rtp error: {e}");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("{label} lagged, skipped {n} packets");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("{label} source closed");
                            break;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str) -> (ForwardingRoute, CancellationToken) {
        let cancel = CancellationToken::new();
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            id.to_string(),
            "peer".to_string(),
        ));
        (
            ForwardingRoute {
                route_id: id.to_string(),
                track,
                cancel: cancel.clone(),
            },
            cancel,
        )
    }

    #[test]
    fn test_route_table_rejects_duplicate_routes() {
        let mut table = RouteTable::default();
        let (first, _) = route("video-a");
        let (second, _) = route("video-a-2");

        assert!(table.insert("a", MediaKind::Video, first));
        assert!(!table.insert("a", MediaKind::Video, second));
        assert!(table.contains("a", MediaKind::Video));
        assert!(!table.contains("a", MediaKind::Audio));
        assert_eq!(table.routes(MediaKind::Video), vec![("video-a".to_string(), "a".to_string())]);
    }

    #[test]
    fn test_reservation_blocks_second_sender() {
        let mut table = RouteTable::default();
        assert!(table.reserve("a", MediaKind::Video));
        assert!(!table.reserve("a", MediaKind::Video));
        assert!(table.reserve("a", MediaKind::Audio));

        table.release("a", MediaKind::Audio);
        assert!(table.reserve("a", MediaKind::Audio));

        let (video, _) = route("video-a");
        assert!(table.insert("a", MediaKind::Video, video));
        assert!(!table.reserve("a", MediaKind::Video));

        table.clear();
        assert!(table.reserve("a", MediaKind::Video));
    }

    #[test]
    fn test_remove_peer_stops_forwarders() {
        let mut table = RouteTable::default();
        let (video, video_cancel) = route("video-b");
        let (audio, audio_cancel) = route("audio-b");
        table.insert("b", MediaKind::Video, video);
        table.insert("b", MediaKind::Audio, audio);

        assert!(table.remove_peer("b"));
        assert!(video_cancel.is_cancelled());
        assert!(audio_cancel.is_cancelled());
        assert!(!table.has_peer("b"));
        assert!(!table.remove_peer("b"));
    }

    #[test]
    fn test_router_kinds_follow_config() {
        let router = TrackRouter::new(&WebRTCConfig {
            video: true,
            ..Default::default()
        });
        assert_eq!(router.kinds(), &[MediaKind::Video]);
        assert!(!router.carries(MediaKind::Audio));

        let capability = router.codec_capability(MediaKind::Audio);
        assert_eq!(capability.clock_rate, 48000);
    }
}
