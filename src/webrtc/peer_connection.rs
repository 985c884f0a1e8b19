//! WebRTC PeerConnection management
//!
//! Defines the peer session primitive the negotiation layer drives
//! ([`PeerSession`]), and its webrtc-rs implementation created by
//! [`PeerConnectionManager`].

use super::media_track::{InboundMedia, MediaKind};
use super::signaling::{IceCandidate, SdpType, SessionDescription};
use super::WebRTCError;
use crate::config::{IceServerConfig, IceTransportPolicy, WebRTCConfig};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use parking_lot::Mutex;
use sha1::Sha1;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Which end of the signaling exchange a session is created for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Produces the first offer and opens the data channel (responding/server side)
    Offerer,
    /// Answers offers and accepts the peer's data channel (requesting/client side)
    Answerer,
}

/// Transport-level connection state reported by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Data channel payload, in either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

/// Events a peer session reports asynchronously
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A local candidate was discovered
    Candidate(IceCandidate),
    /// Local candidate gathering finished
    GatheringComplete,
    /// Transport connection state changed
    Link(LinkState),
    /// The data channel is open
    ChannelOpen,
    /// A data channel message arrived
    Message(Payload),
}

/// Where a session delivers its events and inbound media
#[derive(Clone)]
pub struct SessionSink {
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub media: InboundMedia,
}

impl SessionSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events, media: InboundMedia::new() }, rx)
    }
}

/// The capability-providing transport primitive
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, WebRTCError>;

    /// Create an answer to the installed remote offer and install it locally
    async fn create_answer(&self) -> Result<SessionDescription, WebRTCError>;

    /// Install the peer's description
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), WebRTCError>;

    /// Current local description, including candidates gathered so far
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), WebRTCError>;

    /// Add a receive-only media line for this session's own media; returns its route id
    async fn add_receiver(&self, kind: MediaKind) -> Result<String, WebRTCError>;

    /// Add a send-only media line carrying `track`; returns its route id
    async fn add_sender(&self, track: Arc<TrackLocalStaticRTP>) -> Result<String, WebRTCError>;

    /// Transport-assigned correlation id of a route, once negotiated
    async fn correlation_id(&self, route_id: &str) -> Option<String>;

    /// Send on the data channel
    async fn send(&self, payload: Payload) -> Result<(), WebRTCError>;

    fn ice_connection_state(&self) -> String;

    fn signaling_state(&self) -> String;

    async fn close(&self) -> Result<(), WebRTCError>;
}

/// Creates peer sessions wired to a sink
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, role: SessionRole, sink: SessionSink) -> Result<Arc<dyn PeerSession>, WebRTCError>;
}

/// PeerConnection manager for WebRTC sessions
pub struct PeerConnectionManager {
    config: WebRTCConfig,
}

impl PeerConnectionManager {
    /// Create a new PeerConnection manager
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    /// Create a new PeerConnection with the configured settings
    pub async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, WebRTCError> {
        let mut setting_engine = SettingEngine::default();

        if !self.config.nat1to1_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(self.config.nat1to1_ips.clone(), RTCIceCandidateType::Host);
        }

        if let Some(range) = self.config.ephemeral_udp_port_range {
            let ephemeral = EphemeralUDP::new(range[0], range[1])
                .map_err(|e| WebRTCError::UnsupportedTransport(format!("Invalid ICE UDP port range: {}", e)))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WebRTCError::UnsupportedTransport(format!("Failed to register codecs: {}", e)))?;

        // Create interceptor registry for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::UnsupportedTransport(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = build_ice_servers(&self.config)
            .into_iter()
            .map(|server| RTCIceServer {
                urls: server.urls,
                username: server.username.unwrap_or_default(),
                credential: server.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_transport_policy: match self.config.ice_transport_policy {
                IceTransportPolicy::All => RTCIceTransportPolicy::All,
                IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WebRTCError::UnsupportedTransport(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }

    fn data_channel_init(&self) -> RTCDataChannelInit {
        let max_packet_life_time = self.config.max_packet_life_time;
        RTCDataChannelInit {
            ordered: Some(self.config.ordered),
            max_packet_life_time,
            max_retransmits: if max_packet_life_time.is_some() {
                None
            } else {
                self.config.max_retransmits
            },
            ..Default::default()
        }
    }
}

#[async_trait]
impl SessionFactory for PeerConnectionManager {
    async fn create(&self, role: SessionRole, sink: SessionSink) -> Result<Arc<dyn PeerSession>, WebRTCError> {
        let peer_connection = self.create_peer_connection().await?;
        let session = RtcPeerSession::new(peer_connection);
        session.setup_callbacks(&sink);

        match role {
            SessionRole::Offerer => {
                let channel = session
                    .peer_connection
                    .create_data_channel(&self.config.label, Some(self.data_channel_init()))
                    .await
                    .map_err(|e| WebRTCError::DataChannelError(format!("Failed to create data channel: {}", e)))?;
                attach_channel_handlers(&channel, sink.events.clone());
                *session.channel.write().await = Some(channel);
            }
            SessionRole::Answerer => session.accept_channels(&sink),
        }

        Ok(Arc::new(session))
    }
}

/// webrtc-rs backed peer session
pub struct RtcPeerSession {
    peer_connection: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    routes: Mutex<HashMap<String, Arc<RTCRtpTransceiver>>>,
}

impl RtcPeerSession {
    pub fn new(peer_connection: Arc<RTCPeerConnection>) -> Self {
        Self {
            peer_connection,
            channel: Arc::new(RwLock::new(None)),
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Register the session's event subscriptions; called once per session
    fn setup_callbacks(&self, sink: &SessionSink) {
        let events = sink.events.clone();
        self.peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(SessionEvent::Candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let events = sink.events.clone();
        self.peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
            let events = events.clone();
            Box::pin(async move {
                if state == RTCIceGathererState::Complete {
                    let _ = events.send(SessionEvent::GatheringComplete);
                }
            })
        }));

        let events = sink.events.clone();
        self.peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            Box::pin(async move {
                debug!("Peer connection state: {}", state);
                let link = match state {
                    RTCPeerConnectionState::Connected => LinkState::Connected,
                    RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                    RTCPeerConnectionState::Failed => LinkState::Failed,
                    RTCPeerConnectionState::Closed => LinkState::Closed,
                    _ => return,
                };
                let _ = events.send(SessionEvent::Link(link));
            })
        }));

        let media = sink.media.clone();
        self.peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let media = media.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    _ => return,
                };
                info!("Inbound {} track: ssrc={}", kind, track.ssrc());
                let tx = media.sender(kind);
                tokio::spawn(async move {
                    loop {
                        match track.read_rtp().await {
                            Ok((packet, _)) => {
                                // No receivers is fine: nobody is subscribed yet.
                                let _ = tx.send(packet);
                            }
                            Err(e) => {
                                debug!("Inbound {} track ended: {}", kind, e);
                                break;
                            }
                        }
                    }
                });
            })
        }));
    }

    /// Accept the data channel opened by the offering side
    fn accept_channels(&self, sink: &SessionSink) {
        let slot = self.channel.clone();
        let events = sink.events.clone();
        self.peer_connection.on_data_channel(Box::new(move |channel| {
            let slot = slot.clone();
            let events = events.clone();
            Box::pin(async move {
                info!("Data channel opened: {}", channel.label());
                attach_channel_handlers(&channel, events);
                *slot.write().await = Some(channel);
            })
        }));
    }

    fn transceiver_init(direction: RTCRtpTransceiverDirection) -> RTCRtpTransceiverInit {
        RTCRtpTransceiverInit {
            direction,
            send_encodings: Vec::new(),
        }
    }
}

#[async_trait]
impl PeerSession for RtcPeerSession {
    async fn create_offer(&self) -> Result<SessionDescription, WebRTCError> {
        let offer = self.peer_connection.create_offer(None).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection.set_local_description(offer.clone()).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, WebRTCError> {
        let answer = self.peer_connection.create_answer(None).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection.set_local_description(answer.clone()).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), WebRTCError> {
        let remote = match description.kind {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
            other => {
                return Err(WebRTCError::MalformedSignal(format!("Unsupported description type: {}", other)))
            }
        }
        .map_err(|e| WebRTCError::MalformedSignal(format!("Invalid SDP {}: {}", description.kind, e)))?;

        self.peer_connection.set_remote_description(remote).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))?;

        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.peer_connection.local_description().await.and_then(to_description)
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.peer_connection.remote_description().await.and_then(to_description)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), WebRTCError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        self.peer_connection.add_ice_candidate(candidate_init).await
            .map_err(|e| WebRTCError::IceError(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    async fn add_receiver(&self, kind: MediaKind) -> Result<String, WebRTCError> {
        let codec_type = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        let transceiver = self
            .peer_connection
            .add_transceiver_from_kind(codec_type, Some(Self::transceiver_init(RTCRtpTransceiverDirection::Recvonly)))
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add {} transceiver: {}", kind, e)))?;

        let route_id = format!("{}-{}", kind, uuid::Uuid::new_v4());
        self.routes.lock().insert(route_id.clone(), transceiver);
        Ok(route_id)
    }

    async fn add_sender(&self, track: Arc<TrackLocalStaticRTP>) -> Result<String, WebRTCError> {
        let route_id = track.id().to_string();
        let transceiver = self
            .peer_connection
            .add_transceiver_from_track(
                track as Arc<dyn TrackLocal + Send + Sync>,
                Some(Self::transceiver_init(RTCRtpTransceiverDirection::Sendonly)),
            )
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add forwarding track {}: {}", route_id, e)))?;

        // Drain RTCP so the interceptors keep running.
        let sender = transceiver.sender().await;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        self.routes.lock().insert(route_id.clone(), transceiver);
        Ok(route_id)
    }

    async fn correlation_id(&self, route_id: &str) -> Option<String> {
        let transceiver = self.routes.lock().get(route_id).cloned()?;
        transceiver.mid().map(|mid| mid.to_string())
    }

    async fn send(&self, payload: Payload) -> Result<(), WebRTCError> {
        let channel = self.channel.read().await;
        let Some(ref ch) = *channel else {
            return Err(WebRTCError::DataChannelError("Data channel not ready".to_string()));
        };
        match payload {
            Payload::Text(text) => ch.send_text(text).await,
            Payload::Binary(data) => ch.send(&data).await,
        }
        .map_err(|e| WebRTCError::DataChannelError(format!("Send failed: {}", e)))?;
        Ok(())
    }

    fn ice_connection_state(&self) -> String {
        self.peer_connection.ice_connection_state().to_string()
    }

    fn signaling_state(&self) -> String {
        self.peer_connection.signaling_state().to_string()
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        if let Some(ref channel) = *self.channel.read().await {
            let _ = channel.close().await;
        }
        self.peer_connection.close().await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to close connection: {}", e)))?;
        Ok(())
    }
}

fn attach_channel_handlers(channel: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<SessionEvent>) {
    let open_events = events.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = open_events.send(SessionEvent::ChannelOpen);
        })
    }));

    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            let payload = if msg.is_string {
                Payload::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                Payload::Binary(msg.data)
            };
            let _ = events.send(SessionEvent::Message(payload));
        })
    }));
}

fn to_description(description: RTCSessionDescription) -> Option<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => return None,
    };
    Some(SessionDescription { kind, sdp: description.sdp })
}

/// ICE servers to hand to the transport: configured STUN/TURN hosts first,
/// otherwise the explicit list
pub fn build_ice_servers(config: &WebRTCConfig) -> Vec<IceServerConfig> {
    let mut servers = Vec::new();

    let has_stun = !config.stun_host.is_empty() && config.stun_port != 0;

    if has_stun {
        servers.push(IceServerConfig {
            urls: vec![format!("stun:{}:{}", config.stun_host, config.stun_port)],
            username: None,
            credential: None,
        });
    }

    if !config.turn_host.is_empty() {
        let scheme = if config.turn_tls { "turns" } else { "turn" };
        let transport = if config.turn_protocol.is_empty() {
            "udp"
        } else {
            config.turn_protocol.as_str()
        };
        let url = format!(
            "{}:{}:{}?transport={}",
            scheme,
            config.turn_host,
            config.turn_port,
            transport
        );

        let (username, credential) = if !config.turn_shared_secret.is_empty() {
            let ttl_secs: u64 = 24 * 60 * 60;
            let expiry = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() + ttl_secs)
                .unwrap_or(ttl_secs);
            let user = format!("{}:peerlink", expiry);
            let password = hmac_sha1_base64(&config.turn_shared_secret, &user);
            (Some(user), Some(password))
        } else if !config.turn_username.is_empty() && !config.turn_password.is_empty() {
            (Some(config.turn_username.clone()), Some(config.turn_password.clone()))
        } else {
            (None, None)
        };

        servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }

    if servers.is_empty() {
        return config.ice_servers.clone();
    }

    servers
}

fn hmac_sha1_base64(secret: &str, message: &str) -> String {
    // HMAC accepts keys of any length.
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(message.as_bytes());
    let result = mac.finalize().into_bytes();
    base64::engine::general_purpose::STANDARD.encode(result)
}
