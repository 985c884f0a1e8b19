//! Requesting side of the HTTP signaling exchange
//!
//! [`PeerlinkClient::connect`] asks the server for a connection, answers its
//! offer, posts the answer back and then polls for the server's late ICE
//! candidates in the background.

use crate::config::{NegotiationConfig, ReliabilityConfig};
use crate::webrtc::candidates::{BackoffSchedule, CandidatePoller, CandidateSource, PollSummary};
use crate::webrtc::data_channel::{self, ChannelMessage, MessageChannel, ReliableOptions};
use crate::webrtc::media_track::InboundMedia;
use crate::webrtc::negotiation::{ConnectionState, GatheringProgress, Negotiation, Readiness};
use crate::webrtc::peer_connection::{LinkState, PeerSession, SessionEvent, SessionFactory, SessionRole, SessionSink};
use crate::webrtc::{ConnectionJson, IceCandidate, SessionDescription, StreamMap, WebRTCError};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Typed access to the signaling routes
#[derive(Clone)]
pub struct SignalingClient {
    http: reqwest::Client,
    base_url: String,
    authorization: Option<String>,
}

impl SignalingClient {
    /// `base_url` includes the server's path prefix, e.g. `http://host:9208/rtc/v1`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            authorization: None,
        }
    }

    /// Send `value` as the `Authorization` header of every request
    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<reqwest::Response, WebRTCError> {
        let request = match self.authorization {
            Some(ref value) => request.header(reqwest::header::AUTHORIZATION, value),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            warn!("Signaling request failed: {}", e);
            WebRTCError::Signaling(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Signaling request returned {}: {}", status, body);
            return Err(WebRTCError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn fetch_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, WebRTCError> {
        let response = self.execute(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| WebRTCError::MalformedSignal(format!("Invalid signaling response: {}", e)))
    }

    pub async fn create_connection(&self) -> Result<ConnectionJson, WebRTCError> {
        self.fetch_json(self.http.post(self.url("/connections"))).await
    }

    /// Post our description; returns what the server installed
    pub async fn remote_description(
        &self,
        id: &str,
        description: &SessionDescription,
    ) -> Result<SessionDescription, WebRTCError> {
        let url = self.url(&format!("/connections/{}/remote-description", id));
        self.fetch_json(self.http.post(url).json(description)).await
    }

    pub async fn additional_candidates(&self, id: &str) -> Result<Vec<IceCandidate>, WebRTCError> {
        let url = self.url(&format!("/connections/{}/additional-candidates", id));
        self.fetch_json(self.http.get(url)).await
    }

    pub async fn reconnect(&self, id: &str) -> Result<ConnectionJson, WebRTCError> {
        let url = self.url(&format!("/connections/{}/reconnect", id));
        self.fetch_json(self.http.post(url)).await
    }

    pub async fn streams(&self, id: &str) -> Result<StreamMap, WebRTCError> {
        let url = self.url(&format!("/connections/{}/streams", id));
        self.fetch_json(self.http.post(url)).await
    }

    pub async fn close(&self, id: &str) -> Result<(), WebRTCError> {
        let url = self.url(&format!("/connections/{}/close", id));
        self.execute(self.http.post(url)).await?;
        Ok(())
    }
}

/// Late candidates fetched from the server's additional-candidates route
pub struct HttpCandidateSource {
    signaling: SignalingClient,
    id: String,
}

impl HttpCandidateSource {
    pub fn new(signaling: SignalingClient, id: impl Into<String>) -> Self {
        Self { signaling, id: id.into() }
    }
}

#[async_trait]
impl CandidateSource for HttpCandidateSource {
    async fn fetch(&self) -> Result<Vec<IceCandidate>, WebRTCError> {
        self.signaling.additional_candidates(&self.id).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub negotiation: NegotiationConfig,
    pub reliability: ReliabilityConfig,
}

pub struct PeerlinkClient {
    signaling: SignalingClient,
    factory: Arc<dyn SessionFactory>,
    options: ClientOptions,
}

impl PeerlinkClient {
    pub fn new(signaling: SignalingClient, factory: Arc<dyn SessionFactory>, options: ClientOptions) -> Self {
        Self {
            signaling,
            factory,
            options,
        }
    }

    /// Negotiate a new connection with the server
    pub async fn connect(&self) -> Result<ClientConnection, WebRTCError> {
        let created = self.signaling.create_connection().await?;
        let id = created.id.clone();
        let Some(offer) = created.local_description.clone() else {
            self.abandon(&id).await;
            return Err(WebRTCError::MalformedSignal("Connection has no offer".to_string()));
        };

        let (sink, events) = SessionSink::new();
        let inbound = sink.media.clone();
        let session = match self.factory.create(SessionRole::Answerer, sink).await {
            Ok(session) => session,
            Err(e) => {
                self.abandon(&id).await;
                return Err(e);
            }
        };

        let (gathering_tx, gathering_rx) = watch::channel(GatheringProgress::default());
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let negotiation = Arc::new(Negotiation::new(session.clone(), gathering_rx, cancel.clone()));

        spawn_client_pump(ClientPump {
            id: id.clone(),
            events,
            gathering: gathering_tx,
            negotiation: negotiation.clone(),
            channel: MessageChannel::new(self.options.reliability.window()),
            messages: messages_tx,
            connected: connected_tx,
            cancel: cancel.clone(),
        });

        if let Err(e) = self.answer(&id, &negotiation, &offer).await {
            warn!("Negotiation with server failed for {}: {}", id, e);
            negotiation.close().await;
            self.abandon(&id).await;
            return Err(e);
        }
        info!("Connection {} answered", id);

        let source = Arc::new(HttpCandidateSource::new(self.signaling.clone(), id.clone()));
        let poller = CandidatePoller::new(BackoffSchedule::from_config(&self.options.negotiation), source, session)
            .spawn(cancel.child_token());

        Ok(ClientConnection {
            id,
            user_data: created.user_data,
            signaling: self.signaling.clone(),
            negotiation,
            inbound,
            messages: messages_rx,
            connected: connected_rx,
            cancel,
            poller,
            reliability: ReliableOptions::from_config(&self.options.reliability),
        })
    }

    async fn answer(&self, id: &str, negotiation: &Negotiation, offer: &SessionDescription) -> Result<(), WebRTCError> {
        let answer = negotiation
            .apply_remote(offer)
            .await?
            .ok_or_else(|| WebRTCError::SdpError("No answer produced for offer".to_string()))?;

        match negotiation.await_readiness(self.options.negotiation.readiness_timeout()).await? {
            Readiness::Ready => debug!("Answer for {} has all candidates", id),
            Readiness::Degraded => warn!("Answering {} with a partial candidate set", id),
        }

        // Prefer the description with the candidates gathered meanwhile.
        let local = negotiation.session().local_description().await.unwrap_or(answer);
        self.signaling.remote_description(id, &local).await?;
        Ok(())
    }

    async fn abandon(&self, id: &str) {
        if let Err(e) = self.signaling.close(id).await {
            debug!("Could not release server connection {}: {}", id, e);
        }
    }
}

/// A negotiated connection held by the requesting side
pub struct ClientConnection {
    pub id: String,
    pub user_data: Value,
    signaling: SignalingClient,
    negotiation: Arc<Negotiation>,
    inbound: InboundMedia,
    messages: mpsc::UnboundedReceiver<ChannelMessage>,
    connected: watch::Receiver<bool>,
    cancel: CancellationToken,
    poller: JoinHandle<PollSummary>,
    reliability: ReliableOptions,
}

impl ClientConnection {
    pub fn state(&self) -> ConnectionState {
        self.negotiation.state().connection_state()
    }

    pub fn session(&self) -> &Arc<dyn PeerSession> {
        self.negotiation.session()
    }

    /// Media the server forwards from other peers
    pub fn inbound_media(&self) -> &InboundMedia {
        &self.inbound
    }

    /// Wait for the transport to connect
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), WebRTCError> {
        let mut connected = self.connected.clone();
        let result = tokio::time::timeout(timeout, async move { connected.wait_for(|c| *c).await.is_ok() }).await;
        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(WebRTCError::Closed),
            Err(_) => Err(WebRTCError::NegotiationTimeout),
        }
    }

    /// Next application message from the server
    pub async fn next_message(&mut self) -> Option<ChannelMessage> {
        self.messages.recv().await
    }

    pub async fn emit(&self, event: &str, data: &Value) -> Result<(), WebRTCError> {
        data_channel::send_event(self.session().as_ref(), event, data).await
    }

    /// Send with resends; the task stops when the connection closes
    pub fn emit_reliable(&self, event: &str, data: &Value) -> JoinHandle<u32> {
        data_channel::send_reliable(
            self.session().clone(),
            event,
            data,
            self.reliability,
            self.cancel.child_token(),
        )
    }

    pub async fn emit_raw(&self, data: Bytes) -> Result<(), WebRTCError> {
        data_channel::send_raw(self.session().as_ref(), data).await
    }

    /// Answer a fresh offer from the server.
    ///
    /// On failure the local session keeps its last working state and the
    /// call can be repeated; the server replaces its unanswered offer.
    pub async fn reconnect(&self) -> Result<(), WebRTCError> {
        let result = self.answer_renewed_offer().await;
        match &result {
            Ok(()) => info!("Connection {} renegotiated", self.id),
            Err(e) => warn!("Renegotiation of {} failed: {}", self.id, e),
        }
        result
    }

    async fn answer_renewed_offer(&self) -> Result<(), WebRTCError> {
        let renewed = self.signaling.reconnect(&self.id).await?;
        let offer = renewed
            .local_description
            .ok_or_else(|| WebRTCError::MalformedSignal("Reconnect returned no offer".to_string()))?;
        let answer = self
            .negotiation
            .apply_remote(&offer)
            .await?
            .ok_or_else(|| WebRTCError::SdpError("No answer produced for offer".to_string()))?;
        self.signaling.remote_description(&self.id, &answer).await?;
        Ok(())
    }

    pub async fn streams(&self) -> Result<StreamMap, WebRTCError> {
        self.signaling.streams(&self.id).await
    }

    /// Close locally and release the server side
    pub async fn close(mut self) -> Result<(), WebRTCError> {
        self.cancel.cancel();
        self.negotiation.close().await;
        if let Ok(summary) = (&mut self.poller).await {
            debug!("Candidate polling for {} ended: {:?}", self.id, summary);
        }

        match self.signaling.close(&self.id).await {
            // Server already dropped it.
            Err(WebRTCError::HttpStatus { status: 404, .. }) => Ok(()),
            other => other,
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ClientPump {
    id: String,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    gathering: watch::Sender<GatheringProgress>,
    negotiation: Arc<Negotiation>,
    channel: MessageChannel,
    messages: mpsc::UnboundedSender<ChannelMessage>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
}

fn spawn_client_pump(mut pump: ClientPump) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = pump.cancel.cancelled() => break,
                event = pump.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            pump.gathering.send_if_modified(|progress| progress.observe(&event));

            match event {
                SessionEvent::Candidate(_) | SessionEvent::GatheringComplete => {}
                SessionEvent::ChannelOpen => debug!("Data channel open on {}", pump.id),
                SessionEvent::Link(LinkState::Connected) => {
                    if pump.negotiation.transport_connected() {
                        info!("Connection {} is active", pump.id);
                    }
                    pump.connected.send_replace(true);
                }
                SessionEvent::Link(link) => {
                    let reason = WebRTCError::TransportDisconnected(format!("{:?}", link));
                    info!("Connection {}: {}", pump.id, reason);
                    pump.connected.send_replace(false);
                    pump.negotiation.close().await;
                    break;
                }
                SessionEvent::Message(payload) => {
                    if let Some(message) = pump.channel.receive(&payload) {
                        if pump.messages.send(message).is_err() {
                            debug!("Message for {} dropped: connection released", pump.id);
                        }
                    }
                }
            }
        }
    });
}
