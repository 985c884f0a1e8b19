//! In-memory peer sessions for tests

use super::media_track::MediaKind;
use super::peer_connection::{Payload, PeerSession, SessionEvent, SessionFactory, SessionRole, SessionSink};
use super::signaling::{IceCandidate, SdpType, SessionDescription};
use super::WebRTCError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, Copy)]
pub(crate) struct MockBehavior {
    /// Candidates reported after the first local description
    pub candidates: usize,
    /// Whether gathering completion is reported after them
    pub complete: bool,
    /// Time `create_offer` takes after producing the description
    pub offer_delay: Option<Duration>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self { candidates: 1, complete: true, offer_delay: None }
    }
}

pub(crate) struct MockSession {
    sink: SessionSink,
    behavior: MockBehavior,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    descriptions: AtomicU32,
    routes: Mutex<Vec<String>>,
    mids: Mutex<HashMap<String, String>>,
    gathered: AtomicBool,
    added_candidates: Mutex<Vec<IceCandidate>>,
    sent: Mutex<Vec<Payload>>,
    closed: AtomicBool,
}

impl MockSession {
    pub fn new(sink: SessionSink, behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            sink,
            behavior,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            descriptions: AtomicU32::new(0),
            routes: Mutex::new(Vec::new()),
            mids: Mutex::new(HashMap::new()),
            gathered: AtomicBool::new(false),
            added_candidates: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn candidate(n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2130706431 10.0.0.{} 5000{} typ host", n, n + 1, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Deliver an event as if the transport reported it
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sink.events.send(event);
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.added_candidates.lock().clone()
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().clone()
    }

    pub fn routes(&self) -> Vec<String> {
        self.routes.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn describe(&self, kind: SdpType) -> SessionDescription {
        let n = self.descriptions.fetch_add(1, Ordering::AcqRel) + 1;
        let routes = self.routes.lock().clone();
        {
            // Routes present now get a mid, like transceivers in a real offer.
            let mut mids = self.mids.lock();
            for (index, route) in routes.iter().enumerate() {
                mids.entry(route.clone()).or_insert_with(|| (index + 1).to_string());
            }
        }
        let mut sdp = format!("v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\n", n, n);
        for route in &routes {
            sdp.push_str(&format!("a=route:{}\r\n", route));
        }
        let description = SessionDescription { kind, sdp };
        *self.local.lock() = Some(description.clone());
        self.gather_once();
        description
    }

    fn gather_once(&self) {
        if self.gathered.swap(true, Ordering::AcqRel) {
            return;
        }
        for n in 0..self.behavior.candidates {
            self.emit(SessionEvent::Candidate(Self::candidate(n)));
        }
        if self.behavior.complete {
            self.emit(SessionEvent::GatheringComplete);
        }
    }

    fn check_open(&self) -> Result<(), WebRTCError> {
        if self.is_closed() {
            return Err(WebRTCError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerSession for MockSession {
    async fn create_offer(&self) -> Result<SessionDescription, WebRTCError> {
        self.check_open()?;
        let offer = self.describe(SdpType::Offer);
        if let Some(delay) = self.behavior.offer_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, WebRTCError> {
        self.check_open()?;
        if self.remote.lock().is_none() {
            return Err(WebRTCError::SdpError("no remote offer".to_string()));
        }
        Ok(self.describe(SdpType::Answer))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), WebRTCError> {
        self.check_open()?;
        if !description.sdp.starts_with("v=0") {
            return Err(WebRTCError::MalformedSignal("SDP must start with v=0".to_string()));
        }
        *self.remote.lock() = Some(description.clone());
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), WebRTCError> {
        self.check_open()?;
        self.added_candidates.lock().push(candidate.clone());
        Ok(())
    }

    async fn add_receiver(&self, kind: MediaKind) -> Result<String, WebRTCError> {
        let route_id = format!("{}-own-{}", kind, self.routes.lock().len());
        self.routes.lock().push(route_id.clone());
        Ok(route_id)
    }

    async fn add_sender(&self, track: Arc<TrackLocalStaticRTP>) -> Result<String, WebRTCError> {
        self.check_open()?;
        let route_id = track.id().to_string();
        self.routes.lock().push(route_id.clone());
        Ok(route_id)
    }

    async fn correlation_id(&self, route_id: &str) -> Option<String> {
        self.mids.lock().get(route_id).cloned()
    }

    async fn send(&self, payload: Payload) -> Result<(), WebRTCError> {
        self.check_open()?;
        self.sent.lock().push(payload);
        Ok(())
    }

    fn ice_connection_state(&self) -> String {
        let state = if self.is_closed() { "closed" } else { "new" };
        state.to_string()
    }

    fn signaling_state(&self) -> String {
        let local = self.local.lock().as_ref().map(|d| d.kind);
        let remote = self.remote.lock().as_ref().map(|d| d.kind);
        let state = match (local, remote) {
            (Some(SdpType::Offer), Some(SdpType::Answer)) | (Some(SdpType::Answer), Some(SdpType::Offer)) => "stable",
            (Some(SdpType::Offer), _) => "have-local-offer",
            (None, Some(SdpType::Offer)) => "have-remote-offer",
            _ => "stable",
        };
        state.to_string()
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Factory handing out [`MockSession`]s and keeping them for inspection
#[derive(Default)]
pub(crate) struct MockFactory {
    behavior: MockBehavior,
    unsupported: bool,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockFactory {
    pub fn new(behavior: MockBehavior) -> Self {
        Self { behavior, ..Default::default() }
    }

    pub fn unsupported() -> Self {
        Self { unsupported: true, ..Default::default() }
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        self.sessions.lock()[index].clone()
    }

    pub fn created(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn create(&self, _role: SessionRole, sink: SessionSink) -> Result<Arc<dyn PeerSession>, WebRTCError> {
        if self.unsupported {
            return Err(WebRTCError::UnsupportedTransport("no transport in this environment".to_string()));
        }
        let session = MockSession::new(sink, self.behavior);
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}
