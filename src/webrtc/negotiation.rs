//! Offer/answer negotiation state machine
//!
//! A [`Negotiation`] drives one peer session through
//! `Created → OfferSent → AnswerApplied → Active`, with
//! `Active ⇄ Renegotiating` for additional rounds and `Closed`/`Failed` as
//! terminal states. Callers serialize rounds per connection; the state itself
//! is also guarded so transport events and close can race a round safely.

use super::peer_connection::{PeerSession, SessionEvent};
use super::signaling::{SdpType, SessionDescription};
use super::WebRTCError;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Created,
    OfferSent,
    AnswerApplied,
    Active,
    Renegotiating,
    Closed,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed)
    }

    /// Coarse state reported to signaling clients
    pub fn connection_state(self) -> ConnectionState {
        match self {
            NegotiationState::Created | NegotiationState::OfferSent => ConnectionState::Negotiating,
            NegotiationState::AnswerApplied => ConnectionState::AwaitingCandidates,
            NegotiationState::Active => ConnectionState::Active,
            NegotiationState::Renegotiating => ConnectionState::Renegotiating,
            NegotiationState::Closed | NegotiationState::Failed => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Negotiating,
    AwaitingCandidates,
    Active,
    Renegotiating,
    Closed,
}

/// Outcome of a successful readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Candidate gathering completed
    Ready,
    /// Deadline passed with a partial candidate set
    Degraded,
}

/// Local candidate gathering progress, published by the session event pump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatheringProgress {
    pub candidates: usize,
    pub complete: bool,
}

impl GatheringProgress {
    /// Fold a session event in; returns true if the progress changed
    pub fn observe(&mut self, event: &SessionEvent) -> bool {
        match event {
            SessionEvent::Candidate(_) => {
                self.candidates += 1;
                true
            }
            SessionEvent::GatheringComplete if !self.complete => {
                self.complete = true;
                true
            }
            _ => false,
        }
    }
}

pub struct Negotiation {
    session: Arc<dyn PeerSession>,
    state: Mutex<NegotiationState>,
    gathering: watch::Receiver<GatheringProgress>,
    negotiated: AtomicBool,
    rounds: AtomicU32,
    cancel: CancellationToken,
}

impl Negotiation {
    pub fn new(
        session: Arc<dyn PeerSession>,
        gathering: watch::Receiver<GatheringProgress>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            state: Mutex::new(NegotiationState::Created),
            gathering,
            negotiated: AtomicBool::new(false),
            rounds: AtomicU32::new(0),
            cancel,
        }
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    pub fn session(&self) -> &Arc<dyn PeerSession> {
        &self.session
    }

    /// Whether at least one offer/answer exchange has completed
    pub fn has_negotiated(&self) -> bool {
        self.negotiated.load(Ordering::Acquire)
    }

    /// Completed offer/answer exchanges
    pub fn rounds(&self) -> u32 {
        self.rounds.load(Ordering::Acquire)
    }

    pub fn gathering(&self) -> GatheringProgress {
        *self.gathering.borrow()
    }

    /// Move `expected → to`, failing if the state changed underneath
    fn advance(&self, expected: NegotiationState, to: NegotiationState) -> Result<(), WebRTCError> {
        let mut state = self.state.lock();
        if *state != expected {
            return Err(if state.is_terminal() {
                WebRTCError::Closed
            } else {
                WebRTCError::InvalidState(format!("expected {:?}, found {:?}", expected, *state))
            });
        }
        debug!("Negotiation {:?} -> {:?}", expected, to);
        *state = to;
        Ok(())
    }

    fn invalid(&self, operation: &str, state: NegotiationState) -> WebRTCError {
        if state.is_terminal() {
            WebRTCError::Closed
        } else {
            WebRTCError::InvalidState(format!("cannot {} in state {:?}", operation, state))
        }
    }

    fn fail(&self) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            warn!("Negotiation failed in state {:?}", *state);
            *state = NegotiationState::Failed;
        }
    }

    fn complete_round(&self) {
        self.negotiated.store(true, Ordering::Release);
        self.rounds.fetch_add(1, Ordering::AcqRel);
    }

    /// Produce the first local offer: `Created → OfferSent`
    pub async fn initiate(&self) -> Result<SessionDescription, WebRTCError> {
        let state = self.state();
        if state != NegotiationState::Created {
            return Err(self.invalid("initiate", state));
        }

        let offer = match self.session.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail();
                return Err(e);
            }
        };
        self.advance(NegotiationState::Created, NegotiationState::OfferSent)?;
        Ok(offer)
    }

    /// Install the peer's description.
    ///
    /// An answer completes the pending round and yields `None`. An offer is
    /// answered and the answer returned. A malformed description leaves the
    /// negotiation untouched.
    pub async fn apply_remote(&self, description: &SessionDescription) -> Result<Option<SessionDescription>, WebRTCError> {
        description.validate()?;
        let state = self.state();

        let expected = match state {
            NegotiationState::OfferSent | NegotiationState::Renegotiating => SdpType::Answer,
            NegotiationState::Created | NegotiationState::Active => SdpType::Offer,
            other => return Err(self.invalid("apply a remote description", other)),
        };
        if description.kind != expected {
            return Err(WebRTCError::MalformedSignal(format!(
                "expected {} in state {:?}, got {}",
                expected, state, description.kind
            )));
        }

        let result = self.install(state, description).await;
        match result {
            Ok(answer) => {
                let next = match state {
                    NegotiationState::OfferSent | NegotiationState::Created => NegotiationState::AnswerApplied,
                    _ => NegotiationState::Active,
                };
                self.advance(state, next)?;
                self.complete_round();
                info!("Negotiation round {} applied ({:?} -> {:?})", self.rounds(), state, next);
                Ok(answer)
            }
            Err(e @ WebRTCError::MalformedSignal(_)) => Err(e),
            Err(e) => {
                match state {
                    NegotiationState::Renegotiating => {
                        let _ = self.advance(state, NegotiationState::Active);
                    }
                    NegotiationState::Active => {}
                    _ => self.fail(),
                }
                Err(e)
            }
        }
    }

    async fn install(
        &self,
        state: NegotiationState,
        description: &SessionDescription,
    ) -> Result<Option<SessionDescription>, WebRTCError> {
        self.session.set_remote_description(description).await?;
        match state {
            NegotiationState::Created | NegotiationState::Active => Ok(Some(self.session.create_answer().await?)),
            _ => Ok(None),
        }
    }

    /// Wait until candidate gathering completes or `deadline` passes.
    ///
    /// A partial candidate set at the deadline is degraded but usable; no
    /// candidate at all fails the negotiation.
    pub async fn await_readiness(&self, deadline: Duration) -> Result<Readiness, WebRTCError> {
        let mut gathering = self.gathering.clone();
        let completed = async move {
            let reported = gathering.wait_for(|progress| progress.complete).await.is_ok();
            if !reported {
                // Event source is gone; only the deadline can decide now.
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(WebRTCError::Closed),
            result = tokio::time::timeout(deadline, completed) => match result {
                Ok(()) => Ok(Readiness::Ready),
                Err(_) => {
                    let candidates = self.gathering().candidates;
                    if candidates > 0 {
                        warn!(
                            "Candidate gathering incomplete after {:?}, continuing with {} candidate(s)",
                            deadline, candidates
                        );
                        Ok(Readiness::Degraded)
                    } else {
                        error!("No ICE candidate gathered within {:?}", deadline);
                        self.fail();
                        Err(WebRTCError::NegotiationTimeout)
                    }
                }
            }
        }
    }

    /// Start another round: `Active → Renegotiating`.
    ///
    /// From `Renegotiating` the unanswered offer is replaced by a fresh one.
    /// If producing the offer fails the negotiation falls back to `Active`.
    pub async fn renegotiate(&self) -> Result<SessionDescription, WebRTCError> {
        {
            let mut state = self.state.lock();
            match *state {
                NegotiationState::Active => {
                    debug!("Negotiation Active -> Renegotiating");
                    *state = NegotiationState::Renegotiating;
                }
                NegotiationState::Renegotiating => {
                    info!("Replacing unanswered renegotiation offer");
                }
                other => return Err(self.invalid("renegotiate", other)),
            }
        }

        match self.session.create_offer().await {
            Ok(offer) => Ok(offer),
            Err(e) => {
                let _ = self.advance(NegotiationState::Renegotiating, NegotiationState::Active);
                Err(e)
            }
        }
    }

    /// Transport connected: `AnswerApplied → Active`. Returns true on transition.
    pub fn transport_connected(&self) -> bool {
        self.advance(NegotiationState::AnswerApplied, NegotiationState::Active).is_ok()
    }

    /// Release the session. Returns false if already closed.
    pub async fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == NegotiationState::Closed {
                return false;
            }
            *state = NegotiationState::Closed;
        }
        self.cancel.cancel();
        if let Err(e) = self.session.close().await {
            warn!("Error closing session: {}", e);
        }
        true
    }
}
