//! Late ICE candidate polling
//!
//! Candidates discovered after a description was handed over are fetched
//! from the peer on a bounded, jittered exponential schedule and fed into
//! the local session.

use super::peer_connection::PeerSession;
use super::signaling::IceCandidate;
use super::WebRTCError;
use crate::config::NegotiationConfig;
use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delay schedule: attempt `i` waits `floor(initial * factor^i) + jitter`,
/// with jitter drawn uniformly from `[0, jitter)`.
///
/// Each delay is measured from the end of the previous attempt, not from the
/// start of polling, so the default schedule spans about 22 s.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSchedule {
    pub attempts: u32,
    pub initial: Duration,
    pub factor: f64,
    pub jitter: Duration,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial: Duration::from_millis(50),
            factor: 1.8,
            jitter: Duration::from_millis(20),
        }
    }
}

impl BackoffSchedule {
    pub fn from_config(config: &NegotiationConfig) -> Self {
        Self {
            attempts: config.poll_attempts,
            initial: Duration::from_millis(config.poll_initial_ms),
            factor: config.poll_factor,
            jitter: Duration::from_millis(config.poll_jitter_ms),
        }
    }

    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial.as_millis() as f64;
        let ms = (initial_ms * self.factor.powi(attempt as i32)).floor();
        Duration::from_millis(ms as u64)
    }

    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 { rng.gen_range(0..jitter_ms) } else { 0 };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }

    /// The whole schedule, one delay per attempt
    pub fn delays<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<Duration> {
        (0..self.attempts).map(|attempt| self.delay(attempt, rng)).collect()
    }
}

/// Where late candidates come from
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<IceCandidate>, WebRTCError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub attempts: u32,
    pub added: usize,
    pub failed_fetches: u32,
}

pub struct CandidatePoller {
    schedule: BackoffSchedule,
    source: Arc<dyn CandidateSource>,
    session: Arc<dyn PeerSession>,
}

impl CandidatePoller {
    pub fn new(schedule: BackoffSchedule, source: Arc<dyn CandidateSource>, session: Arc<dyn PeerSession>) -> Self {
        Self { schedule, source, session }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<PollSummary> {
        tokio::spawn(self.run(cancel))
    }

    /// Poll until the schedule is exhausted or `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> PollSummary {
        let mut summary = PollSummary::default();

        for attempt in 0..self.schedule.attempts {
            let delay = self.schedule.delay(attempt, &mut rand::thread_rng());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            summary.attempts += 1;
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = self.source.fetch() => fetched,
            };

            match fetched {
                Ok(candidates) => {
                    for candidate in &candidates {
                        match self.session.add_ice_candidate(candidate).await {
                            Ok(()) => summary.added += 1,
                            Err(e) => warn!("Failed to add polled candidate: {}", e),
                        }
                    }
                }
                Err(e) => {
                    summary.failed_fetches += 1;
                    warn!("Candidate poll {} failed: {}", attempt + 1, e);
                }
            }
        }

        debug!(
            "Candidate polling finished: {} attempt(s), {} candidate(s) added, {} failed",
            summary.attempts, summary.added, summary.failed_fetches
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::mock::{MockBehavior, MockSession};
    use crate::webrtc::peer_connection::SessionSink;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    #[test]
    fn test_delays_stay_within_jitter_bounds() {
        let schedule = BackoffSchedule::default();
        let mut rng = rand::thread_rng();

        for _ in 0..200 {
            let delays = schedule.delays(&mut rng);
            assert_eq!(delays.len(), 10);
            for (i, delay) in delays.iter().enumerate() {
                let base = schedule.base_delay(i as u32);
                assert!(*delay >= base, "attempt {} below base", i);
                assert!(*delay < base + Duration::from_millis(20), "attempt {} above jitter", i);
            }
        }
    }

    #[test]
    fn test_base_delays_grow() {
        let schedule = BackoffSchedule::default();
        assert_eq!(schedule.base_delay(0), Duration::from_millis(50));
        assert_eq!(schedule.base_delay(1), Duration::from_millis(90));
        assert_eq!(schedule.base_delay(2), Duration::from_millis(162));
        for i in 1..schedule.attempts {
            assert!(schedule.base_delay(i) > schedule.base_delay(i - 1));
        }
    }

    struct RecordingSource {
        started: Instant,
        calls: Mutex<Vec<Duration>>,
        batches: Mutex<Vec<Vec<IceCandidate>>>,
    }

    impl RecordingSource {
        fn new(batches: Vec<Vec<IceCandidate>>) -> Arc<Self> {
            Arc::new(Self {
                started: Instant::now(),
                calls: Mutex::new(Vec::new()),
                batches: Mutex::new(batches),
            })
        }
    }

    #[async_trait]
    impl CandidateSource for RecordingSource {
        async fn fetch(&self) -> Result<Vec<IceCandidate>, WebRTCError> {
            self.calls.lock().push(self.started.elapsed());
            let mut batches = self.batches.lock();
            if batches.is_empty() {
                return Err(WebRTCError::Signaling("connection refused".to_string()));
            }
            Ok(batches.remove(0))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_makes_bounded_attempts() {
        let (sink, _events) = SessionSink::new();
        let session = MockSession::new(sink, MockBehavior::default());
        let source = RecordingSource::new(vec![
            vec![MockSession::candidate(0)],
            vec![],
            vec![MockSession::candidate(1), MockSession::candidate(2)],
        ]);

        let summary = CandidatePoller::new(BackoffSchedule::default(), source.clone(), session.clone())
            .spawn(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.attempts, 10);
        assert_eq!(summary.added, 3);
        assert_eq!(summary.failed_fetches, 7);
        assert_eq!(session.added_candidates().len(), 3);

        let calls = source.calls.lock().clone();
        assert_eq!(calls.len(), 10);
        assert!(calls[0] >= Duration::from_millis(50));
        let schedule = BackoffSchedule::default();
        for (i, pair) in calls.windows(2).enumerate() {
            assert!(pair[1] - pair[0] >= schedule.base_delay(i as u32 + 1));
        }
        let span: Duration = (0..10).map(|i| schedule.base_delay(i)).sum();
        assert!(calls[9] >= span);
        assert!(calls[9] > Duration::from_secs(22));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_stops_when_cancelled() {
        let (sink, _events) = SessionSink::new();
        let session = MockSession::new(sink, MockBehavior::default());
        let source = RecordingSource::new(Vec::new());
        let cancel = CancellationToken::new();

        let handle = CandidatePoller::new(BackoffSchedule::default(), source.clone(), session).spawn(cancel.clone());
        // Attempts 0..=2 fire by 50 + 90 + 162 + 3 * 20 ms.
        tokio::time::sleep(Duration::from_millis(400)).await;
        cancel.cancel();

        let summary = handle.await.unwrap();
        assert!(summary.attempts >= 3 && summary.attempts < 10);
        let calls = source.calls.lock().len();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.calls.lock().len(), calls);
    }
}
