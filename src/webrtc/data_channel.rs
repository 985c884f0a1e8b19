//! Data channel messaging
//!
//! Events travel as single-key JSON objects, `{"<event>": data}`. Reliable
//! events wrap their payload as `{"MESSAGE": data, "RELIABLE": 1, "ID": id}`
//! and are resent on a fixed interval over the unreliable channel; the
//! receiver delivers each id at most once within a retention window.
//! Binary payloads are passed through untouched.

use super::peer_connection::{Payload, PeerSession};
use super::WebRTCError;
use crate::config::ReliabilityConfig;
use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const RELIABLE_MESSAGE_KEY: &str = "MESSAGE";
const RELIABLE_FLAG_KEY: &str = "RELIABLE";
const RELIABLE_ID_KEY: &str = "ID";
const RELIABLE_ID_LEN: usize = 24;

/// How long a received reliable id is remembered
pub const DEFAULT_RELIABLE_WINDOW: Duration = Duration::from_secs(15);

/// An application message received over the data channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Event { event: String, data: Value, reliable: bool },
    Raw(Bytes),
}

/// A decoded payload, before duplicate suppression
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub message: ChannelMessage,
    pub reliable_id: Option<String>,
}

pub fn encode_event(event: &str, data: &Value) -> String {
    let mut envelope = Map::new();
    envelope.insert(event.to_string(), data.clone());
    Value::Object(envelope).to_string()
}

pub fn encode_reliable(event: &str, data: &Value, id: &str) -> String {
    let mut inner = Map::new();
    inner.insert(RELIABLE_MESSAGE_KEY.to_string(), data.clone());
    inner.insert(RELIABLE_FLAG_KEY.to_string(), Value::from(1));
    inner.insert(RELIABLE_ID_KEY.to_string(), Value::from(id));
    encode_event(event, &Value::Object(inner))
}

pub fn decode(payload: &Payload) -> Result<Decoded, WebRTCError> {
    let text = match payload {
        Payload::Binary(bytes) => {
            return Ok(Decoded {
                message: ChannelMessage::Raw(bytes.clone()),
                reliable_id: None,
            })
        }
        Payload::Text(text) => text,
    };

    let value: Value = serde_json::from_str(text)
        .map_err(|e| WebRTCError::DataChannelError(format!("Invalid message JSON: {}", e)))?;
    let Value::Object(envelope) = value else {
        return Err(WebRTCError::DataChannelError("Message is not a JSON object".to_string()));
    };
    if envelope.len() != 1 {
        return Err(WebRTCError::DataChannelError(format!(
            "Message must carry exactly one event, found {}",
            envelope.len()
        )));
    }
    let Some((event, data)) = envelope.into_iter().next() else {
        return Err(WebRTCError::DataChannelError("Empty message".to_string()));
    };

    if let Value::Object(ref inner) = data {
        let flagged = inner.get(RELIABLE_FLAG_KEY).and_then(Value::as_u64) == Some(1);
        if flagged {
            let id = inner
                .get(RELIABLE_ID_KEY)
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| WebRTCError::DataChannelError("Reliable message without ID".to_string()))?
                .to_string();
            let data = inner.get(RELIABLE_MESSAGE_KEY).cloned().unwrap_or(Value::Null);
            return Ok(Decoded {
                message: ChannelMessage::Event { event, data, reliable: true },
                reliable_id: Some(id),
            });
        }
    }

    Ok(Decoded {
        message: ChannelMessage::Event { event, data, reliable: false },
        reliable_id: None,
    })
}

/// Random id for an outgoing reliable message
pub fn reliable_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RELIABLE_ID_LEN)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone)]
pub struct ReliableRecord {
    pub received_at: Instant,
    pub expires_at: Instant,
}

/// Reliable ids seen within the retention window
pub struct ReliabilityLedger {
    window: Duration,
    records: HashMap<String, ReliableRecord>,
}

impl ReliabilityLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            records: HashMap::new(),
        }
    }

    /// Record `id` at `now`; true if it should be delivered
    pub fn accept(&mut self, id: &str, now: Instant) -> bool {
        self.prune(now);
        if self.records.contains_key(id) {
            return false;
        }
        self.records.insert(
            id.to_string(),
            ReliableRecord {
                received_at: now,
                expires_at: now + self.window,
            },
        );
        true
    }

    /// Drop records whose window has passed
    pub fn prune(&mut self, now: Instant) {
        self.records.retain(|_, record| record.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Resend cadence for reliable messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableOptions {
    pub interval: Duration,
    pub runs: u32,
}

impl Default for ReliableOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(150),
            runs: 10,
        }
    }
}

impl ReliableOptions {
    pub fn from_config(config: &ReliabilityConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms),
            runs: config.runs,
        }
    }
}

/// Receive side of one connection's message channel
pub struct MessageChannel {
    ledger: Mutex<ReliabilityLedger>,
}

impl MessageChannel {
    pub fn new(window: Duration) -> Self {
        Self {
            ledger: Mutex::new(ReliabilityLedger::new(window)),
        }
    }

    /// Decode a payload; `None` for duplicates and undecodable input
    pub fn receive(&self, payload: &Payload) -> Option<ChannelMessage> {
        self.receive_at(payload, Instant::now())
    }

    pub fn receive_at(&self, payload: &Payload, now: Instant) -> Option<ChannelMessage> {
        let decoded = match decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping data channel message: {}", e);
                return None;
            }
        };

        if let Some(ref id) = decoded.reliable_id {
            if !self.ledger.lock().accept(id, now) {
                debug!("Duplicate reliable message {} suppressed", id);
                return None;
            }
        }
        Some(decoded.message)
    }

    pub fn pending_ids(&self) -> usize {
        self.ledger.lock().len()
    }
}

pub async fn send_event(session: &dyn PeerSession, event: &str, data: &Value) -> Result<(), WebRTCError> {
    session.send(Payload::Text(encode_event(event, data))).await
}

pub async fn send_raw(session: &dyn PeerSession, data: Bytes) -> Result<(), WebRTCError> {
    session.send(Payload::Binary(data)).await
}

/// Send `event` `options.runs` times, `options.interval` apart, under one id.
/// Stops early when `cancel` fires.
pub fn send_reliable(
    session: Arc<dyn PeerSession>,
    event: &str,
    data: &Value,
    options: ReliableOptions,
    cancel: CancellationToken,
) -> JoinHandle<u32> {
    let id = reliable_id();
    let text = encode_reliable(event, data, &id);
    let event = event.to_string();

    tokio::spawn(async move {
        let mut sent = 0;
        for run in 0..options.runs {
            if run > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.interval) => {}
                }
            } else if cancel.is_cancelled() {
                break;
            }
            match session.send(Payload::Text(text.clone())).await {
                Ok(()) => sent += 1,
                Err(e) => debug!("Reliable send {} of {} ({}) failed: {}", run + 1, event, id, e),
            }
        }
        sent
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::mock::{MockBehavior, MockSession};
    use crate::webrtc::peer_connection::SessionSink;
    use serde_json::json;

    #[test]
    fn test_envelope_shapes() {
        let plain: Value = serde_json::from_str(&encode_event("chat", &json!({"text": "hi"}))).unwrap();
        assert_eq!(plain, json!({"chat": {"text": "hi"}}));

        let reliable: Value = serde_json::from_str(&encode_reliable("chat", &json!("hi"), "abc")).unwrap();
        assert_eq!(reliable, json!({"chat": {"MESSAGE": "hi", "RELIABLE": 1, "ID": "abc"}}));
    }

    #[test]
    fn test_decode_rejects_bad_envelopes() {
        assert!(decode(&Payload::Text("not json".to_string())).is_err());
        assert!(decode(&Payload::Text("[1, 2]".to_string())).is_err());
        assert!(decode(&Payload::Text(r#"{"a": 1, "b": 2}"#.to_string())).is_err());
        assert!(decode(&Payload::Text(r#"{"a": {"RELIABLE": 1}}"#.to_string())).is_err());
    }

    #[test]
    fn test_decode_binary_passthrough() {
        let decoded = decode(&Payload::Binary(Bytes::from_static(b"\x00\x01"))).unwrap();
        assert_eq!(decoded.message, ChannelMessage::Raw(Bytes::from_static(b"\x00\x01")));
        assert_eq!(decoded.reliable_id, None);
    }

    #[test]
    fn test_reliable_ids_are_distinct() {
        let a = reliable_id();
        let b = reliable_id();
        assert_eq!(a.len(), RELIABLE_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_ledger_suppresses_duplicates_within_window() {
        let mut ledger = ReliabilityLedger::new(DEFAULT_RELIABLE_WINDOW);
        let t0 = Instant::now();

        assert!(ledger.accept("x", t0));
        assert!(!ledger.accept("x", t0 + Duration::from_millis(150)));
        assert!(!ledger.accept("x", t0 + Duration::from_millis(14_999)));
        assert!(ledger.accept("y", t0 + Duration::from_secs(1)));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_ledger_forgets_after_window() {
        let mut ledger = ReliabilityLedger::new(DEFAULT_RELIABLE_WINDOW);
        let t0 = Instant::now();

        assert!(ledger.accept("x", t0));
        assert!(ledger.accept("x", t0 + Duration::from_secs(15)));

        ledger.prune(t0 + Duration::from_secs(31));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_message_channel_delivers_reliable_once() {
        let channel = MessageChannel::new(DEFAULT_RELIABLE_WINDOW);
        let payload = Payload::Text(encode_reliable("move", &json!([1, 2]), "id-1"));
        let t0 = Instant::now();

        let first = channel.receive_at(&payload, t0);
        assert_eq!(
            first,
            Some(ChannelMessage::Event {
                event: "move".to_string(),
                data: json!([1, 2]),
                reliable: true
            })
        );
        for i in 1..10 {
            assert_eq!(channel.receive_at(&payload, t0 + Duration::from_millis(150 * i)), None);
        }

        let plain = Payload::Text(encode_event("move", &json!([3])));
        assert!(channel.receive_at(&plain, t0).is_some());
        assert!(channel.receive_at(&plain, t0).is_some());
        assert!(channel.receive_at(&Payload::Text("{".to_string()), t0).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reliable_repeats_under_one_id() {
        let (sink, _events) = SessionSink::new();
        let session = MockSession::new(sink, MockBehavior::default());

        let started = Instant::now();
        let sent = send_reliable(
            session.clone(),
            "ping",
            &json!({"n": 1}),
            ReliableOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(sent, 10);
        assert_eq!(started.elapsed(), Duration::from_millis(150 * 9));

        let receiver = MessageChannel::new(DEFAULT_RELIABLE_WINDOW);
        let delivered: Vec<_> = session.sent().iter().filter_map(|p| receiver.receive(p)).collect();
        assert_eq!(delivered.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reliable_stops_on_cancel() {
        let (sink, _events) = SessionSink::new();
        let session = MockSession::new(sink, MockBehavior::default());
        let cancel = CancellationToken::new();

        let handle = send_reliable(session.clone(), "ping", &Value::Null, ReliableOptions::default(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(320)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), 3);
        assert_eq!(session.sent().len(), 3);
    }
}
