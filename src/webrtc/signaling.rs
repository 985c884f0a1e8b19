//! HTTP signaling payloads
//!
//! JSON bodies exchanged over the request/response signaling surface:
//! session descriptions, ICE candidates, the connection summary returned
//! on create/reconnect, and the media correlation map.

use super::negotiation::ConnectionState;
use super::WebRTCError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// One half of a negotiated session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }

    /// Parse a description from a JSON request body
    pub fn from_json(json: &str) -> Result<Self, WebRTCError> {
        let description: SessionDescription = serde_json::from_str(json)
            .map_err(|e| WebRTCError::MalformedSignal(format!("Invalid session description: {}", e)))?;
        description.validate()?;
        Ok(description)
    }

    /// Reject descriptions that cannot be installed at all
    pub fn validate(&self) -> Result<(), WebRTCError> {
        match self.kind {
            SdpType::Offer | SdpType::Answer => {}
            other => {
                return Err(WebRTCError::MalformedSignal(format!(
                    "Unsupported description type: {}",
                    other
                )))
            }
        }
        if self.sdp.trim().is_empty() {
            return Err(WebRTCError::MalformedSignal("Empty SDP".to_string()));
        }
        Ok(())
    }
}

/// A discovered network path candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

/// Connection summary returned by create and reconnect
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionJson {
    #[serde(default)]
    pub user_data: serde_json::Value,
    pub id: String,
    pub ice_connection_state: String,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub signaling_state: String,
    #[serde(default)]
    pub state: Option<ConnectionState>,
    #[serde(default)]
    pub renegotiation_needed: bool,
}

/// Correlation id → peer connection id, per media kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMap {
    pub audio: BTreeMap<String, String>,
    pub video: BTreeMap<String, String>,
}

impl StreamMap {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && self.video.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_description() {
        let json = r#"{"type": "answer", "sdp": "v=0\r\n..."}"#;
        let desc = SessionDescription::from_json(json).unwrap();
        assert_eq!(desc.kind, SdpType::Answer);
        assert!(desc.sdp.starts_with("v=0"));
    }

    #[test]
    fn test_parse_description_rejects_garbage() {
        assert!(matches!(
            SessionDescription::from_json("{not json"),
            Err(WebRTCError::MalformedSignal(_))
        ));
        assert!(matches!(
            SessionDescription::from_json(r#"{"type": "answer", "sdp": "  "}"#),
            Err(WebRTCError::MalformedSignal(_))
        ));
        assert!(matches!(
            SessionDescription::from_json(r#"{"type": "rollback", "sdp": "v=0"}"#),
            Err(WebRTCError::MalformedSignal(_))
        ));
    }

    #[test]
    fn test_candidate_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);

        let parsed: IceCandidate =
            serde_json::from_str(r#"{"candidate": "candidate:2 1 udp 1 1.2.3.4 9 typ srflx"}"#).unwrap();
        assert_eq!(parsed.sdp_mid, None);
    }

    #[test]
    fn test_connection_json_is_camel_case() {
        let json = ConnectionJson {
            user_data: serde_json::json!({"user": "ada"}),
            id: "abc".to_string(),
            ice_connection_state: "new".to_string(),
            local_description: Some(SessionDescription::offer("v=0")),
            remote_description: None,
            signaling_state: "have-local-offer".to_string(),
            state: Some(ConnectionState::Negotiating),
            renegotiation_needed: false,
        };
        let value = serde_json::to_value(&json).unwrap();
        assert_eq!(value["userData"]["user"], "ada");
        assert_eq!(value["iceConnectionState"], "new");
        assert_eq!(value["localDescription"]["type"], "offer");
        assert!(value["remoteDescription"].is_null());
        assert_eq!(value["state"], "negotiating");
    }
}
