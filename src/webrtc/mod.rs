//! WebRTC connection layer
//!
//! This module provides HTTP-negotiated WebRTC connections with:
//! - A negotiation state machine (offer/answer, bounded readiness, renegotiation)
//! - Late ICE candidate polling with jittered backoff
//! - Reliable (deduplicated) messages over an unreliable data channel
//! - Multi-party media routing between live connections

pub mod peer_connection;
pub mod signaling;
pub mod negotiation;
pub mod candidates;
pub mod data_channel;
pub mod media_track;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;

pub use data_channel::{ChannelMessage, ReliableOptions};
pub use negotiation::{ConnectionState, Negotiation, NegotiationState, Readiness};
pub use peer_connection::{PeerConnectionManager, PeerSession, SessionFactory, SessionRole};
pub use session::{Connection, ServerEvent, SessionManager};
pub use signaling::{ConnectionJson, IceCandidate, SessionDescription, StreamMap};

use thiserror::Error;

/// WebRTC-related errors
#[derive(Debug, Error)]
pub enum WebRTCError {
    /// The transport primitive cannot be constructed on this runtime
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),
    /// Readiness deadline passed without a single candidate
    #[error("Negotiation timed out without any ICE candidate")]
    NegotiationTimeout,
    /// Bad JSON or session description
    #[error("Malformed signal: {0}")]
    MalformedSignal(String),
    /// Connection id not in the registry
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),
    /// Transport went away after the session was active
    #[error("Transport disconnected: {0}")]
    TransportDisconnected(String),
    /// Operation not legal in the current negotiation state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Peer connection creation or teardown failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// SDP processing failed
    #[error("SDP error: {0}")]
    SdpError(String),
    /// ICE candidate processing failed
    #[error("ICE error: {0}")]
    IceError(String),
    /// Data channel error
    #[error("DataChannel error: {0}")]
    DataChannelError(String),
    /// Media track error
    #[error("Media error: {0}")]
    MediaError(String),
    /// HTTP signaling request failed before a response arrived
    #[error("Signaling request failed: {0}")]
    Signaling(String),
    /// HTTP signaling request answered with a non-success status
    #[error("Signaling request returned {status}: {body}")]
    HttpStatus { status: u16, body: String },
    /// Connection was closed while the operation was pending
    #[error("Connection closed")]
    Closed,
}
