//! peerlink - HTTP-negotiated WebRTC connections
//!
//! Peer connections negotiated over plain request/response HTTP, with
//! reliable messages over unreliable data channels and media routed between
//! every pair of live connections.

pub mod config;
pub mod webrtc;
pub mod web;
pub mod client;

// Re-exports
pub use client::{ClientConnection, ClientOptions, PeerlinkClient, SignalingClient};
pub use config::{Config, WebRTCConfig, VideoCodec};
pub use webrtc::{ChannelMessage, ServerEvent, SessionManager, WebRTCError};
