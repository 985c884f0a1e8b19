//! Configuration management for peerlink

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Video codec used for forwarded peer video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    VP8,
    VP9,
    H264,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "vp8",
            VideoCodec::VP9 => "vp9",
            VideoCodec::H264 => "h264",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::VP9 => "video/VP9",
            VideoCodec::H264 => "video/H264",
        }
    }

    pub fn sdp_fmtp_line(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "",
            VideoCodec::VP9 => "profile-id=0",
            VideoCodec::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            }
        }
    }
}

/// ICE transport policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP signaling configuration
    pub http: HttpConfig,

    /// WebRTC transport configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Negotiation timing
    #[serde(default)]
    pub negotiation: NegotiationConfig,

    /// Reliable message resend/dedup settings
    #[serde(default)]
    pub reliability: ReliabilityConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP bind address
    pub host: String,

    /// HTTP port
    pub port: u16,

    /// Prefix under which the signaling routes are mounted
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// CORS origin (None allows any origin)
    pub cors_origin: Option<String>,

    /// Require HTTP basic authentication when creating connections
    #[serde(default)]
    pub basic_auth_enabled: bool,

    /// Basic auth username
    #[serde(default = "default_basic_auth_user")]
    pub basic_auth_user: String,

    /// Basic auth password
    #[serde(default)]
    pub basic_auth_password: String,
}

/// A single ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// Explicit ICE servers, used when no STUN/TURN host is configured
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    #[serde(default)]
    pub stun_host: String,
    #[serde(default)]
    pub stun_port: u16,

    #[serde(default)]
    pub turn_host: String,
    #[serde(default = "default_turn_port")]
    pub turn_port: u16,
    #[serde(default)]
    pub turn_protocol: String,
    #[serde(default)]
    pub turn_tls: bool,
    #[serde(default)]
    pub turn_username: String,
    #[serde(default)]
    pub turn_password: String,
    /// Shared secret for time-limited TURN REST credentials
    #[serde(default)]
    pub turn_shared_secret: String,

    #[serde(default)]
    pub ice_transport_policy: IceTransportPolicy,

    /// Public IPs advertised in host candidates
    #[serde(default)]
    pub nat1to1_ips: Vec<String>,

    /// Restrict ICE UDP sockets to this port range
    #[serde(default)]
    pub ephemeral_udp_port_range: Option<[u16; 2]>,

    /// Data channel label
    #[serde(default = "default_label")]
    pub label: String,

    /// Ordered delivery on the data channel
    #[serde(default)]
    pub ordered: bool,

    /// Retransmit limit on the data channel (0 = fire and forget)
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: Option<u16>,

    /// Lifetime limit for data channel retransmits, in ms. Takes precedence
    /// over `max_retransmits` when set.
    #[serde(default)]
    pub max_packet_life_time: Option<u16>,

    /// Route audio between connections
    #[serde(default)]
    pub audio: bool,

    /// Route video between connections
    #[serde(default)]
    pub video: bool,

    /// Codec of forwarded video
    #[serde(default)]
    pub video_codec: VideoCodec,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            stun_host: String::new(),
            stun_port: 0,
            turn_host: String::new(),
            turn_port: default_turn_port(),
            turn_protocol: String::new(),
            turn_tls: false,
            turn_username: String::new(),
            turn_password: String::new(),
            turn_shared_secret: String::new(),
            ice_transport_policy: IceTransportPolicy::All,
            nat1to1_ips: Vec::new(),
            ephemeral_udp_port_range: None,
            label: default_label(),
            ordered: false,
            max_retransmits: default_max_retransmits(),
            max_packet_life_time: None,
            audio: false,
            video: false,
            video_codec: VideoCodec::VP8,
            max_connections: default_max_connections(),
        }
    }
}

/// Negotiation timing: readiness deadline and candidate poll backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(default = "default_poll_initial_ms")]
    pub poll_initial_ms: u64,
    #[serde(default = "default_poll_factor")]
    pub poll_factor: f64,
    #[serde(default = "default_poll_jitter_ms")]
    pub poll_jitter_ms: u64,
}

impl NegotiationConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_ms: default_readiness_timeout_ms(),
            poll_attempts: default_poll_attempts(),
            poll_initial_ms: default_poll_initial_ms(),
            poll_factor: default_poll_factor(),
            poll_jitter_ms: default_poll_jitter_ms(),
        }
    }
}

/// Reliable message settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Resend interval in ms
    #[serde(default = "default_reliable_interval_ms")]
    pub interval_ms: u64,
    /// Number of transmissions per reliable message
    #[serde(default = "default_reliable_runs")]
    pub runs: u32,
    /// How long a received id is remembered, in ms
    #[serde(default = "default_reliable_window_ms")]
    pub window_ms: u64,
}

impl ReliabilityConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_reliable_interval_ms(),
            runs: default_reliable_runs(),
            window_ms: default_reliable_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig {
                host: "0.0.0.0".to_string(),
                port: 9208,
                path_prefix: default_path_prefix(),
                cors_origin: None,
                basic_auth_enabled: false,
                basic_auth_user: default_basic_auth_user(),
                basic_auth_password: String::new(),
            },
            webrtc: WebRTCConfig::default(),
            negotiation: NegotiationConfig::default(),
            reliability: ReliabilityConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !self.http.path_prefix.starts_with('/') {
            return Err("HTTP path_prefix must start with '/'".into());
        }

        if self.http.basic_auth_enabled && self.http.basic_auth_password.is_empty() {
            return Err("Basic auth is enabled but password is empty".into());
        }

        if self.webrtc.label.is_empty() {
            return Err("WebRTC data channel label must not be empty".into());
        }

        if let Some([low, high]) = self.webrtc.ephemeral_udp_port_range {
            if low == 0 || low > high {
                return Err("WebRTC ephemeral_udp_port_range must be a non-empty [low, high] range".into());
            }
        }

        if self.webrtc.ice_transport_policy == IceTransportPolicy::Relay
            && self.webrtc.turn_host.is_empty()
            && !self.webrtc.ice_servers.iter().any(|s| s.urls.iter().any(|u| u.starts_with("turn")))
        {
            return Err("Relay-only ICE policy requires a TURN server".into());
        }

        if self.webrtc.max_connections == 0 {
            return Err("WebRTC max_connections must be non-zero".into());
        }

        if self.negotiation.readiness_timeout_ms == 0 {
            return Err("Readiness timeout must be non-zero".into());
        }

        if self.negotiation.poll_factor < 1.0 {
            return Err("Candidate poll factor must be at least 1.0".into());
        }

        if self.reliability.runs == 0 {
            return Err("Reliable runs must be non-zero".into());
        }

        // A late resend must still hit the dedup window.
        let resend_span = self.reliability.interval_ms * self.reliability.runs as u64;
        if self.reliability.window_ms <= resend_span {
            return Err(format!(
                "Reliable window ({} ms) must exceed interval * runs ({} ms)",
                self.reliability.window_ms, resend_span
            )
            .into());
        }

        Ok(())
    }
}


fn default_path_prefix() -> String {
    "/rtc/v1".to_string()
}

fn default_basic_auth_user() -> String {
    "user".to_string()
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}

fn default_label() -> String {
    "peerlink".to_string()
}

fn default_max_retransmits() -> Option<u16> { Some(0) }
fn default_turn_port() -> u16 { 3478 }
fn default_max_connections() -> usize { 256 }
fn default_readiness_timeout_ms() -> u64 { 10_000 }
fn default_poll_attempts() -> u32 { 10 }
fn default_poll_initial_ms() -> u64 { 50 }
fn default_poll_factor() -> f64 { 1.8 }
fn default_poll_jitter_ms() -> u64 { 20 }
fn default_reliable_interval_ms() -> u64 { 150 }
fn default_reliable_runs() -> u32 { 10 }
fn default_reliable_window_ms() -> u64 { 15_000 }
