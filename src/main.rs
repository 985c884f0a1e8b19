//! peerlink - Main entry point
//!
//! Runs the HTTP signaling server and relays data channel messages between
//! connected peers.

mod args;

use args::Args;
use clap::Parser;
use log::{debug, error, info, warn};
use peerlink::config::Config;
use peerlink::web::{run_http_server, SharedState};
use peerlink::webrtc::{ChannelMessage, PeerConnectionManager, ServerEvent, SessionManager};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration before logging so the configured level applies
    let loaded = args.load_config();
    let mut config = match &loaded {
        Ok(cfg) => cfg.clone(),
        Err(_) => Config::default(),
    };

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = args.log_filter(&config);
    env_logger::Builder::new()
        .parse_filters(&std::env::var("PEERLINK_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_sctp", log::LevelFilter::Error)
        .init();

    info!("peerlink v{}", env!("CARGO_PKG_VERSION"));

    match loaded {
        Ok(_) => info!("Loaded configuration from {:?}", args.config),
        Err(e) => warn!("Failed to load config: {}, using defaults", e),
    }

    args.apply_overrides(&mut config);

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    info!(
        "Routing audio: {}, video: {} ({}), max connections: {}",
        config.webrtc.audio,
        config.webrtc.video,
        config.webrtc.video_codec.as_str(),
        config.webrtc.max_connections
    );

    let config = Arc::new(config);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let factory = Arc::new(PeerConnectionManager::new(config.webrtc.clone()));
    let sessions = Arc::new(SessionManager::new(&config, factory, event_tx));

    tokio::spawn(relay_events(sessions.clone(), event_rx));

    let state = Arc::new(SharedState::new(config.clone(), sessions.clone()));
    let shutdown = async {
        let _ = signal::ctrl_c().await;
        info!("Received shutdown signal");
    };

    let result = run_http_server(state, shutdown).await;

    info!("Closing {} connection(s)", sessions.connection_count());
    sessions.close_all().await;

    if let Err(ref e) = result {
        error!("HTTP server error: {}", e);
    }
    info!("Shutdown complete");
    result
}

/// Forward every message a peer sends to all other active peers
async fn relay_events(sessions: Arc<SessionManager>, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::Connected { id, user_data } => {
                info!("Peer {} connected (user data: {})", id, user_data);
            }
            ServerEvent::Disconnected { id } => {
                info!("Peer {} disconnected", id);
            }
            ServerEvent::Message { id, message } => match message {
                ChannelMessage::Event { event, data, reliable } => {
                    let sent = sessions.broadcast(&event, &data, reliable, Some(&id)).await;
                    debug!("Relayed '{}' from {} to {} peer(s)", event, id, sent);
                }
                ChannelMessage::Raw(bytes) => {
                    let len = bytes.len();
                    let sent = sessions.broadcast_raw(bytes, Some(&id)).await;
                    debug!("Relayed {} raw bytes from {} to {} peer(s)", len, id, sent);
                }
            },
        }
    }
    debug!("Event relay stopped");
}
