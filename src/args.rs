use clap::Parser;
use std::path::PathBuf;

use peerlink::config::{self, IceTransportPolicy};

#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(author = "Peerlink Team")]
#[command(version)]
#[command(about = "HTTP-negotiated WebRTC signaling server", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/peerlink.toml")]
    pub config: PathBuf,

    /// HTTP bind address
    #[arg(long)]
    pub host: Option<String>,

    /// HTTP port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Signaling route prefix (e.g. /rtc/v1)
    #[arg(long)]
    pub prefix: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Do not route audio between connections
    #[arg(long, action)]
    pub no_audio: bool,

    /// Do not route video between connections
    #[arg(long, action)]
    pub no_video: bool,

    /// Only use TURN relay candidates
    #[arg(long, action)]
    pub relay_only: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(ref host) = self.host {
            config.http.host = host.clone();
        }
        if let Some(port) = self.port {
            config.http.port = port;
        }
        if let Some(ref prefix) = self.prefix {
            config.http.path_prefix = prefix.clone();
        }
        if self.no_audio {
            config.webrtc.audio = false;
        }
        if self.no_video {
            config.webrtc.video = false;
        }
        if self.relay_only {
            config.webrtc.ice_transport_policy = IceTransportPolicy::Relay;
        }
    }

    /// Log filter: verbose wins over the configured level
    pub fn log_filter(&self, config: &config::Config) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            config.logging.level.clone()
        }
    }
}
