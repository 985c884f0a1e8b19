//! Shared state for the signaling server

use super::auth::{Authorizer, BasicAuthorizer};
use crate::config::Config;
use crate::webrtc::SessionManager;
use log::info;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State handed to every HTTP handler
#[derive(Clone)]
pub struct SharedState {
    /// Configuration
    pub config: Arc<Config>,

    /// Connection registry
    pub sessions: Arc<SessionManager>,

    /// Create-request authorization hook
    pub authorizer: Option<Arc<dyn Authorizer>>,

    /// Server start time
    pub start_time: Instant,
}

impl SharedState {
    /// Build the state; HTTP Basic authorization is installed when enabled in config
    pub fn new(config: Arc<Config>, sessions: Arc<SessionManager>) -> Self {
        let authorizer: Option<Arc<dyn Authorizer>> = if config.http.basic_auth_enabled {
            info!("Basic authorization enabled for user {}", config.http.basic_auth_user);
            Some(Arc::new(BasicAuthorizer::new(
                config.http.basic_auth_user.clone(),
                config.http.basic_auth_password.clone(),
            )))
        } else {
            None
        };

        Self {
            config,
            sessions,
            authorizer,
            start_time: Instant::now(),
        }
    }

    /// Replace the authorization hook
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.connection_count()
    }
}
