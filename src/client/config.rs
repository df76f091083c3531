use std::env;
use std::time::Duration;

use crate::client::models::message_store::Presentation;

/// Messages requested per history page.
pub const PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub log_level: String,
    pub session: SessionConfig,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            api_base_url: env::var("API_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8080/api".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            session: SessionConfig {
                socket_url: env::var("SOCKET_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string()),
                page_size: env::var("PAGE_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(PAGE_SIZE),
                reconnect_delay: millis_from_env("RECONNECT_DELAY_MS", 3000),
                join_grace: millis_from_env("JOIN_GRACE_MS", 500),
                history_settle: millis_from_env("HISTORY_SETTLE_MS", 500),
                announce_disconnects: env::var("ANNOUNCE_DISCONNECTS").map(|v| v == "true" || v == "1").unwrap_or(false),
                presentation: Presentation::NewestFirst,
            },
        }
    }
}

fn millis_from_env(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default_ms))
}

/// Per-room timing and presentation knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub socket_url: String,
    pub page_size: u32,
    /// Fixed delay before reconnecting after a close. Never grows.
    pub reconnect_delay: Duration,
    /// Wait after open before announcing ourselves with a JOIN frame.
    pub join_grace: Duration,
    /// Pause after a history fetch before another one may start.
    pub history_settle: Duration,
    /// Insert a local SYSTEM notice whenever the socket closes.
    pub announce_disconnects: bool,
    pub presentation: Presentation,
}

impl SessionConfig {
    pub fn new(socket_url: impl Into<String>) -> Self {
        Self {
            socket_url: socket_url.into(),
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://127.0.0.1:8080/ws".to_string(),
            page_size: PAGE_SIZE,
            reconnect_delay: Duration::from_millis(3000),
            join_grace: Duration::from_millis(500),
            history_settle: Duration::from_millis(500),
            announce_disconnects: false,
            presentation: Presentation::NewestFirst,
        }
    }
}
