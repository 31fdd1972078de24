//! Peer node configuration loaded from environment variables.

use std::time::Duration;

use cyfr_shared::constants::{
    DEFAULT_CHUNK_PACING_MS, DEFAULT_CHUNK_SIZE, DEFAULT_HTTP_PORT, DEFAULT_USERNAME,
    MAX_CHANNEL_MESSAGE_SIZE, RELAY_WS_PATH,
};

/// Relay reconnection policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Env: `CYFR_RECONNECT_INITIAL_MS`, default 500
    pub initial_delay_ms: u64,
    /// Env: `CYFR_RECONNECT_MAX_MS`, default 30000
    pub max_delay_ms: u64,
    /// Env: `CYFR_RECONNECT_FACTOR`, default 2.0
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

/// Peer node configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// WebSocket URL of the relay hub.
    /// Env: `CYFR_RELAY_URL`
    /// Default: `ws://127.0.0.1:3000/ws`
    pub relay_url: String,

    /// Display name announced to the relay after every welcome.
    /// Env: `CYFR_USERNAME`
    /// Default: `"anonymous"`
    pub username: String,

    /// Configured chunk size for outbound transfers, in bytes.
    /// Env: `CYFR_CHUNK_SIZE`
    /// Default: 16384
    pub chunk_size: usize,

    /// Pause between two chunk records (0 disables pacing).
    /// Env: `CYFR_CHUNK_PACING_MS`
    /// Default: 10 ms
    pub chunk_pacing: Duration,

    pub reconnect: ReconnectConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            relay_url: format!("ws://127.0.0.1:{DEFAULT_HTTP_PORT}{RELAY_WS_PATH}"),
            username: DEFAULT_USERNAME.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_pacing: Duration::from_millis(DEFAULT_CHUNK_PACING_MS),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl PeerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("CYFR_RELAY_URL") {
            if url.starts_with("ws://") || url.starts_with("wss://") {
                config.relay_url = url;
            } else {
                tracing::warn!(value = %url, "Invalid CYFR_RELAY_URL, using default");
            }
        }

        if let Some(name) = lookup("CYFR_USERNAME") {
            let name = name.trim();
            if !name.is_empty() {
                config.username = name.to_string();
            }
        }

        if let Some(val) = lookup("CYFR_CHUNK_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 && n <= MAX_CHANNEL_MESSAGE_SIZE => config.chunk_size = n,
                _ => tracing::warn!(value = %val, "Invalid CYFR_CHUNK_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("CYFR_CHUNK_PACING_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.chunk_pacing = Duration::from_millis(ms),
                Err(_) => tracing::warn!(value = %val, "Invalid CYFR_CHUNK_PACING_MS, using default"),
            }
        }

        if let Some(val) = lookup("CYFR_RECONNECT_INITIAL_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.reconnect.initial_delay_ms = ms,
                _ => tracing::warn!(value = %val, "Invalid CYFR_RECONNECT_INITIAL_MS, using default"),
            }
        }

        if let Some(val) = lookup("CYFR_RECONNECT_MAX_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.reconnect.max_delay_ms = ms,
                _ => tracing::warn!(value = %val, "Invalid CYFR_RECONNECT_MAX_MS, using default"),
            }
        }

        if let Some(val) = lookup("CYFR_RECONNECT_FACTOR") {
            match val.parse::<f64>() {
                Ok(f) if f.is_finite() && f >= 1.0 => config.reconnect.backoff_factor = f,
                _ => tracing::warn!(value = %val, "Invalid CYFR_RECONNECT_FACTOR, using default"),
            }
        }

        if config.reconnect.max_delay_ms < config.reconnect.initial_delay_ms {
            tracing::warn!(
                initial = config.reconnect.initial_delay_ms,
                max = config.reconnect.max_delay_ms,
                "Reconnect max delay below initial delay, raising it"
            );
            config.reconnect.max_delay_ms = config.reconnect.initial_delay_ms;
        }

        config
    }
}
