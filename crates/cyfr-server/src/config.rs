//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use cyfr_shared::constants::{DEFAULT_HTTP_PORT, MAX_ENVELOPE_SIZE};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) server carrying the relay WebSocket.
    /// Env: `HTTP_ADDR`, or `PORT` to change only the port
    /// Default: `0.0.0.0:3000`
    pub http_addr: SocketAddr,

    /// Directory served as static assets for any unmatched path.
    /// Env: `STATIC_DIR`
    /// Default: none (no static files served).
    pub static_dir: Option<PathBuf>,

    /// Human-readable name for this relay instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"cyfr relay"`
    pub instance_name: String,

    /// Maximum number of concurrently registered peers (0 = unlimited).
    /// Env: `MAX_PEERS`
    /// Default: `0`
    pub max_peers: usize,

    /// Capacity of each peer's outbound envelope queue.
    /// Env: `LINK_BUFFER`
    /// Default: `256`
    pub link_buffer: usize,

    /// Largest inbound WebSocket message accepted from a peer, in bytes.
    /// Env: `MAX_MESSAGE_SIZE`
    /// Default: 1 MiB
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            static_dir: None,
            instance_name: "cyfr relay".to_string(),
            max_peers: 0,
            link_buffer: 256,
            max_message_size: MAX_ENVELOPE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(port) = lookup("PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.http_addr.set_port(port),
                Err(_) => tracing::warn!(value = %port, "Invalid PORT, ignoring"),
            }
        }

        if let Some(dir) = lookup("STATIC_DIR") {
            if !dir.is_empty() {
                config.static_dir = Some(PathBuf::from(dir));
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(val) = lookup("MAX_PEERS") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_peers = n;
            }
        }

        if let Some(val) = lookup("LINK_BUFFER") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.link_buffer = n,
                _ => tracing::warn!(value = %val, "Invalid LINK_BUFFER, using default"),
            }
        }

        if let Some(val) = lookup("MAX_MESSAGE_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_message_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_MESSAGE_SIZE, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}
