//! # cyfr-server
//!
//! Rendezvous relay for the cyfr peer network.
//!
//! This binary provides:
//! - **Relay WebSocket** (`/ws`) where peers register, learn about each
//!   other and exchange offer/answer/candidate envelopes
//! - **Chat relay** for peers without a direct channel
//! - **Health / info routes** and an optional static directory

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use cyfr_server::api::{self, AppState};
use cyfr_server::{spawn_hub, RelayHub, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cyfr_server=debug")),
        )
        .init();

    info!("Starting cyfr relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Spawn the hub (sole owner of the peer registry)
    // -----------------------------------------------------------------------
    let hub = spawn_hub(RelayHub::new(config.max_peers));

    let http_addr = config.http_addr;
    let app_state = AppState {
        hub,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
