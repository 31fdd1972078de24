/// Default chunk size for direct-channel file transfers (16 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16_384;

/// Default pause between two chunk records, in milliseconds
pub const DEFAULT_CHUNK_PACING_MS: u64 = 10;

/// Largest message a direct channel is assumed to deliver reliably (256 KiB)
pub const MAX_CHANNEL_MESSAGE_SIZE: usize = 262_144;

/// Maximum relay envelope size accepted by the hub (1 MiB)
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Default HTTP / WebSocket port of the relay hub
pub const DEFAULT_HTTP_PORT: u16 = 3000;

/// Path of the relay WebSocket endpoint
pub const RELAY_WS_PATH: &str = "/ws";

/// Display name used when a peer does not provide one
pub const DEFAULT_USERNAME: &str = "anonymous";

/// Content type assumed for files announced without one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
