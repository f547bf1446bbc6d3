//! Constants of peersky-node.

/// Timeout for IPNS and DNSLink resolution.
pub const NAME_RESOLUTION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Bytes sniffed from the head of a file to detect HTML.
pub const SNIFF_WINDOW: usize = 512;

/// Body cap of the per-room `POST /doc` endpoint.
pub const DOC_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Interval of the SSE keepalive comment line.
pub const SSE_KEEPALIVE_SECS: u64 = 20;

/// Attempts when binding the per-room HTTP server.
pub const BIND_RETRIES: u32 = 3;

/// Spacing between bind attempts.
pub const BIND_RETRY_DELAY_MS: u64 = 100;

/// Maximum length of a chat sender, in bytes.
pub const CHAT_SENDER_MAX: usize = 200;

/// Maximum length of a chat message, in bytes.
pub const CHAT_MESSAGE_MAX: usize = 65536;

/// Host the per-room HTTP servers bind to.
pub const ROOM_HOST: &str = "127.0.0.1";

/// Target of hs:// room actions.
pub const ROOM_TARGET: &str = "p2pmd";

/// Persistent snapshot file names under the user data directory.
pub const ENS_CACHE_FILE: &str = "ensCache.json";
/// See [ENS_CACHE_FILE].
pub const ROOM_PORTS_FILE: &str = "peersky-ports.json";
/// See [ENS_CACHE_FILE].
pub const HYPER_CACHE_FILE: &str = "hyper-cache.json";
/// See [ENS_CACHE_FILE].
pub const SWARM_KEYPAIR_FILE: &str = "swarm-keypair.json";

/// Warnings recorded for missing referenced files are capped at this count.
pub const MISSING_FILE_WARNING_CAP: usize = 20;
