/// Protocol version reported by the health endpoint
pub const PROTOCOL_VERSION: &str = "/courier/1.0.0";

/// Application name
pub const APP_NAME: &str = "courier";

/// Default HTTP / WebSocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Maximum inbound WebSocket message size in bytes (64 KiB)
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Session token lifetime in minutes
pub const DEFAULT_TOKEN_TTL_MINUTES: i64 = 30;

/// Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// WebSocket close code for an orderly close
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code sent when a credential or sender claim is rejected
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// WebSocket close code sent on an unexpected server failure
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Key derivation context (BLAKE3) for chat identifiers
pub const KDF_CONTEXT_CHAT_ID: &str = "courier-chat-id-v1";

/// Number of hex characters kept from the chat id digest
pub const CHAT_ID_HEX_LEN: usize = 32;
