//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use courier_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_TOKEN_TTL_MINUTES, MAX_FRAME_BYTES, SECRET_KEY_SIZE,
};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8000`
    pub http_addr: SocketAddr,

    /// SQLite file backing the message store.
    /// Env: `DATABASE_PATH`
    /// Default: `./courier.db`
    pub database_path: PathBuf,

    /// Ed25519 secret used to issue and verify session tokens (hex, 64 chars).
    /// Env: `TOKEN_SIGNING_KEY`
    /// Default: `None` (a random key is generated at startup, so tokens do
    /// not survive a restart).
    pub token_signing_key: Option<[u8; SECRET_KEY_SIZE]>,

    /// Lifetime of issued session tokens.
    /// Env: `TOKEN_TTL_MINUTES`
    /// Default: `30`
    pub token_ttl_minutes: i64,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Accept the historical `/ws/user/{user_id}` route that trusts a raw
    /// user id from the URL.
    /// Env: `ALLOW_RAW_USER_IDS` (true/false)
    /// Default: `false`
    pub allow_raw_user_ids: bool,

    /// Malformed frames tolerated on one connection before it is closed.
    /// The count never resets during the connection's lifetime.
    /// Env: `MALFORMED_FRAME_TOLERANCE`
    /// Default: `5`
    pub malformed_frame_tolerance: u32,

    /// Capacity of each connection's outbound frame queue.
    /// Env: `OUTBOUND_QUEUE_CAPACITY`
    /// Default: `256`
    pub outbound_queue_capacity: usize,

    /// Largest inbound WebSocket message accepted, in bytes.
    /// Env: `MAX_FRAME_BYTES`
    /// Default: `65536`
    pub max_frame_bytes: usize,

    /// Grace period for a closing connection's tasks to finish.
    /// Env: `SHUTDOWN_GRACE_MS`
    /// Default: `2000`
    pub shutdown_grace: Duration,

    /// Sustained inbound frame rate per connection.
    /// Env: `FRAME_RATE_PER_SEC`
    /// Default: `20`
    pub frame_rate_per_sec: f64,

    /// Inbound frame burst per connection.
    /// Env: `FRAME_BURST`
    /// Default: `40`
    pub frame_burst: f64,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets are reported by presence only.
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("token_signing_key", &self.token_signing_key.is_some())
            .field("token_ttl_minutes", &self.token_ttl_minutes)
            .field("admin_token", &self.admin_token.is_some())
            .field("allow_raw_user_ids", &self.allow_raw_user_ids)
            .field("malformed_frame_tolerance", &self.malformed_frame_tolerance)
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("frame_rate_per_sec", &self.frame_rate_per_sec)
            .field("frame_burst", &self.frame_burst)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./courier.db"),
            token_signing_key: None,
            token_ttl_minutes: DEFAULT_TOKEN_TTL_MINUTES,
            admin_token: None,
            allow_raw_user_ids: false,
            malformed_frame_tolerance: 5,
            outbound_queue_capacity: 256,
            max_frame_bytes: MAX_FRAME_BYTES,
            shutdown_grace: Duration::from_millis(2000),
            frame_rate_per_sec: 20.0,
            frame_burst: 40.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(hex_key) = lookup("TOKEN_SIGNING_KEY") {
            match parse_hex_key(&hex_key) {
                Ok(key) => config.token_signing_key = Some(key),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Invalid TOKEN_SIGNING_KEY, a random key will be generated"
                    );
                }
            }
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(val) = lookup("ALLOW_RAW_USER_IDS") {
            config.allow_raw_user_ids = val == "true" || val == "1";
        }

        parse_into(&lookup, "TOKEN_TTL_MINUTES", &mut config.token_ttl_minutes);
        parse_into(
            &lookup,
            "MALFORMED_FRAME_TOLERANCE",
            &mut config.malformed_frame_tolerance,
        );
        parse_into(
            &lookup,
            "OUTBOUND_QUEUE_CAPACITY",
            &mut config.outbound_queue_capacity,
        );
        parse_into(&lookup, "MAX_FRAME_BYTES", &mut config.max_frame_bytes);
        parse_into(&lookup, "FRAME_RATE_PER_SEC", &mut config.frame_rate_per_sec);
        parse_into(&lookup, "FRAME_BURST", &mut config.frame_burst);

        let mut grace_ms = config.shutdown_grace.as_millis() as u64;
        parse_into(&lookup, "SHUTDOWN_GRACE_MS", &mut grace_ms);
        config.shutdown_grace = Duration::from_millis(grace_ms);

        // A zero-capacity mpsc channel panics on creation.
        config.outbound_queue_capacity = config.outbound_queue_capacity.max(1);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
        }
    }
}

/// Parse a 64-character hex string into a 32-byte key.
fn parse_hex_key(hex_str: &str) -> Result<[u8; SECRET_KEY_SIZE], String> {
    let hex_str = hex_str.trim();
    if hex_str.len() != SECRET_KEY_SIZE * 2 {
        return Err(format!(
            "expected {} hex chars, got {}",
            SECRET_KEY_SIZE * 2,
            hex_str.len()
        ));
    }

    let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; SECRET_KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}
