//! # courier-server
//!
//! Real-time chat relay.
//!
//! This binary provides:
//! - **WebSocket sessions** (`/ws/{token}`) carrying chat messages and
//!   delivery/read receipts as JSON frames
//! - **Presence registry** with one live connection per user
//! - **Delivery engine** that persists every message before routing it and
//!   flushes queued messages when a receiver comes online
//! - **REST API** (axum) for chat history, blocking, health checks and
//!   operator token issuance
//! - **Per-IP rate limiting** on HTTP and per-connection flood control

mod api;
mod auth;
mod config;
mod connection;
mod delivery;
mod dispatch;
mod error;
mod presence;
mod rate_limit;
mod receipts;
mod session;
mod store;

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_store::Database;

use crate::api::AppState;
use crate::auth::TokenAuthenticator;
use crate::config::ServerConfig;
use crate::store::SqliteMessageStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting courier relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.allow_raw_user_ids {
        warn!("ALLOW_RAW_USER_IDS is on: /ws/user/{{user_id}} trusts the URL");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Message store (creates the file and runs migrations)
    let database = Database::open_at(&config.database_path)?;
    info!(path = %config.database_path.display(), "Message store ready");
    let store = Arc::new(SqliteMessageStore::new(database));

    // Session token authority
    let auth = match config.token_signing_key {
        Some(secret) => TokenAuthenticator::new(
            SigningKey::from_bytes(&secret),
            config.token_ttl_minutes,
            config.allow_raw_user_ids,
        ),
        None => {
            warn!("No TOKEN_SIGNING_KEY set, tokens will not survive a restart");
            TokenAuthenticator::ephemeral(config.token_ttl_minutes, config.allow_raw_user_ids)
        }
    };

    let http_addr = config.http_addr;
    let app_state = AppState::new(config, store, auth);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = app_state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
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
