use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, Method},
    middleware,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_shared::constants::{APP_NAME, PROTOCOL_VERSION};
use courier_shared::protocol::{ChatSummary, MessageView, OutboundFrame};
use courier_shared::{ChatId, UserId};

use crate::auth::{Authenticator, Credential, TokenAuthenticator};
use crate::config::ServerConfig;
use crate::delivery::DeliveryEngine;
use crate::error::RelayError;
use crate::presence::ConnectionRegistry;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::receipts::ReceiptProcessor;
use crate::session::serve_socket;
use crate::store::MessageStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: ConnectionRegistry,
    pub engine: Arc<DeliveryEngine>,
    pub receipts: Arc<ReceiptProcessor>,
    pub auth: Arc<TokenAuthenticator>,
    pub rate_limiter: RateLimiter,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn MessageStore>,
        auth: TokenAuthenticator,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let engine = Arc::new(DeliveryEngine::new(store, registry.clone()));
        let receipts = Arc::new(ReceiptProcessor::new(engine.clone()));
        Self {
            config: Arc::new(config),
            registry,
            engine,
            receipts,
            auth: Arc::new(auth),
            rate_limiter: RateLimiter::default(),
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws/{token}", get(ws_with_token))
        .route("/ws/user/{user_id}", get(ws_with_user_id))
        .route("/chat_history", get(chat_list))
        .route("/chat_history/{other_user_id}", get(chat_history))
        .route("/block_user/{user_id}", post(block_user))
        .route("/admin/status", get(admin_status))
        .route("/admin/token/{user_id}", post(admin_issue_token))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    service: &'static str,
    status: &'static str,
    version: &'static str,
    protocol: &'static str,
}

#[derive(Serialize)]
struct BlockResponse {
    blocked: bool,
    chat_id: ChatId,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    online_users: usize,
    rate_limited_clients: usize,
    allow_raw_user_ids: bool,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct IssueTokenParams {
    /// Display name shown to the user's counterparts in chat summaries.
    name: Option<String>,
}

#[derive(Serialize)]
struct IssuedTokenResponse {
    user_id: UserId,
    token: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: APP_NAME,
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
    })
}

// ─── WebSocket ───

async fn ws_with_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = state.auth.resolve(Credential::Token(&token));
    upgrade(state, ws, identity)
}

async fn ws_with_user_id(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = state.auth.resolve(Credential::RawUserId(&user_id));
    upgrade(state, ws, identity)
}

/// Upgrade even on a bad credential so the client sees a policy-violation
/// close code instead of a failed handshake.
fn upgrade(
    state: AppState,
    ws: WebSocketUpgrade,
    identity: Result<UserId, RelayError>,
) -> Response {
    let max_frame = state.config.max_frame_bytes;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| serve_socket(state, socket, identity))
}

// ─── Chat history ───

/// Resolve the caller from an `Authorization: Bearer <token>` header.
fn bearer_user(headers: &HeaderMap, state: &AppState) -> Result<UserId, RelayError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::Unauthorized("missing bearer token".to_string()))?;
    state.auth.resolve(Credential::Token(header))
}

async fn chat_list(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<ChatSummary>>, RelayError> {
    let user = bearer_user(&headers, &state)?;
    let store = state.engine.store();

    let mut summaries = Vec::new();
    for chat in store.list_chats(&user).await? {
        let Some(counterpart) = chat.counterpart(&user).cloned() else {
            continue;
        };
        let name = store.display_name(&counterpart).await?;
        let online = state.registry.is_online(&counterpart).await;
        summaries.extend(chat.summary_for(&user, name, online));
    }
    Ok(Json(summaries))
}

async fn chat_history(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(other): Path<String>,
) -> Result<Json<Vec<MessageView>>, RelayError> {
    let user = bearer_user(&headers, &state)?;
    let other = UserId::new(other);
    if other.is_empty() {
        return Err(RelayError::BadRequest("empty user id".to_string()));
    }

    let history = state.engine.open_chat(&user, &other).await?;
    Ok(Json(history))
}

async fn block_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(other): Path<String>,
) -> Result<Json<BlockResponse>, RelayError> {
    let user = bearer_user(&headers, &state)?;
    let other = UserId::new(other);
    let store = state.engine.store();

    let chat = store
        .find_chat(&user, &other)
        .await?
        .ok_or_else(|| RelayError::NotFound("Chat not found".to_string()))?;
    if !store.block_chat(&chat.id, &user).await? {
        return Err(RelayError::NotFound("Chat not found".to_string()));
    }
    info!(user = %user, other = %other, chat = %chat.id, "Chat blocked");

    // Both sides see the new flag in their recipient lists.
    let chat = store.get_chat(&chat.id).await?;
    for participant in [&user, &other] {
        let Some(connection) = state.registry.lookup(participant).await else {
            continue;
        };
        let Some(counterpart) = chat.counterpart(participant) else {
            continue;
        };
        let name = store.display_name(counterpart).await?;
        let online = state.registry.is_online(counterpart).await;
        if let Some(summary) = chat.summary_for(participant, name, online) {
            connection.send(OutboundFrame::RecipientList(summary)).await;
        }
    }

    Ok(Json(BlockResponse {
        blocked: true,
        chat_id: chat.id,
    }))
}

// ─── Admin ───

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), RelayError> {
    let Some(ref expected) = config.admin_token else {
        return Err(RelayError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(RelayError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, RelayError> {
    verify_admin_token(&headers, &state.config)?;

    Ok(Json(AdminStatusResponse {
        online_users: state.registry.online_count().await,
        rate_limited_clients: state.rate_limiter.tracked().await,
        allow_raw_user_ids: state.config.allow_raw_user_ids,
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

async fn admin_issue_token(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<IssueTokenParams>,
) -> Result<Json<IssuedTokenResponse>, RelayError> {
    verify_admin_token(&headers, &state.config)?;

    let user = UserId::new(user_id.trim());
    let token = state
        .auth
        .issue(&user)
        .map_err(|_| RelayError::BadRequest("cannot issue a token for this user id".into()))?;

    if let Some(name) = params.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
        state
            .engine
            .store()
            .set_display_name(&user, Some(name))
            .await?;
    }

    info!(user = %user, "Admin issued session token");
    Ok(Json(IssuedTokenResponse {
        user_id: user,
        token,
    }))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use courier_shared::protocol::SubmitMessage;
    use courier_shared::MessageStatus;
    use courier_store::Database;
    use tower::ServiceExt;

    use crate::connection::ConnectionHandle;
    use crate::store::SqliteMessageStore;

    fn state() -> AppState {
        let config = ServerConfig {
            admin_token: Some("admin-secret".to_string()),
            ..ServerConfig::default()
        };
        let store = Arc::new(SqliteMessageStore::new(Database::open_in_memory().unwrap()));
        AppState::new(config, store, TokenAuthenticator::ephemeral(30, false))
    }

    fn bearer(state: &AppState, user: &str) -> String {
        format!("Bearer {}", state.auth.issue(&UserId::from(user)).unwrap())
    }

    async fn call(state: &AppState, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn send(state: &AppState, from: &str, to: &str, body: &str) {
        let (handle, rx, _gate) = ConnectionHandle::open(UserId::from(from), 16);
        std::mem::forget(rx);
        state
            .engine
            .submit(
                &handle,
                SubmitMessage {
                    sender: None,
                    receiver: UserId::from(to),
                    message: body.to_string(),
                    attachments: Vec::new(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_health() {
        let state = state();
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let (status, json) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], APP_NAME);
    }

    #[tokio::test]
    async fn test_history_requires_bearer() {
        let state = state();
        let req = Request::get("/chat_history/bob").body(Body::empty()).unwrap();
        let (status, _) = call(&state, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_history_marks_read() {
        let state = state();
        send(&state, "alice", "bob", "hi").await;

        // Deliver it so there is something to mark read.
        let backlog = state
            .engine
            .store()
            .fetch_backlog(&UserId::from("bob"))
            .await
            .unwrap();
        state
            .engine
            .store()
            .advance_status(backlog[0].id, MessageStatus::Delivered)
            .await
            .unwrap();

        let req = Request::get("/chat_history/alice")
            .header("authorization", bearer(&state, "bob"))
            .body(Body::empty())
            .unwrap();
        let (status, json) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["message"], "hi");
        assert_eq!(json[0]["status"], "read");
    }

    #[tokio::test]
    async fn test_chat_list_and_block() {
        let state = state();
        send(&state, "alice", "bob", "hi").await;

        let req = Request::get("/chat_history")
            .header("authorization", bearer(&state, "alice"))
            .body(Body::empty())
            .unwrap();
        let (status, json) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["receiver"], "bob");
        assert_eq!(json[0]["is_blocked"], false);

        let req = Request::post("/block_user/bob")
            .header("authorization", bearer(&state, "alice"))
            .body(Body::empty())
            .unwrap();
        let (status, json) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["blocked"], true);

        let req = Request::post("/block_user/carol")
            .header("authorization", bearer(&state, "alice"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_token_issue() {
        let state = state();

        let req = Request::post("/admin/token/alice")
            .header("authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let req = Request::post("/admin/token/alice")
            .header("authorization", "Bearer admin-secret")
            .body(Body::empty())
            .unwrap();
        let (status, json) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);

        let token = json["token"].as_str().unwrap();
        let user = state.auth.resolve(Credential::Token(token)).unwrap();
        assert_eq!(user, UserId::from("alice"));
    }

    #[tokio::test]
    async fn test_admin_token_records_display_name() {
        let state = state();

        let req = Request::post("/admin/token/alice?name=Alice")
            .header("authorization", "Bearer admin-secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);

        let name = state
            .engine
            .store()
            .display_name(&UserId::from("alice"))
            .await
            .unwrap();
        assert_eq!(name, "Alice");
    }
}
