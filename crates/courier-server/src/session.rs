//! Lifecycle of one client connection.
//!
//! Opening: register with the registry, send the recipient list, flush the
//! backlog. Running: dispatch inbound frames and refresh summaries when a
//! counterpart's presence changes. Closing: unregister, cancel the receipt
//! loops within the grace period, then stop the writer.

use futures::stream::{SplitSink, Stream, StreamExt};
use futures::SinkExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use axum::extract::ws::{CloseFrame, Message, WebSocket};

use courier_shared::constants::{CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use courier_shared::protocol::OutboundFrame;
use courier_shared::UserId;

use crate::api::AppState;
use crate::connection::{ConnectionHandle, DeliveryGuard};
use crate::dispatch::{CloseReason, Dispatcher, Flow};
use crate::error::RelayError;
use crate::presence::Registration;
use crate::rate_limit::TokenBucket;

/// Transport-neutral inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketInput {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client went away or the socket failed.
    Disconnected,
    /// A newer connection for the same user took over.
    Replaced,
    PolicyViolation,
    Unauthorized,
    /// The server could not encode a frame for this client.
    InternalError,
}

impl SessionEnd {
    pub fn close_frame(self) -> (u16, &'static str) {
        match self {
            SessionEnd::Disconnected => (CLOSE_NORMAL, ""),
            SessionEnd::Replaced => (CLOSE_NORMAL, "replaced by a newer connection"),
            SessionEnd::PolicyViolation => (CLOSE_POLICY_VIOLATION, "too many invalid frames"),
            SessionEnd::Unauthorized => (CLOSE_POLICY_VIOLATION, "unauthorized"),
            SessionEnd::InternalError => (CLOSE_INTERNAL_ERROR, "internal error"),
        }
    }
}

impl From<CloseReason> for SessionEnd {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::PolicyViolation => SessionEnd::PolicyViolation,
            CloseReason::Unauthorized => SessionEnd::Unauthorized,
        }
    }
}

/// Drive an upgraded WebSocket for an already-resolved credential.
pub async fn serve_socket(
    state: AppState,
    socket: WebSocket,
    identity: Result<UserId, RelayError>,
) {
    let (mut sink, stream) = socket.split();

    let user = match identity {
        Ok(user) => user,
        Err(e) => {
            warn!(error = %e, "Rejecting connection");
            if let Ok(json) = e.to_frame().to_json() {
                let _ = sink.send(Message::Text(json.into())).await;
            }
            let (code, reason) = SessionEnd::Unauthorized.close_frame();
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    let (handle, outbound, gate) =
        ConnectionHandle::open(user, state.config.outbound_queue_capacity);
    let writer = tokio::spawn(write_frames(sink, outbound, handle.clone()));

    let inbound = stream
        .take_while(|msg| {
            let open = matches!(msg, Ok(m) if !matches!(m, Message::Close(_)));
            futures::future::ready(open)
        })
        .filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(SocketInput::Text(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => Some(SocketInput::Binary(bytes.to_vec())),
                // Pings are answered by the transport.
                _ => None,
            }
        });
    let inbound = Box::pin(inbound);

    let end = run_session(&state, handle.clone(), gate, inbound).await;

    let closing = match tokio::time::timeout(state.config.shutdown_grace, writer).await {
        Ok(Ok(WriterExit::Drained(sink))) => Some((sink, end)),
        Ok(Ok(WriterExit::EncodeFailed(sink))) => Some((sink, SessionEnd::InternalError)),
        Ok(Ok(WriterExit::SocketClosed)) => None,
        Ok(Err(e)) => {
            warn!(error = %e, "Writer task failed");
            None
        }
        Err(_) => {
            warn!(user = %handle.user(), "Writer did not stop in time");
            None
        }
    };

    if let Some((mut sink, end)) = closing {
        let (code, reason) = end.close_frame();
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }
}

/// Run a connection until the client leaves, violates the protocol, or is
/// replaced. Always leaves the registry and the connection's tasks clean.
pub async fn run_session<S>(
    state: &AppState,
    handle: ConnectionHandle,
    gate: DeliveryGuard,
    mut inbound: S,
) -> SessionEnd
where
    S: Stream<Item = SocketInput> + Unpin,
{
    let user = handle.user().clone();
    info!(user = %user, connection = %handle.id(), "Connection opened");

    if let Registration::Replaced(old) = state.registry.register(handle.clone()).await {
        debug!(user = %user, old = %old.id(), "Previous connection closed");
    }

    // Subscribe before the initial list so no presence change is missed.
    let mut presence = state.registry.subscribe();
    let mut presence_open = true;

    send_recipient_list(state, &handle).await;

    // offline -> online: everything queued while away goes out first.
    if let Err(e) = state.engine.flush_backlog(&handle, gate).await {
        warn!(user = %user, error = %e, "Backlog flush failed, messages stay queued");
    }

    let mut dispatcher = Dispatcher::new(
        handle.clone(),
        state.engine.clone(),
        state.receipts.clone(),
        TokenBucket::new(state.config.frame_rate_per_sec, state.config.frame_burst),
        state.config.malformed_frame_tolerance,
    );

    let end = loop {
        tokio::select! {
            _ = handle.cancelled() => {
                let replaced = state
                    .registry
                    .lookup(&user)
                    .await
                    .is_some_and(|current| current.id() != handle.id());
                break if replaced { SessionEnd::Replaced } else { SessionEnd::Disconnected };
            }
            input = inbound.next() => {
                let flow = match input {
                    Some(SocketInput::Text(text)) => dispatcher.on_text(&text).await,
                    Some(SocketInput::Binary(bytes)) => dispatcher.on_binary(&bytes).await,
                    None => break SessionEnd::Disconnected,
                };
                if let Flow::Close(reason) = flow {
                    break reason.into();
                }
            }
            event = presence.recv(), if presence_open => match event {
                Ok(event) if event.user() != &user => {
                    refresh_summary(state, &handle, event.user()).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(user = %user, skipped, "Presence events lagged, resending list");
                    send_recipient_list(state, &handle).await;
                }
                Err(RecvError::Closed) => presence_open = false,
            },
        }
    };

    // Unregister first so no new push can pick this connection.
    state.registry.unregister(&user, handle.id()).await;
    dispatcher.shutdown(state.config.shutdown_grace).await;
    handle.close();

    info!(user = %user, connection = %handle.id(), ?end, "Connection closed");
    end
}

/// One `recipient_list` frame per chat the user takes part in.
async fn send_recipient_list(state: &AppState, handle: &ConnectionHandle) {
    let store = state.engine.store();
    let chats = match store.list_chats(handle.user()).await {
        Ok(chats) => chats,
        Err(e) => {
            warn!(user = %handle.user(), error = %e, "Could not load recipient list");
            return;
        }
    };

    for chat in chats {
        let Some(counterpart) = chat.counterpart(handle.user()).cloned() else {
            continue;
        };
        let name = store
            .display_name(&counterpart)
            .await
            .unwrap_or_else(|_| counterpart.to_string());
        let online = state.registry.is_online(&counterpart).await;

        if let Some(summary) = chat.summary_for(handle.user(), name, online) {
            if !handle.send(OutboundFrame::RecipientList(summary)).await {
                return;
            }
        }
    }
}

/// Re-send the summary of the chat with `counterpart`, if there is one.
async fn refresh_summary(state: &AppState, handle: &ConnectionHandle, counterpart: &UserId) {
    let store = state.engine.store();
    let chat = match store.find_chat(handle.user(), counterpart).await {
        Ok(Some(chat)) => chat,
        Ok(None) => return,
        Err(e) => {
            debug!(error = %e, "Could not refresh chat summary");
            return;
        }
    };

    let name = store
        .display_name(counterpart)
        .await
        .unwrap_or_else(|_| counterpart.to_string());
    let online = state.registry.is_online(counterpart).await;
    if let Some(summary) = chat.summary_for(handle.user(), name, online) {
        handle.send(OutboundFrame::RecipientList(summary)).await;
    }
}

/// Serialize queued frames onto the socket until the connection closes.
/// Hands the sink back so the caller can send a close frame.
/// How the writer task ended, with the sink handed back if it is still
/// usable for a close frame.
enum WriterExit {
    Drained(SplitSink<WebSocket, Message>),
    EncodeFailed(SplitSink<WebSocket, Message>),
    SocketClosed,
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    handle: ConnectionHandle,
) -> WriterExit {
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = handle.cancelled() => break,
        };

        // A dropped frame would leave the client out of sync, so it has to
        // reconnect and start over.
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(
                    user = %handle.user(),
                    error = %e,
                    kind = frame.kind(),
                    "Failed to encode frame"
                );
                handle.close();
                return WriterExit::EncodeFailed(sink);
            }
        };
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            debug!(user = %handle.user(), error = %e, "Socket write failed");
            handle.close();
            return WriterExit::SocketClosed;
        }
    }

    // Whatever was queued before the close still goes out.
    while let Ok(frame) = outbound.try_recv() {
        let Ok(json) = frame.to_json() else { continue };
        if sink.send(Message::Text(json.into())).await.is_err() {
            return WriterExit::SocketClosed;
        }
    }
    WriterExit::Drained(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::channel::mpsc::{unbounded, UnboundedSender};
    use tokio::task::JoinHandle;

    use courier_shared::protocol::MessageView;
    use courier_shared::{ChatId, MessageId, MessageStatus};
    use courier_store::{Chat, Database, NewMessage, StoredMessage};

    use crate::auth::TokenAuthenticator;
    use crate::config::ServerConfig;
    use crate::store::{MessageStore, SqliteMessageStore};

    struct Client {
        input: UnboundedSender<SocketInput>,
        frames: mpsc::Receiver<OutboundFrame>,
        handle: ConnectionHandle,
        task: JoinHandle<SessionEnd>,
    }

    impl Client {
        fn send(&self, json: String) {
            self.input.unbounded_send(SocketInput::Text(json)).unwrap();
        }

        async fn next(&mut self) -> OutboundFrame {
            tokio::time::timeout(Duration::from_secs(2), self.frames.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
        }

        /// Next frame that is not a recipient list entry.
        async fn next_event(&mut self) -> OutboundFrame {
            loop {
                match self.next().await {
                    OutboundFrame::RecipientList(_) => continue,
                    other => return other,
                }
            }
        }

        async fn next_message(&mut self) -> MessageView {
            match self.next_event().await {
                OutboundFrame::Message(view) => view,
                other => panic!("expected message frame, got {other:?}"),
            }
        }

        async fn assert_quiet(&mut self) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            while let Ok(frame) = self.frames.try_recv() {
                assert!(
                    matches!(frame, OutboundFrame::RecipientList(_)),
                    "unexpected frame: {frame:?}"
                );
            }
        }

        async fn disconnect(self) -> SessionEnd {
            drop(self.input);
            tokio::time::timeout(Duration::from_secs(2), self.task)
                .await
                .expect("session did not end")
                .unwrap()
        }
    }

    fn state_with(store: Arc<dyn MessageStore>) -> AppState {
        let config = ServerConfig {
            shutdown_grace: Duration::from_millis(200),
            malformed_frame_tolerance: 2,
            ..ServerConfig::default()
        };
        AppState::new(config, store, TokenAuthenticator::ephemeral(30, false))
    }

    fn state() -> AppState {
        state_with(Arc::new(SqliteMessageStore::new(
            Database::open_in_memory().unwrap(),
        )))
    }

    async fn connect(state: &AppState, user: &str) -> Client {
        let (handle, frames, gate) = ConnectionHandle::open(UserId::from(user), 64);
        let (input, inbound) = unbounded();
        let task = {
            let state = state.clone();
            let handle = handle.clone();
            tokio::spawn(async move { run_session(&state, handle, gate, inbound).await })
        };
        // Wait until the registry has the connection.
        for _ in 0..100 {
            if state.registry.lookup(&UserId::from(user)).await.map(|h| h.id())
                == Some(handle.id())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Client {
            input,
            frames,
            handle,
            task,
        }
    }

    fn message_json(receiver: &str, body: &str) -> String {
        serde_json::json!({
            "type": "message",
            "data": { "receiver": receiver, "message": body }
        })
        .to_string()
    }

    fn receipt_json(chat: &ChatId, user: &str, id: MessageId, status: &str) -> String {
        serde_json::json!({
            "type": "receipt_update",
            "data": {
                "chat_id": chat,
                "user_id": user,
                "message_id": id,
                "status": status,
                "stop": false
            }
        })
        .to_string()
    }

    fn stop_json(chat: &ChatId, user: &str) -> String {
        serde_json::json!({
            "type": "receipt_update",
            "data": { "chat_id": chat, "user_id": user, "stop": true }
        })
        .to_string()
    }

    async fn wait_for_status(state: &AppState, id: MessageId, status: MessageStatus) {
        for _ in 0..100 {
            if state.engine.store().get_message(id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("message {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_offline_backlog_receipt_and_stop() {
        let state = state();
        let mut alice = connect(&state, "alice").await;

        alice.send(message_json("bob", "hi"));
        let sent = alice.next_message().await;
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.message, "hi");

        // Still `sent` while Bob is away.
        alice.assert_quiet().await;
        assert_eq!(
            state.engine.store().get_message(sent.id).await.unwrap().status,
            MessageStatus::Sent
        );

        let mut bob = connect(&state, "bob").await;
        let backlog = bob.next_message().await;
        assert_eq!(backlog.id, sent.id);
        assert_eq!(backlog.status, MessageStatus::Delivered);

        match alice.next_event().await {
            OutboundFrame::ReceiptUpdate(notice) => {
                assert_eq!(notice.message_id, sent.id);
                assert_eq!(notice.status, MessageStatus::Delivered);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let chat = ChatId::for_pair(&UserId::from("alice"), &UserId::from("bob"));
        bob.send(receipt_json(&chat, "bob", sent.id, "read"));
        match alice.next_event().await {
            OutboundFrame::ReceiptUpdate(notice) => {
                assert_eq!(notice.message_id, sent.id);
                assert_eq!(notice.status, MessageStatus::Read);
                assert_eq!(notice.user_id, UserId::from("bob"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // After stop, Bob's receipts for this chat are ignored.
        alice.send(message_json("bob", "second"));
        let second = alice.next_message().await;
        let _ = bob.next_message().await;
        match alice.next_event().await {
            OutboundFrame::ReceiptUpdate(n) => assert_eq!(n.status, MessageStatus::Delivered),
            other => panic!("unexpected frame: {other:?}"),
        }

        bob.send(stop_json(&chat, "bob"));
        bob.send(receipt_json(&chat, "bob", second.id, "read"));
        alice.assert_quiet().await;
        assert_eq!(
            state.engine.store().get_message(second.id).await.unwrap().status,
            MessageStatus::Delivered
        );

        // Reconnecting clears the stop.
        assert_eq!(bob.disconnect().await, SessionEnd::Disconnected);
        let mut bob = connect(&state, "bob").await;
        bob.send(receipt_json(&chat, "bob", second.id, "read"));
        match alice.next_event().await {
            OutboundFrame::ReceiptUpdate(n) => {
                assert_eq!(n.message_id, second.id);
                assert_eq!(n.status, MessageStatus::Read);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        bob.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_receipt_right_before_stop_is_applied_and_relayed() {
        let state = state();
        let mut alice = connect(&state, "alice").await;
        let mut bob = connect(&state, "bob").await;

        alice.send(message_json("bob", "first"));
        let first = alice.next_message().await;
        bob.next_message().await;
        alice.send(message_json("bob", "later"));
        let later = alice.next_message().await;
        bob.next_message().await;
        for _ in 0..2 {
            match alice.next_event().await {
                OutboundFrame::ReceiptUpdate(n) => assert_eq!(n.status, MessageStatus::Delivered),
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        let chat = ChatId::for_pair(&UserId::from("alice"), &UserId::from("bob"));
        bob.send(receipt_json(&chat, "bob", first.id, "read"));
        bob.send(stop_json(&chat, "bob"));
        bob.send(receipt_json(&chat, "bob", later.id, "read"));

        match alice.next_event().await {
            OutboundFrame::ReceiptUpdate(n) => {
                assert_eq!(n.message_id, first.id);
                assert_eq!(n.status, MessageStatus::Read);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        wait_for_status(&state, first.id, MessageStatus::Read).await;

        alice.assert_quiet().await;
        assert_eq!(
            state.engine.store().get_message(later.id).await.unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(SessionEnd::Disconnected.close_frame().0, CLOSE_NORMAL);
        assert_eq!(SessionEnd::Replaced.close_frame().0, CLOSE_NORMAL);
        assert_eq!(SessionEnd::Unauthorized.close_frame().0, CLOSE_POLICY_VIOLATION);
        assert_eq!(SessionEnd::PolicyViolation.close_frame().0, CLOSE_POLICY_VIOLATION);
        assert_eq!(SessionEnd::InternalError.close_frame().0, CLOSE_INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_live_delivery_keeps_submission_order() {
        let state = state();
        let mut alice = connect(&state, "alice").await;
        let mut bob = connect(&state, "bob").await;

        for i in 0..20 {
            alice.send(message_json("bob", &format!("m{i}")));
        }
        for i in 0..20 {
            let view = bob.next_message().await;
            assert_eq!(view.message, format!("m{i}"));
            assert_eq!(view.status, MessageStatus::Delivered);
        }
    }

    #[tokio::test]
    async fn test_messages_during_reconnect_delivered_once_in_order() {
        let state = state();
        let mut alice = connect(&state, "alice").await;

        for i in 0..5 {
            alice.send(message_json("bob", &format!("early{i}")));
            alice.next_message().await;
        }

        let mut bob = connect(&state, "bob").await;
        for i in 0..5 {
            alice.send(message_json("bob", &format!("late{i}")));
        }

        let mut received = Vec::new();
        for _ in 0..10 {
            received.push(bob.next_message().await.message);
        }
        let expected: Vec<String> = (0..5)
            .map(|i| format!("early{i}"))
            .chain((0..5).map(|i| format!("late{i}")))
            .collect();
        assert_eq!(received, expected);
        bob.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_recipient_list_on_connect_and_presence_change() {
        let state = state();
        let mut alice = connect(&state, "alice").await;
        alice.send(message_json("bob", "hi"));
        alice.next_message().await;
        assert_eq!(alice.disconnect().await, SessionEnd::Disconnected);

        let mut alice = connect(&state, "alice").await;
        match alice.next().await {
            OutboundFrame::RecipientList(summary) => {
                assert_eq!(summary.receiver, UserId::from("bob"));
                assert_eq!(summary.last_message.as_deref(), Some("hi"));
                assert!(!summary.is_online);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let _bob = connect(&state, "bob").await;
        loop {
            match alice.next().await {
                OutboundFrame::RecipientList(summary) if summary.is_online => {
                    assert_eq!(summary.receiver, UserId::from("bob"));
                    break;
                }
                OutboundFrame::RecipientList(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_second_connection_replaces_first() {
        let state = state();
        let first = connect(&state, "alice").await;
        let mut second = connect(&state, "alice").await;

        let end = tokio::time::timeout(Duration::from_secs(2), first.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Replaced);
        assert!(first.handle.is_closed());

        let current = state.registry.lookup(&UserId::from("alice")).await.unwrap();
        assert_eq!(current.id(), second.handle.id());

        second.send(message_json("bob", "still here"));
        assert_eq!(second.next_message().await.message, "still here");
    }

    #[tokio::test]
    async fn test_spoofed_sender_closes_session() {
        let state = state();
        let mut alice = connect(&state, "alice").await;

        alice.send(
            serde_json::json!({
                "type": "message",
                "data": { "sender": "bob", "receiver": "carol", "message": "x" }
            })
            .to_string(),
        );
        match alice.next_event().await {
            OutboundFrame::Error(notice) => assert_eq!(notice.code, "unauthorized"),
            other => panic!("unexpected frame: {other:?}"),
        }

        let end = tokio::time::timeout(Duration::from_secs(2), alice.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Unauthorized);
        assert!(!state.registry.is_online(&UserId::from("alice")).await);
    }

    #[tokio::test]
    async fn test_malformed_frames_close_after_tolerance() {
        let state = state();
        let alice = connect(&state, "alice").await;

        for _ in 0..3 {
            alice.send("{\"type\":\"typing\"}".to_string());
        }
        let end = tokio::time::timeout(Duration::from_secs(2), alice.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::PolicyViolation);
        assert_eq!(end.close_frame().0, CLOSE_POLICY_VIOLATION);
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_and_stops_loops() {
        let state = state();
        let mut alice = connect(&state, "alice").await;
        let mut bob = connect(&state, "bob").await;

        alice.send(message_json("bob", "hi"));
        let sent = alice.next_message().await;
        bob.next_message().await;
        assert!(matches!(alice.next_event().await, OutboundFrame::ReceiptUpdate(_)));

        let chat = ChatId::for_pair(&UserId::from("alice"), &UserId::from("bob"));
        bob.send(receipt_json(&chat, "bob", sent.id, "read"));
        wait_for_status(&state, sent.id, MessageStatus::Read).await;
        assert!(matches!(alice.next_event().await, OutboundFrame::ReceiptUpdate(_)));

        let bob_handle = bob.handle.clone();
        assert_eq!(bob.disconnect().await, SessionEnd::Disconnected);
        assert!(bob_handle.is_closed());
        assert!(state.registry.lookup(&UserId::from("bob")).await.is_none());

        // Later messages to Bob wait in the backlog.
        alice.send(message_json("bob", "later"));
        let later = alice.next_message().await;
        assert_eq!(later.status, MessageStatus::Sent);
        assert_eq!(
            state
                .engine
                .store()
                .fetch_backlog(&UserId::from("bob"))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    /// Store that refuses every write.
    struct FailingStore {
        inner: SqliteMessageStore,
    }

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn save(&self, _draft: NewMessage) -> Result<StoredMessage, RelayError> {
            Err(RelayError::StoreUnavailable("disk full".to_string()))
        }
        async fn advance_status(
            &self,
            id: MessageId,
            status: MessageStatus,
        ) -> Result<bool, RelayError> {
            self.inner.advance_status(id, status).await
        }
        async fn fetch_backlog(&self, user: &UserId) -> Result<Vec<StoredMessage>, RelayError> {
            self.inner.fetch_backlog(user).await
        }
        async fn get_message(&self, id: MessageId) -> Result<StoredMessage, RelayError> {
            self.inner.get_message(id).await
        }
        async fn get_chat(&self, id: &ChatId) -> Result<Chat, RelayError> {
            self.inner.get_chat(id).await
        }
        async fn find_chat(&self, a: &UserId, b: &UserId) -> Result<Option<Chat>, RelayError> {
            self.inner.find_chat(a, b).await
        }
        async fn ensure_chat(&self, a: &UserId, b: &UserId) -> Result<Chat, RelayError> {
            self.inner.ensure_chat(a, b).await
        }
        async fn list_chats(&self, user: &UserId) -> Result<Vec<Chat>, RelayError> {
            self.inner.list_chats(user).await
        }
        async fn chat_history(&self, id: &ChatId) -> Result<Vec<StoredMessage>, RelayError> {
            self.inner.chat_history(id).await
        }
        async fn messages_with_status(
            &self,
            chat: &ChatId,
            receiver: &UserId,
            status: MessageStatus,
        ) -> Result<Vec<StoredMessage>, RelayError> {
            self.inner.messages_with_status(chat, receiver, status).await
        }
        async fn block_chat(&self, id: &ChatId, by: &UserId) -> Result<bool, RelayError> {
            self.inner.block_chat(id, by).await
        }
        async fn display_name(&self, user: &UserId) -> Result<String, RelayError> {
            self.inner.display_name(user).await
        }
        async fn set_display_name(
            &self,
            user: &UserId,
            name: Option<String>,
        ) -> Result<(), RelayError> {
            self.inner.set_display_name(user, name).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_reported_and_connection_kept() {
        let state = state_with(Arc::new(FailingStore {
            inner: SqliteMessageStore::new(Database::open_in_memory().unwrap()),
        }));
        let mut alice = connect(&state, "alice").await;
        let mut bob = connect(&state, "bob").await;

        alice.send(message_json("bob", "hi"));
        match alice.next_event().await {
            OutboundFrame::Error(notice) => {
                assert_eq!(notice.code, "store_unavailable");
                assert!(!notice.message.contains("disk full"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        bob.assert_quiet().await;

        assert!(state.registry.is_online(&UserId::from("alice")).await);
        assert_eq!(alice.disconnect().await, SessionEnd::Disconnected);
    }
}
