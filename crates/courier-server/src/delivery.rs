//! Message delivery engine.
//!
//! Every accepted message is persisted before anything else happens. The
//! sender then gets the stored record back with status `sent`, and if the
//! receiver is online the message is pushed to them and moved to
//! `delivered`. Messages for offline receivers stay `sent` and are flushed,
//! in submission order, the next time the receiver connects.
//!
//! Pushes to one receiver are serialized by the connection's delivery lock,
//! and a message is only pushed by whoever wins the `sent -> delivered`
//! transition in the store. Together these give at-most-once push per
//! message and a receiver-side order that matches submission order.
//!
//! Every status change goes through [`DeliveryEngine::advance`], which holds
//! a per-message lock across the store update and the notice to the sender,
//! so the sender sees `delivered` and `read` in the order they were stored.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use courier_shared::protocol::{MessageView, OutboundFrame, ReceiptNotice, SubmitMessage};
use courier_shared::{ChatId, MessageId, MessageStatus, UserId};
use courier_store::{NewMessage, StoredMessage};

use crate::connection::{ConnectionHandle, DeliveryGuard};
use crate::error::RelayError;
use crate::presence::ConnectionRegistry;
use crate::store::MessageStore;

/// What happened to a message after it was persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Pushed to the receiver and marked `delivered`.
    Delivered,
    /// Receiver offline or unreachable; the message waits in the backlog.
    Queued,
    /// Someone else already delivered it.
    AlreadyDelivered,
}

const STATUS_LOCK_STRIPES: usize = 64;

pub struct DeliveryEngine {
    store: Arc<dyn MessageStore>,
    registry: ConnectionRegistry,
    status_locks: Vec<Mutex<()>>,
}

impl DeliveryEngine {
    pub fn new(store: Arc<dyn MessageStore>, registry: ConnectionRegistry) -> Self {
        Self {
            store,
            registry,
            status_locks: (0..STATUS_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Accept a message submitted on `origin`.
    ///
    /// Fails with `Unauthorized` if the frame names a sender other than the
    /// connection's user, and with `StoreUnavailable` if it could not be
    /// persisted. In both cases nothing is routed.
    pub async fn submit(
        &self,
        origin: &ConnectionHandle,
        submission: SubmitMessage,
    ) -> Result<StoredMessage, RelayError> {
        let sender = origin.user();
        if let Some(claimed) = &submission.sender {
            if claimed != sender {
                warn!(
                    user = %sender,
                    claimed = %claimed,
                    "Sender claim does not match authenticated user"
                );
                return Err(RelayError::Unauthorized(
                    "sender does not match authenticated user".to_string(),
                ));
            }
        }
        if submission.receiver.is_empty() {
            return Err(RelayError::MalformedFrame("empty receiver".to_string()));
        }

        let draft = NewMessage {
            id: MessageId::new(),
            sender: sender.clone(),
            receiver: submission.receiver,
            body: submission.message,
            attachments: submission.attachments,
        };

        let stored = self.store.save(draft).await.map_err(|e| {
            warn!(user = %sender, error = %e, "Failed to persist message");
            e
        })?;

        debug!(
            id = %stored.id,
            sender = %stored.sender,
            receiver = %stored.receiver,
            "Message accepted"
        );

        // Confirmation to the sender always carries the persisted `sent` state.
        origin.send(OutboundFrame::Message(stored.to_view())).await;

        match self.route(&stored).await {
            Ok(outcome) => debug!(id = %stored.id, ?outcome, "Message routed"),
            // Still `sent`, so the backlog picks it up later.
            Err(e) => warn!(id = %stored.id, error = %e, "Live delivery failed"),
        }

        Ok(stored)
    }

    /// Try to hand a persisted message to its receiver right now.
    pub async fn route(&self, stored: &StoredMessage) -> Result<DeliveryOutcome, RelayError> {
        let Some(receiver) = self.registry.lookup(&stored.receiver).await else {
            debug!(id = %stored.id, receiver = %stored.receiver, "Receiver offline, queued");
            return Ok(DeliveryOutcome::Queued);
        };

        let _gate = receiver.lock_delivery().await;
        self.deliver_locked(&receiver, stored).await
    }

    /// Push every queued message for a connection that just came online.
    ///
    /// Takes the delivery guard handed out when the connection was opened,
    /// so live pushes for this receiver wait until the backlog is out.
    pub async fn flush_backlog(
        &self,
        receiver: &ConnectionHandle,
        gate: DeliveryGuard,
    ) -> Result<usize, RelayError> {
        let backlog = self.store.fetch_backlog(receiver.user()).await?;
        if backlog.is_empty() {
            drop(gate);
            return Ok(0);
        }

        let mut delivered = 0;
        for message in &backlog {
            match self.deliver_locked(receiver, message).await? {
                DeliveryOutcome::Delivered => delivered += 1,
                DeliveryOutcome::AlreadyDelivered => {}
                // Connection went away mid-flush; the rest stays queued.
                DeliveryOutcome::Queued => break,
            }
        }
        drop(gate);

        info!(
            user = %receiver.user(),
            pending = backlog.len(),
            delivered,
            "Backlog flushed"
        );
        Ok(delivered)
    }

    /// Claim and push one message. Caller holds the receiver's delivery lock.
    async fn deliver_locked(
        &self,
        receiver: &ConnectionHandle,
        stored: &StoredMessage,
    ) -> Result<DeliveryOutcome, RelayError> {
        // Reserve first: once the status is claimed the push must not fail.
        let Some(permit) = receiver.reserve().await else {
            debug!(id = %stored.id, "Receiver connection closing, queued");
            return Ok(DeliveryOutcome::Queued);
        };

        // The sender learns about `delivered` before the receiver can
        // possibly answer with `read`.
        if self
            .advance(stored, &stored.receiver, MessageStatus::Delivered)
            .await?
            .is_none()
        {
            return Ok(DeliveryOutcome::AlreadyDelivered);
        }

        let view = MessageView {
            status: MessageStatus::Delivered,
            ..stored.to_view()
        };
        permit.send(OutboundFrame::Message(view));

        Ok(DeliveryOutcome::Delivered)
    }

    /// Move `message` forward to `status` on behalf of `actor` and tell the
    /// sender.
    ///
    /// Returns `None` if the message was already at or past `status`,
    /// otherwise whether the notice reached the sender.
    pub async fn advance(
        &self,
        message: &StoredMessage,
        actor: &UserId,
        status: MessageStatus,
    ) -> Result<Option<bool>, RelayError> {
        let stripe = message.id.0.as_u128() % STATUS_LOCK_STRIPES as u128;
        let _order = self.status_locks[stripe as usize].lock().await;

        if !self.store.advance_status(message.id, status).await? {
            return Ok(None);
        }
        // In a self-chat the pushed copy already carries `delivered`.
        if status == MessageStatus::Delivered && message.sender == message.receiver {
            return Ok(Some(false));
        }
        let relayed = self
            .notify_sender(&message.chat_id, message.id, &message.sender, actor, status)
            .await;
        Ok(Some(relayed))
    }

    /// Tell the original sender, if online, that `actor` moved a message to
    /// `status`. Receipt pushes are best effort and never queued.
    async fn notify_sender(
        &self,
        chat_id: &ChatId,
        message_id: MessageId,
        sender: &UserId,
        actor: &UserId,
        status: MessageStatus,
    ) -> bool {
        let Some(connection) = self.registry.lookup(sender).await else {
            debug!(id = %message_id, %status, "Sender offline, receipt not relayed");
            return false;
        };

        connection
            .send(OutboundFrame::ReceiptUpdate(ReceiptNotice {
                chat_id: chat_id.clone(),
                user_id: actor.clone(),
                message_id,
                status,
                stop: false,
            }))
            .await
    }

    /// History of the chat between `viewer` and `other`, oldest first.
    ///
    /// Opening a chat counts as reading it: everything delivered to the
    /// viewer moves to `read`, and the senders are told so.
    pub async fn open_chat(
        &self,
        viewer: &UserId,
        other: &UserId,
    ) -> Result<Vec<MessageView>, RelayError> {
        let chat = match self.store.find_chat(viewer, other).await? {
            Some(chat) => chat,
            None => {
                self.store.ensure_chat(viewer, other).await?;
                return Ok(Vec::new());
            }
        };

        let unread = self
            .store
            .messages_with_status(&chat.id, viewer, MessageStatus::Delivered)
            .await?;
        for message in &unread {
            self.advance(message, viewer, MessageStatus::Read).await?;
        }

        let history = self.store.chat_history(&chat.id).await?;
        Ok(history.iter().map(StoredMessage::to_view).collect())
    }
}
