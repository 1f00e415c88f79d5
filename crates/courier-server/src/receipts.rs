//! Receipt update loops.
//!
//! Each connection runs one task per chat it reports receipts for. A task
//! applies `delivered`/`read` updates in arrival order and relays accepted
//! transitions to the message's sender. A `stop` frame closes the chat's
//! queue: receipts accepted before it are still applied and relayed, later
//! ones for that chat on the same connection are ignored until the client
//! reconnects. Closing the connection cancels every task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_shared::protocol::ReceiptUpdate;
use courier_shared::{ChatId, MessageStatus, UserId};

use crate::connection::ConnectionHandle;
use crate::delivery::DeliveryEngine;
use crate::error::RelayError;

const LOOP_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// Status moved forward and the sender was notified if online.
    Applied { relayed: bool },
    /// Message was already at or past the reported status.
    Unchanged,
}

/// Validates and applies a single receipt on behalf of an acting user.
pub struct ReceiptProcessor {
    engine: Arc<DeliveryEngine>,
}

impl ReceiptProcessor {
    pub fn new(engine: Arc<DeliveryEngine>) -> Self {
        Self { engine }
    }

    pub async fn apply(
        &self,
        actor: &UserId,
        update: &ReceiptUpdate,
    ) -> Result<ReceiptOutcome, RelayError> {
        let (Some(message_id), Some(status)) = (update.message_id, update.status) else {
            return Err(RelayError::MalformedFrame(
                "receipt needs message_id and status".to_string(),
            ));
        };
        if status == MessageStatus::Sent {
            return Err(RelayError::MalformedFrame(
                "sent is not a receipt status".to_string(),
            ));
        }
        if &update.user_id != actor {
            return Err(RelayError::Forbidden(
                "receipt must be reported by the connected user".to_string(),
            ));
        }

        let store = self.engine.store();
        // Unknown chats and messages are reported the same way as foreign
        // ones.
        let chat = store.get_chat(&update.chat_id).await.map_err(forbid_missing)?;
        if !chat.has_participant(actor) {
            return Err(RelayError::Forbidden("not a participant of this chat".to_string()));
        }
        let message = store.get_message(message_id).await.map_err(forbid_missing)?;
        if message.chat_id != chat.id || &message.receiver != actor {
            return Err(RelayError::Forbidden(
                "only the receiver can report receipts for a message".to_string(),
            ));
        }

        match self.engine.advance(&message, actor, status).await? {
            Some(relayed) => Ok(ReceiptOutcome::Applied { relayed }),
            None => {
                debug!(id = %message_id, %status, "Receipt does not advance status, ignored");
                Ok(ReceiptOutcome::Unchanged)
            }
        }
    }
}

fn forbid_missing(e: RelayError) -> RelayError {
    match e {
        RelayError::NotFound(_) => RelayError::Forbidden("unknown chat or message".to_string()),
        other => other,
    }
}

struct LoopHandle {
    updates: mpsc::Sender<ReceiptUpdate>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// The receipt loops owned by one connection.
pub struct ReceiptLoops {
    connection: ConnectionHandle,
    processor: Arc<ReceiptProcessor>,
    loops: HashMap<ChatId, LoopHandle>,
    stopped: HashSet<ChatId>,
    /// Stopped loops still working through receipts queued before the stop.
    draining: Vec<(ChatId, CancellationToken, JoinHandle<()>)>,
}

impl ReceiptLoops {
    pub fn new(connection: ConnectionHandle, processor: Arc<ReceiptProcessor>) -> Self {
        Self {
            connection,
            processor,
            loops: HashMap::new(),
            stopped: HashSet::new(),
            draining: Vec::new(),
        }
    }

    /// Route one inbound receipt frame to its chat's loop.
    pub async fn handle(&mut self, update: ReceiptUpdate) -> Result<(), RelayError> {
        if &update.user_id != self.connection.user() {
            return Err(RelayError::Forbidden(
                "receipt must be reported by the connected user".to_string(),
            ));
        }

        let chat_id = update.chat_id.clone();
        if update.stop {
            self.stop(&chat_id);
            return Ok(());
        }
        if self.stopped.contains(&chat_id) {
            debug!(chat = %chat_id, "Receipt for stopped chat dropped");
            return Ok(());
        }

        // A loop whose task already ended is replaced.
        if self
            .loops
            .get(&chat_id)
            .is_some_and(|l| l.task.is_finished())
        {
            self.loops.remove(&chat_id);
        }

        let handle = self
            .loops
            .entry(chat_id.clone())
            .or_insert_with(|| spawn_loop(chat_id, &self.connection, &self.processor));

        handle
            .updates
            .send(update)
            .await
            .map_err(|_| RelayError::Internal("receipt loop is gone".to_string()))
    }

    /// Close the loop for `chat_id` and ignore further receipts for it.
    ///
    /// Receipts already queued are applied before the loop ends.
    pub fn stop(&mut self, chat_id: &ChatId) {
        self.stopped.insert(chat_id.clone());
        self.draining.retain(|(_, _, task)| !task.is_finished());
        if let Some(LoopHandle {
            updates,
            token,
            task,
        }) = self.loops.remove(chat_id)
        {
            // Closing the channel lets the loop drain what is queued and end.
            drop(updates);
            self.draining.push((chat_id.clone(), token, task));
            info!(
                user = %self.connection.user(),
                chat = %chat_id,
                "Receipt loop stopped by client"
            );
        }
    }

    pub fn active(&self) -> usize {
        self.loops
            .values()
            .filter(|l| !l.token.is_cancelled() && !l.task.is_finished())
            .count()
    }

    /// Cancel every loop and wait for them to finish. Loops still running
    /// after `grace` are aborted.
    pub async fn shutdown(mut self, grace: Duration) {
        let tasks: Vec<_> = self
            .loops
            .drain()
            .map(|(chat_id, handle)| (chat_id, handle.token, handle.task))
            .chain(self.draining.drain(..))
            .collect();
        for (_, token, _) in &tasks {
            token.cancel();
        }

        for (chat_id, _, mut task) in tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(chat = %chat_id, "Receipt loop did not stop in time, aborting");
                task.abort();
                let _ = task.await;
            }
        }
    }
}

fn spawn_loop(
    chat_id: ChatId,
    connection: &ConnectionHandle,
    processor: &Arc<ReceiptProcessor>,
) -> LoopHandle {
    let (updates, rx) = mpsc::channel(LOOP_QUEUE_CAPACITY);
    let token = connection.child_token();
    let task = tokio::spawn(run_loop(
        chat_id,
        connection.clone(),
        processor.clone(),
        token.clone(),
        rx,
    ));
    LoopHandle {
        updates,
        token,
        task,
    }
}

async fn run_loop(
    chat_id: ChatId,
    connection: ConnectionHandle,
    processor: Arc<ReceiptProcessor>,
    token: CancellationToken,
    mut updates: mpsc::Receiver<ReceiptUpdate>,
) {
    let actor = connection.user().clone();
    debug!(user = %actor, chat = %chat_id, "Receipt loop started");

    loop {
        let update = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            update = updates.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        // Once dequeued, a receipt is carried through so a committed status
        // change is always relayed.
        match processor.apply(&actor, &update).await {
            Ok(outcome) => debug!(chat = %chat_id, ?outcome, "Receipt processed"),
            Err(e) => {
                warn!(user = %actor, chat = %chat_id, error = %e, "Receipt rejected");
                if !token.is_cancelled() {
                    connection.send(e.to_frame()).await;
                }
            }
        }
    }

    debug!(user = %actor, chat = %chat_id, "Receipt loop finished");
}
