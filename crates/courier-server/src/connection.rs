//! Handle to one live client connection.
//!
//! A [`ConnectionHandle`] is bound to exactly one user for its lifetime and
//! owns the sending half of that connection's outbound frame queue. Handles
//! are cheap to clone; every clone refers to the same connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;
use uuid::Uuid;

use courier_shared::protocol::OutboundFrame;
use courier_shared::UserId;

/// How long a push may wait on a full outbound queue before the frame is
/// dropped.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Held while messages are being pushed to a connection. The guard returned
/// by [`ConnectionHandle::open`] is taken before the handle is visible to
/// anyone else, so the backlog flush always runs before any live push.
pub type DeliveryGuard = OwnedMutexGuard<()>;

#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user: UserId,
    outbound: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
    delivery: Arc<Mutex<()>>,
}

impl ConnectionHandle {
    /// Create a connection for `user` with an outbound queue of `capacity`.
    ///
    /// Returns the handle, the receiving half of the queue (owned by the
    /// socket writer), and the already-held delivery guard.
    pub fn open(
        user: UserId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<OutboundFrame>, DeliveryGuard) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let delivery = Arc::new(Mutex::new(()));
        // Freshly created, so the lock is free.
        let guard = match delivery.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => unreachable!("new mutex cannot be locked"),
        };

        let handle = Self {
            id: ConnectionId(Uuid::new_v4()),
            user,
            outbound,
            cancel: CancellationToken::new(),
            delivery,
        };
        (handle, rx, guard)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// A connection is live until it is closed or its writer goes away.
    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }

    /// Queue a frame. Returns `false` if the connection is gone or the
    /// queue stayed full for longer than the send timeout.
    pub async fn send(&self, frame: OutboundFrame) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.outbound.send_timeout(frame, SEND_TIMEOUT).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(frame)) => {
                warn!(
                    user = %self.user,
                    connection = %self.id,
                    kind = frame.kind(),
                    "Outbound queue full, dropping frame"
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }

    /// Reserve a queue slot so a later push cannot fail. `None` means the
    /// connection can no longer receive frames.
    pub async fn reserve(&self) -> Option<mpsc::Permit<'_, OutboundFrame>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::time::timeout(SEND_TIMEOUT, self.outbound.reserve())
            .await
            .ok()?
            .ok()
    }

    /// Serialize pushes of chat messages to this connection.
    pub async fn lock_delivery(&self) -> DeliveryGuard {
        self.delivery.clone().lock_owned().await
    }

    /// Ask every task scoped to this connection to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Token for a task owned by this connection; cancelled when the
    /// connection closes, and cancellable on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("live", &self.is_live())
            .finish()
    }
}
