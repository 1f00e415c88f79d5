//! Inbound frame dispatch for one connection.
//!
//! Decodes each text frame, routes chat messages to the delivery engine and
//! receipts to the connection's receipt loops, and reports failures back to
//! the client as `error` frames. Malformed or flooding frames are counted;
//! once the count passes the configured tolerance the connection is closed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use courier_shared::protocol::InboundFrame;

use crate::connection::ConnectionHandle;
use crate::delivery::DeliveryEngine;
use crate::error::RelayError;
use crate::rate_limit::TokenBucket;
use crate::receipts::{ReceiptLoops, ReceiptProcessor};

/// Why the dispatcher wants the connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Too many malformed or rate-limited frames.
    PolicyViolation,
    /// The client tried to act as someone else.
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close(CloseReason),
}

pub struct Dispatcher {
    connection: ConnectionHandle,
    engine: Arc<DeliveryEngine>,
    receipts: ReceiptLoops,
    flood: TokenBucket,
    tolerance: u32,
    violations: u32,
}

impl Dispatcher {
    pub fn new(
        connection: ConnectionHandle,
        engine: Arc<DeliveryEngine>,
        processor: Arc<ReceiptProcessor>,
        flood: TokenBucket,
        tolerance: u32,
    ) -> Self {
        let receipts = ReceiptLoops::new(connection.clone(), processor);
        Self {
            connection,
            engine,
            receipts,
            flood,
            tolerance,
            violations: 0,
        }
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    pub async fn on_text(&mut self, text: &str) -> Flow {
        if !self.flood.try_take() {
            return self
                .violation(RelayError::MalformedFrame("too many frames".to_string()))
                .await;
        }

        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => return self.violation(e.into()).await,
        };
        debug!(user = %self.connection.user(), kind = frame.kind(), "Inbound frame");

        let result = match frame {
            InboundFrame::Message(submission) => self
                .engine
                .submit(&self.connection, submission)
                .await
                .map(|_| ()),
            InboundFrame::ReceiptUpdate(update) => self.receipts.handle(update).await,
        };

        match result {
            Ok(()) => Flow::Continue,
            Err(e) if e.is_fatal() => {
                self.connection.send(e.to_frame()).await;
                Flow::Close(CloseReason::Unauthorized)
            }
            Err(e @ RelayError::MalformedFrame(_)) => self.violation(e).await,
            Err(e) => {
                self.connection.send(e.to_frame()).await;
                Flow::Continue
            }
        }
    }

    /// Binary frames are accepted if they carry UTF-8 JSON.
    pub async fn on_binary(&mut self, bytes: &[u8]) -> Flow {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.on_text(text).await,
            Err(_) => {
                self.violation(RelayError::MalformedFrame("binary frame is not UTF-8".to_string()))
                    .await
            }
        }
    }

    async fn violation(&mut self, error: RelayError) -> Flow {
        self.violations += 1;
        warn!(
            user = %self.connection.user(),
            violations = self.violations,
            tolerance = self.tolerance,
            error = %error,
            "Rejected inbound frame"
        );
        self.connection.send(error.to_frame()).await;

        if self.violations > self.tolerance {
            Flow::Close(CloseReason::PolicyViolation)
        } else {
            Flow::Continue
        }
    }

    /// Stop all receipt loops owned by this connection.
    pub async fn shutdown(self, grace: Duration) {
        self.receipts.shutdown(grace).await;
    }
}
