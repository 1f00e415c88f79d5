use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_shared::protocol::{ErrorNotice, OutboundFrame};
use courier_shared::{ProtocolError, TokenError};
use courier_store::StoreError;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad credential, or a sender claim that does not match the
    /// authenticated identity. Closes the connection.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The acting user is not a participant of the referenced chat or
    /// message. The frame is dropped, the connection stays open.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown frame type or missing required field.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Persistence failed; the submission was not accepted.
    #[error("Message store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Stable code carried by outbound `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Unauthorized(_) => "unauthorized",
            RelayError::Forbidden(_) => "forbidden",
            RelayError::MalformedFrame(_) => "malformed_frame",
            RelayError::StoreUnavailable(_) => "store_unavailable",
            RelayError::NotFound(_) => "not_found",
            RelayError::BadRequest(_) => "bad_request",
            RelayError::Internal(_) => "internal",
        }
    }

    /// Whether this error ends the connection it happened on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Unauthorized(_))
    }

    pub fn to_frame(&self) -> OutboundFrame {
        let message = match self {
            // Do not leak storage internals to clients.
            RelayError::StoreUnavailable(_) => "Failed to send message".to_string(),
            RelayError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        OutboundFrame::Error(ErrorNotice {
            code: self.code().to_string(),
            message,
        })
    }
}

impl From<ProtocolError> for RelayError {
    fn from(e: ProtocolError) -> Self {
        RelayError::MalformedFrame(e.to_string())
    }
}

impl From<TokenError> for RelayError {
    fn from(e: TokenError) -> Self {
        RelayError::Unauthorized(e.to_string())
    }
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => RelayError::NotFound("Record not found".to_string()),
            other => RelayError::StoreUnavailable(other.to_string()),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            RelayError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            RelayError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            RelayError::MalformedFrame(_) | RelayError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            RelayError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            RelayError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Message store unavailable".to_string(),
            ),
            RelayError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_unavailable() {
        let err: RelayError = StoreError::Migration("boom".into()).into();
        assert!(matches!(err, RelayError::StoreUnavailable(_)));

        let err: RelayError = StoreError::NotFound.into();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[test]
    fn test_error_frame_hides_store_detail() {
        let frame = RelayError::StoreUnavailable("disk I/O error at /var/db".into()).to_frame();
        match frame {
            OutboundFrame::Error(notice) => {
                assert_eq!(notice.code, "store_unavailable");
                assert!(!notice.message.contains("/var/db"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_only_unauthorized_is_fatal() {
        assert!(RelayError::Unauthorized("x".into()).is_fatal());
        assert!(!RelayError::Forbidden("x".into()).is_fatal());
        assert!(!RelayError::MalformedFrame("x".into()).is_fatal());
        assert!(!RelayError::StoreUnavailable("x".into()).is_fatal());
    }

    #[test]
    fn test_http_status() {
        let response = RelayError::Unauthorized("bad token".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = RelayError::StoreUnavailable("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
