use thiserror::Error;

/// Errors raised while decoding or validating wire frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token is not in <payload>.<signature> form")]
    Malformed,

    #[error("Token encoding error: {0}")]
    Encoding(String),

    #[error("Token signature does not verify")]
    BadSignature,

    #[error("Token has expired")]
    Expired,

    #[error("Token carries an empty subject")]
    EmptySubject,
}
