//! Signed session tokens.
//!
//! A token is `base64url(claims_json) "." base64url(ed25519_signature)`.
//! The relay verifies tokens with the issuer's public key and never needs
//! to consult a token database.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::types::UserId;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Authenticated user
    pub sub: UserId,
    /// Expiry instant
    pub exp: DateTime<Utc>,
}

/// Issue a token for `user` valid until `valid_until`.
pub fn issue_session_token(
    user: &UserId,
    valid_until: DateTime<Utc>,
    signing_key: &SigningKey,
) -> Result<String, TokenError> {
    if user.is_empty() {
        return Err(TokenError::EmptySubject);
    }

    let claims = SessionClaims {
        sub: user.clone(),
        exp: valid_until,
    };
    let payload =
        serde_json::to_vec(&claims).map_err(|e| TokenError::Encoding(e.to_string()))?;
    let signature = signing_key.sign(&payload);

    Ok(format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&payload),
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// Verify a token against the issuer key and return its claims.
pub fn verify_session_token(
    token: &str,
    issuer: &VerifyingKey,
) -> Result<SessionClaims, TokenError> {
    let token = token.trim();
    let token = token.strip_prefix("Bearer ").unwrap_or(token);

    let (payload_b64, signature_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|e| TokenError::Encoding(e.to_string()))?;
    let signature_bytes = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|e| TokenError::Encoding(e.to_string()))?;

    let signature = Signature::from_slice(&signature_bytes).map_err(|_| TokenError::Malformed)?;
    issuer
        .verify(&payload, &signature)
        .map_err(|_| TokenError::BadSignature)?;

    let claims: SessionClaims =
        serde_json::from_slice(&payload).map_err(|e| TokenError::Encoding(e.to_string()))?;

    if Utc::now() > claims.exp {
        return Err(TokenError::Expired);
    }
    if claims.sub.is_empty() {
        return Err(TokenError::EmptySubject);
    }

    Ok(claims)
}
