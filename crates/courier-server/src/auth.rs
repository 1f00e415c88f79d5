//! Connection authentication.
//!
//! The relay resolves a credential to a [`UserId`] once, at connection time.
//! Every frame on that connection then acts as that user.

use chrono::{Duration, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use courier_shared::token::{issue_session_token, verify_session_token};
use courier_shared::UserId;

use crate::error::RelayError;

/// What a client presented when opening a connection.
#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    /// Signed session token.
    Token(&'a str),
    /// Bare user id taken from the URL. Only honoured in trusted setups.
    RawUserId(&'a str),
}

pub trait Authenticator: Send + Sync {
    fn resolve(&self, credential: Credential<'_>) -> Result<UserId, RelayError>;
}

/// Verifies Ed25519-signed session tokens and issues new ones.
pub struct TokenAuthenticator {
    signing_key: SigningKey,
    ttl: Duration,
    allow_raw_user_ids: bool,
}

impl TokenAuthenticator {
    pub fn new(signing_key: SigningKey, ttl_minutes: i64, allow_raw_user_ids: bool) -> Self {
        Self {
            signing_key,
            ttl: Duration::minutes(ttl_minutes),
            allow_raw_user_ids,
        }
    }

    /// Authenticator with a fresh random key. Tokens it issued stop
    /// verifying once the process exits.
    pub fn ephemeral(ttl_minutes: i64, allow_raw_user_ids: bool) -> Self {
        Self::new(SigningKey::generate(&mut OsRng), ttl_minutes, allow_raw_user_ids)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn issue(&self, user: &UserId) -> Result<String, RelayError> {
        let valid_until = Utc::now() + self.ttl;
        Ok(issue_session_token(user, valid_until, &self.signing_key)?)
    }
}

impl Authenticator for TokenAuthenticator {
    fn resolve(&self, credential: Credential<'_>) -> Result<UserId, RelayError> {
        match credential {
            Credential::Token(token) => {
                let claims = verify_session_token(token, &self.verifying_key())?;
                Ok(claims.sub)
            }
            Credential::RawUserId(raw) => {
                if !self.allow_raw_user_ids {
                    return Err(RelayError::Unauthorized(
                        "raw user ids are not accepted".to_string(),
                    ));
                }
                let user = UserId::new(raw.trim());
                if user.is_empty() {
                    return Err(RelayError::Unauthorized("empty user id".to_string()));
                }
                Ok(user)
            }
        }
    }
}
