//! Signed, time-bounded verification tokens.
//!
//! Wire form is `base64url(json) "." base64url(hmac_sha256(json segment))`,
//! unpadded, so tokens can be embedded in emailed links as-is. The JSON
//! carries the payload and its absolute expiry; nothing is stored
//! server-side.

use std::sync::Arc;
use std::time::Duration;

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::clock::Clock;

type HmacSha256 = Hmac<Sha256>;

const SEPARATOR: char = '.';
const STAMP_LENGTH: usize = 8;

pub type Result<T> = std::result::Result<T, TokenError>;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("token signature does not match")]
    InvalidSignature,
    #[error("token is malformed")]
    Malformed,
    #[error("failed to encode token payload")]
    Encoding(#[source] serde_json::Error),
    #[error("signing key rejected")]
    Key,
}

/// What a token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    EmailVerification,
    PasswordReset,
    DeleteUserConfirmation,
}

/// Payload bound by a token signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationToken {
    #[serde(rename = "t")]
    pub purpose: Purpose,
    #[serde(rename = "u")]
    pub user_id: String,
    #[serde(rename = "e")]
    pub email: String,
    /// Fingerprint of the password hash at issue time, see
    /// [`password_stamp`].
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub stamp: Option<String>,
}

impl VerificationToken {
    pub fn email_verification(user_id: Uuid, email: &str) -> Self {
        Self {
            purpose: Purpose::EmailVerification,
            user_id: user_id.to_string(),
            email: email.to_owned(),
            stamp: None,
        }
    }

    pub fn password_reset(
        user_id: Uuid,
        email: &str,
        password_hash: Option<&str>,
    ) -> Self {
        Self {
            purpose: Purpose::PasswordReset,
            user_id: user_id.to_string(),
            email: email.to_owned(),
            stamp: Some(password_stamp(password_hash)),
        }
    }

    pub fn delete_confirmation(user_id: Uuid, email: &str) -> Self {
        Self {
            purpose: Purpose::DeleteUserConfirmation,
            user_id: user_id.to_string(),
            email: email.to_owned(),
            stamp: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Claims {
    #[serde(flatten)]
    payload: VerificationToken,
    #[serde(rename = "x")]
    expires_at: u64,
}

/// Short fingerprint of a stored password hash.
///
/// Any password change alters it, which voids reset tokens issued before.
pub fn password_stamp(password_hash: Option<&str>) -> String {
    let digest = Sha256::digest(password_hash.unwrap_or_default().as_bytes());
    hex::encode(&digest[..STAMP_LENGTH])
}

/// Issues and checks [`VerificationToken`]s.
#[derive(Clone)]
pub struct VerificationTokens {
    secret: Arc<Zeroizing<Vec<u8>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for VerificationTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationTokens").finish_non_exhaustive()
    }
}

impl VerificationTokens {
    /// Create a new [`VerificationTokens`].
    pub fn new(secret: Zeroizing<Vec<u8>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: Arc::new(secret),
            clock,
        }
    }

    fn mac(&self, segment: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_slice())
            .map_err(|_| TokenError::Key)?;
        mac.update(segment);
        Ok(mac)
    }

    /// Sign `payload`, valid until `now + ttl`.
    pub fn generate(
        &self,
        payload: &VerificationToken,
        ttl: Duration,
    ) -> Result<String> {
        let claims = Claims {
            payload: payload.clone(),
            expires_at: self.clock.now().saturating_add(ttl.as_secs()),
        };
        let json = serde_json::to_vec(&claims).map_err(TokenError::Encoding)?;
        let segment = Base64UrlUnpadded::encode_string(&json);
        let tag = self.mac(segment.as_bytes())?.finalize().into_bytes();

        Ok(format!(
            "{segment}{SEPARATOR}{}",
            Base64UrlUnpadded::encode_string(&tag)
        ))
    }

    /// Check signature then expiry, and return the payload.
    ///
    /// Purpose is not checked here.
    pub fn verify(&self, token: &str) -> Result<VerificationToken> {
        let (segment, tag) =
            token.split_once(SEPARATOR).ok_or(TokenError::Malformed)?;
        let tag =
            Base64UrlUnpadded::decode_vec(tag).map_err(|_| TokenError::Malformed)?;

        self.mac(segment.as_bytes())?
            .verify_slice(&tag)
            .map_err(|_| TokenError::InvalidSignature)?;

        let json = Base64UrlUnpadded::decode_vec(segment)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;

        if self.clock.now() > claims.expires_at {
            return Err(TokenError::Expired);
        }

        Ok(claims.payload)
    }
}
