/// HMAC-signed short-lived scoped tokens with a revocation list
///
/// Token format: `pgt_<base64url(payload)>.<base64url(tag)>` where the tag is
/// HMAC-SHA256 over the exact payload bytes with the process-wide secret.
/// Validation is constant-time in the tag comparison; revocation is keyed by
/// a fingerprint (first 32 hex chars of SHA-256 of the raw token) so the
/// list never stores the token itself.
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_PREFIX: &str = "pgt_";
/// TTL bounds in seconds.
pub const MIN_TTL_SECS: i64 = 1;
pub const MAX_TTL_SECS: i64 = 86_400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
}

/// The signed claims. Field names are part of the wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScopedClaims {
    pub api_key: String,
    pub issued_at: i64,
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

pub struct ScopedTokenManager {
    secret: Vec<u8>,
    /// fingerprint → token expiry. Entries self-purge once the token they
    /// shadow could no longer validate anyway.
    revoked: Arc<DashMap<String, DateTime<Utc>>>,
}

impl ScopedTokenManager {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            revoked: Arc::new(DashMap::new()),
        }
    }

    /// Issue a token delegating `api_key` for `ttl_secs`, optionally
    /// narrowed to `allowed_tools`. TTL is clamped to [1 s, 86400 s].
    pub fn issue(
        &self,
        api_key: &str,
        ttl_secs: i64,
        allowed_tools: Option<Vec<String>>,
        label: Option<String>,
    ) -> String {
        let ttl = ttl_secs.clamp(MIN_TTL_SECS, MAX_TTL_SECS);
        let now = Utc::now();
        let claims = ScopedClaims {
            api_key: api_key.to_string(),
            issued_at: now.timestamp(),
            expires_at: (now + ChronoDuration::seconds(ttl)).timestamp(),
            allowed_tools,
            label,
        };
        let payload = serde_json::to_vec(&claims).expect("claims always serialize");
        let tag = self.sign(&payload);
        format!(
            "{TOKEN_PREFIX}{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(tag)
        )
    }

    /// Parse, verify in constant time, check expiry, consult the revocation
    /// list. Returns the delegated key and optional tool narrowing.
    pub fn validate(&self, token: &str) -> Result<ScopedClaims, TokenError> {
        let rest = token.strip_prefix(TOKEN_PREFIX).ok_or(TokenError::Malformed)?;
        let (payload_b64, tag_b64) = rest.split_once('.').ok_or(TokenError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| TokenError::Malformed)?;

        let expected = self.sign(&payload);
        if expected.ct_eq(tag.as_slice()).unwrap_u8() != 1 {
            return Err(TokenError::BadSignature);
        }

        let claims: ScopedClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
        if Utc::now().timestamp() >= claims.expires_at {
            return Err(TokenError::Expired);
        }
        if self.is_revoked(token) {
            return Err(TokenError::Revoked);
        }
        Ok(claims)
    }

    /// Revoke by raw token. The entry carries the token's own expiry so it
    /// can be purged once validation would fail on expiry regardless.
    pub fn revoke(&self, token: &str) -> bool {
        let expires_at = match self.peek_expiry(token) {
            Some(ts) => ts,
            // malformed or foreign token: park it for the max TTL
            None => Utc::now() + ChronoDuration::seconds(MAX_TTL_SECS),
        };
        let fp = fingerprint(token);
        let fresh = !self.revoked.contains_key(&fp);
        self.revoked.insert(fp, expires_at);
        fresh
    }

    /// Replica path: a `token_revoked` pub/sub message carries only the
    /// fingerprint.
    pub fn revoke_fingerprint(&self, fp: &str, expires_at: DateTime<Utc>) {
        self.revoked.insert(fp.to_string(), expires_at);
    }

    pub fn is_revoked(&self, token: &str) -> bool {
        let fp = fingerprint(token);
        match self.revoked.get(&fp) {
            Some(entry) => {
                if Utc::now() < *entry {
                    true
                } else {
                    // lazy purge of an entry that outlived its token
                    drop(entry);
                    self.revoked.remove(&fp);
                    false
                }
            }
            None => false,
        }
    }

    pub fn revoked_len(&self) -> usize {
        self.revoked.len()
    }

    /// Periodic purge of revocation entries whose tokens have expired.
    pub fn spawn_purge_task(self: &Arc<Self>, interval: std::time::Duration) {
        let revoked = Arc::clone(&self.revoked);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let now = Utc::now();
                revoked.retain(|_, expires_at| now < *expires_at);
                tracing::debug!("revocation list purge done, {} entries live", revoked.len());
            }
        });
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// Expiry without full validation, for revocation bookkeeping.
    fn peek_expiry(&self, token: &str) -> Option<DateTime<Utc>> {
        let rest = token.strip_prefix(TOKEN_PREFIX)?;
        let (payload_b64, _) = rest.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let claims: ScopedClaims = serde_json::from_slice(&payload).ok()?;
        DateTime::from_timestamp(claims.expires_at, 0)
    }
}

/// First 32 hex chars of SHA-256 over the raw token string.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)[..32].to_string()
}
