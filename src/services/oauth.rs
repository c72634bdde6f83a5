/// OAuth 2.1 provider: dynamic registration, authorization-code + PKCE,
/// refresh rotation, revocation
///
/// Access tokens map 1:1 to an apiKey through the registering client's
/// `api_key_ref`. Token lookups are keyed by SHA-256 of the presented token,
/// so a probe learns nothing about stored tokens from lookup timing.
/// Revocation is immediate and durable (mirrored to the provider snapshot).
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Auth codes are single-use and short-lived.
const CODE_TTL_SECS: i64 = 600;
const ACCESS_TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OAuthError {
    #[error("unknown client")]
    UnknownClient,
    #[error("invalid client secret")]
    BadClientSecret,
    #[error("redirect_uri not registered")]
    BadRedirectUri,
    #[error("code_challenge is required")]
    ChallengeRequired,
    #[error("unsupported code_challenge_method: {0}")]
    BadChallengeMethod(String),
    #[error("invalid or expired authorization code")]
    BadCode,
    #[error("PKCE verification failed")]
    BadVerifier,
    #[error("invalid or expired refresh token")]
    BadRefreshToken,
    #[error("snapshot I/O failed: {0}")]
    Snapshot(String),
}

pub type Result<T> = std::result::Result<T, OAuthError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub scopes: Vec<String>,
    /// The API key every token minted for this client bills against.
    pub api_key_ref: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthCode {
    code: String,
    client_id: String,
    redirect_uri: String,
    scope: String,
    code_challenge: String,
    code_challenge_method: String,
    expires_at: DateTime<Utc>,
    used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub api_key: String,
    pub client_id: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshToken {
    api_key: String,
    client_id: String,
    scope: String,
}

/// What `/oauth/token` returns for both grants.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: String,
    pub scope: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OAuthSnapshot {
    version: u32,
    clients: Vec<OAuthClient>,
    /// token-hash → record; the plaintext token never hits disk for access
    /// tokens (hash is enough to validate a presented token).
    access_tokens: HashMap<String, AccessToken>,
    refresh_tokens: HashMap<String, RefreshToken>,
}

pub struct OAuthProvider {
    clients: DashMap<String, OAuthClient>,
    codes: DashMap<String, AuthCode>,
    /// Keyed by SHA-256 hex of the token string.
    access_tokens: DashMap<String, AccessToken>,
    refresh_tokens: DashMap<String, RefreshToken>,
    snapshot_path: PathBuf,
    dirty: AtomicBool,
}

impl OAuthProvider {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            clients: DashMap::new(),
            codes: DashMap::new(),
            access_tokens: DashMap::new(),
            refresh_tokens: DashMap::new(),
            snapshot_path: snapshot_path.into(),
            dirty: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Dynamic client registration
    // ------------------------------------------------------------------

    pub fn register_client(
        &self,
        client_name: String,
        redirect_uris: Vec<String>,
        scopes: Vec<String>,
        api_key_ref: String,
    ) -> OAuthClient {
        let client = OAuthClient {
            client_id: format!("pgc_{}", random_token(24)),
            client_secret: format!("pgcs_{}", random_token(32)),
            client_name,
            redirect_uris,
            scopes,
            api_key_ref,
            created_at: Utc::now(),
        };
        self.clients.insert(client.client_id.clone(), client.clone());
        self.mark_dirty();
        tracing::info!(client_id = %client.client_id, name = %client.client_name, "oauth client registered");
        client
    }

    pub fn get_client(&self, client_id: &str) -> Option<OAuthClient> {
        self.clients.get(client_id).map(|c| c.clone())
    }

    // ------------------------------------------------------------------
    // Authorization-code grant with PKCE
    // ------------------------------------------------------------------

    /// Issue an authorization code bound to client + redirect_uri +
    /// code_challenge. PKCE is required; S256 preferred, plain allowed.
    pub fn authorize(
        &self,
        client_id: &str,
        redirect_uri: &str,
        scope: &str,
        code_challenge: &str,
        code_challenge_method: &str,
    ) -> Result<String> {
        let client = self
            .clients
            .get(client_id)
            .ok_or(OAuthError::UnknownClient)?;
        if !client.redirect_uris.iter().any(|u| u == redirect_uri) {
            return Err(OAuthError::BadRedirectUri);
        }
        if code_challenge.is_empty() {
            return Err(OAuthError::ChallengeRequired);
        }
        match code_challenge_method {
            "S256" | "plain" => {}
            other => return Err(OAuthError::BadChallengeMethod(other.to_string())),
        }

        let code = format!("pgac_{}", random_token(32));
        self.codes.insert(
            code.clone(),
            AuthCode {
                code: code.clone(),
                client_id: client_id.to_string(),
                redirect_uri: redirect_uri.to_string(),
                scope: scope.to_string(),
                code_challenge: code_challenge.to_string(),
                code_challenge_method: code_challenge_method.to_string(),
                expires_at: Utc::now() + ChronoDuration::seconds(CODE_TTL_SECS),
                used: false,
            },
        );
        Ok(code)
    }

    /// Exchange a code for tokens. The code is consumed even on verifier
    /// failure (single-use).
    pub fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse> {
        let client = self
            .clients
            .get(client_id)
            .ok_or(OAuthError::UnknownClient)?
            .clone();
        if !constant_time_eq(&client.client_secret, client_secret) {
            return Err(OAuthError::BadClientSecret);
        }

        let auth_code = self.codes.remove(code).map(|(_, c)| c).ok_or(OAuthError::BadCode)?;
        if auth_code.used
            || auth_code.client_id != client_id
            || auth_code.redirect_uri != redirect_uri
            || Utc::now() >= auth_code.expires_at
        {
            return Err(OAuthError::BadCode);
        }

        let verified = match auth_code.code_challenge_method.as_str() {
            "S256" => {
                let digest = Sha256::digest(code_verifier.as_bytes());
                let computed = URL_SAFE_NO_PAD.encode(digest);
                constant_time_eq(&computed, &auth_code.code_challenge)
            }
            _ => constant_time_eq(code_verifier, &auth_code.code_challenge),
        };
        if !verified {
            return Err(OAuthError::BadVerifier);
        }

        Ok(self.mint(&client, &auth_code.scope))
    }

    /// Refresh grant. The presented refresh token is rotated out.
    pub fn refresh(&self, client_id: &str, refresh_token: &str) -> Result<TokenResponse> {
        let client = self
            .clients
            .get(client_id)
            .ok_or(OAuthError::UnknownClient)?
            .clone();
        let hash = token_hash(refresh_token);
        let old = self
            .refresh_tokens
            .remove(&hash)
            .map(|(_, t)| t)
            .ok_or(OAuthError::BadRefreshToken)?;
        if old.client_id != client_id {
            return Err(OAuthError::BadRefreshToken);
        }
        let scope = old.scope.clone();
        Ok(self.mint(&client, &scope))
    }

    fn mint(&self, client: &OAuthClient, scope: &str) -> TokenResponse {
        let access_token = format!("pgo_{}", random_token(40));
        let refresh_token = format!("pgr_{}", random_token(40));

        self.access_tokens.insert(
            token_hash(&access_token),
            AccessToken {
                api_key: client.api_key_ref.clone(),
                client_id: client.client_id.clone(),
                scope: scope.to_string(),
                expires_at: Utc::now() + ChronoDuration::seconds(ACCESS_TOKEN_TTL_SECS),
            },
        );
        self.refresh_tokens.insert(
            token_hash(&refresh_token),
            RefreshToken {
                api_key: client.api_key_ref.clone(),
                client_id: client.client_id.clone(),
                scope: scope.to_string(),
            },
        );
        self.mark_dirty();

        TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: ACCESS_TOKEN_TTL_SECS,
            refresh_token,
            scope: scope.to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Validation / revocation
    // ------------------------------------------------------------------

    /// Resolve a bearer token to the apiKey it bills against.
    pub fn validate(&self, token: &str) -> Option<AccessToken> {
        let hash = token_hash(token);
        let entry = self.access_tokens.get(&hash)?;
        if Utc::now() >= entry.expires_at {
            drop(entry);
            self.access_tokens.remove(&hash);
            self.mark_dirty();
            return None;
        }
        Some(entry.clone())
    }

    /// Revoke either token kind. Effective immediately and durable.
    pub fn revoke_token(&self, token: &str) -> bool {
        let hash = token_hash(token);
        let removed = self.access_tokens.remove(&hash).is_some()
            | self.refresh_tokens.remove(&hash).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// Drop expired codes and tokens. Called from a background timer.
    pub fn purge_expired(&self) {
        let now = Utc::now();
        self.codes.retain(|_, c| now < c.expires_at);
        let before = self.access_tokens.len();
        self.access_tokens.retain(|_, t| now < t.expires_at);
        if self.access_tokens.len() != before {
            self.mark_dirty();
        }
    }

    pub fn spawn_purge_task(self: &Arc<Self>, interval: std::time::Duration) {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                provider.purge_expired();
                if let Err(e) = provider.flush_if_dirty() {
                    tracing::error!("oauth snapshot flush failed: {e}");
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Persistence (companion snapshot, same directory as the key store)
    // ------------------------------------------------------------------

    pub fn snapshot_save(&self) -> Result<()> {
        let snapshot = OAuthSnapshot {
            version: 1,
            clients: self.clients.iter().map(|c| c.clone()).collect(),
            access_tokens: self
                .access_tokens
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            refresh_tokens: self
                .refresh_tokens
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| OAuthError::Snapshot(e.to_string()))?;
        if let Some(dir) = self.snapshot_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| OAuthError::Snapshot(e.to_string()))?;
        }
        let tmp = self.snapshot_path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| OAuthError::Snapshot(e.to_string()))?;
        std::fs::rename(&tmp, &self.snapshot_path)
            .map_err(|e| OAuthError::Snapshot(e.to_string()))?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    pub fn flush_if_dirty(&self) -> Result<()> {
        if self.dirty.load(Ordering::Acquire) {
            self.snapshot_save()?;
        }
        Ok(())
    }

    pub fn snapshot_load(&self) -> Result<usize> {
        if !Path::new(&self.snapshot_path).exists() {
            return Ok(0);
        }
        let bytes =
            std::fs::read(&self.snapshot_path).map_err(|e| OAuthError::Snapshot(e.to_string()))?;
        let snapshot: OAuthSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| OAuthError::Snapshot(e.to_string()))?;
        let count = snapshot.clients.len();
        for client in snapshot.clients {
            self.clients.insert(client.client_id.clone(), client);
        }
        for (hash, token) in snapshot.access_tokens {
            self.access_tokens.insert(hash, token);
        }
        for (hash, token) in snapshot.refresh_tokens {
            self.refresh_tokens.insert(hash, token);
        }
        Ok(count)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).unwrap_u8() == 1
}

fn random_token(len: usize) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OAuthProvider {
        OAuthProvider::new(
            std::env::temp_dir().join(format!("paygate-oauth-{}.json", random_token(8))),
        )
    }

    fn registered(provider: &OAuthProvider) -> OAuthClient {
        provider.register_client(
            "test app".into(),
            vec!["https://app.example/cb".into()],
            vec!["tools".into()],
            "pg_backing_key".into(),
        )
    }

    fn s256_challenge(verifier: &str) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
    }

    #[test]
    fn test_full_code_flow_s256() {
        let provider = provider();
        let client = registered(&provider);
        let verifier = "correct-horse-battery-staple-verifier";

        let code = provider
            .authorize(
                &client.client_id,
                "https://app.example/cb",
                "tools",
                &s256_challenge(verifier),
                "S256",
            )
            .unwrap();

        let tokens = provider
            .exchange_code(
                &client.client_id,
                &client.client_secret,
                &code,
                "https://app.example/cb",
                verifier,
            )
            .unwrap();
        assert!(tokens.access_token.starts_with("pgo_"));
        assert_eq!(tokens.token_type, "Bearer");

        let access = provider.validate(&tokens.access_token).unwrap();
        assert_eq!(access.api_key, "pg_backing_key");
        assert_eq!(access.scope, "tools");
    }

    #[test]
    fn test_code_is_single_use() {
        let provider = provider();
        let client = registered(&provider);
        let code = provider
            .authorize(
                &client.client_id,
                "https://app.example/cb",
                "tools",
                "plainchallenge",
                "plain",
            )
            .unwrap();

        provider
            .exchange_code(
                &client.client_id,
                &client.client_secret,
                &code,
                "https://app.example/cb",
                "plainchallenge",
            )
            .unwrap();
        let again = provider.exchange_code(
            &client.client_id,
            &client.client_secret,
            &code,
            "https://app.example/cb",
            "plainchallenge",
        );
        assert_eq!(again, Err(OAuthError::BadCode));
    }

    #[test]
    fn test_pkce_mismatch_rejected() {
        let provider = provider();
        let client = registered(&provider);
        let code = provider
            .authorize(
                &client.client_id,
                "https://app.example/cb",
                "tools",
                &s256_challenge("real-verifier"),
                "S256",
            )
            .unwrap();
        let out = provider.exchange_code(
            &client.client_id,
            &client.client_secret,
            &code,
            "https://app.example/cb",
            "wrong-verifier",
        );
        assert_eq!(out, Err(OAuthError::BadVerifier));
    }

    #[test]
    fn test_challenge_required_and_redirect_checked() {
        let provider = provider();
        let client = registered(&provider);
        assert_eq!(
            provider.authorize(&client.client_id, "https://app.example/cb", "t", "", "S256"),
            Err(OAuthError::ChallengeRequired)
        );
        assert_eq!(
            provider.authorize(&client.client_id, "https://evil.example/cb", "t", "c", "S256"),
            Err(OAuthError::BadRedirectUri)
        );
        assert!(matches!(
            provider.authorize(&client.client_id, "https://app.example/cb", "t", "c", "md5"),
            Err(OAuthError::BadChallengeMethod(_))
        ));
    }

    #[test]
    fn test_refresh_rotates() {
        let provider = provider();
        let client = registered(&provider);
        let code = provider
            .authorize(
                &client.client_id,
                "https://app.example/cb",
                "tools",
                "c",
                "plain",
            )
            .unwrap();
        let first = provider
            .exchange_code(
                &client.client_id,
                &client.client_secret,
                &code,
                "https://app.example/cb",
                "c",
            )
            .unwrap();

        let second = provider
            .refresh(&client.client_id, &first.refresh_token)
            .unwrap();
        assert_ne!(second.access_token, first.access_token);
        // the old refresh token is gone
        assert_eq!(
            provider.refresh(&client.client_id, &first.refresh_token),
            Err(OAuthError::BadRefreshToken)
        );
    }

    #[test]
    fn test_revocation_is_immediate() {
        let provider = provider();
        let client = registered(&provider);
        let code = provider
            .authorize(
                &client.client_id,
                "https://app.example/cb",
                "tools",
                "c",
                "plain",
            )
            .unwrap();
        let tokens = provider
            .exchange_code(
                &client.client_id,
                &client.client_secret,
                &code,
                "https://app.example/cb",
                "c",
            )
            .unwrap();

        assert!(provider.revoke_token(&tokens.access_token));
        assert!(provider.validate(&tokens.access_token).is_none());
        assert!(!provider.revoke_token(&tokens.access_token));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth.json");
        let provider = OAuthProvider::new(&path);
        let client = registered(&provider);
        let code = provider
            .authorize(
                &client.client_id,
                "https://app.example/cb",
                "tools",
                "c",
                "plain",
            )
            .unwrap();
        let tokens = provider
            .exchange_code(
                &client.client_id,
                &client.client_secret,
                &code,
                "https://app.example/cb",
                "c",
            )
            .unwrap();
        provider.snapshot_save().unwrap();

        let restored = OAuthProvider::new(&path);
        assert_eq!(restored.snapshot_load().unwrap(), 1);
        assert!(restored.get_client(&client.client_id).is_some());
        assert!(restored.validate(&tokens.access_token).is_some());
    }
}
