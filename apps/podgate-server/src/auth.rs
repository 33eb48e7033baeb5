use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

use crate::config::AuthConfig;
use crate::http_client;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingBearer,
    #[error("invalid token")]
    InvalidToken,
    #[error("token verification failed: {0}")]
    Backend(String),
}

impl AuthError {
    /// Wire code. Verifier outages read as a rejected token to the caller.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingBearer => "missing_bearer",
            AuthError::InvalidToken | AuthError::Backend(_) => "invalid_token",
        }
    }
}

/// Resolves a bearer token to a user id.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthUser, AuthError>;
}

/// Extract the token from `Authorization: Bearer <token>`; the scheme is
/// matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

pub async fn authenticate(
    verifier: &dyn TokenVerifier,
    headers: &HeaderMap,
) -> Result<AuthUser, AuthError> {
    let token = bearer_token(headers).ok_or(AuthError::MissingBearer)?;
    verifier.verify(token).await
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Fixed token table, for local deployments and tests.
pub struct StaticTokenVerifier {
    tokens: BTreeMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: BTreeMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        self.tokens
            .iter()
            .find(|(known, _)| ct_eq(known.as_bytes(), token.as_bytes()))
            .map(|(_, user)| AuthUser { id: user.clone() })
            .ok_or(AuthError::InvalidToken)
    }
}

/// Rejects every token. Installed when no verifier is configured.
pub struct DenyAllVerifier;

#[async_trait]
impl TokenVerifier for DenyAllVerifier {
    async fn verify(&self, _token: &str) -> Result<AuthUser, AuthError> {
        Err(AuthError::InvalidToken)
    }
}

/// Hosted auth service exposing `GET /auth/v1/user` (Supabase-compatible).
pub struct RemoteTokenVerifier {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct RemoteUser {
    id: Option<String>,
}

impl RemoteTokenVerifier {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            http: http_client::client_with_timeout(timeout)?,
            url: format!("{}/auth/v1/user", base_url.trim_end_matches('/')),
            api_key,
        })
    }
}

#[async_trait]
impl TokenVerifier for RemoteTokenVerifier {
    async fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        let mut req = self.http.get(&self.url).bearer_auth(token);
        if let Some(key) = &self.api_key {
            req = req.header("apikey", key);
        }
        let resp = req
            .send()
            .await
            .map_err(|err| AuthError::Backend(err.to_string()))?;
        let status = resp.status();
        if status.is_client_error() {
            return Err(AuthError::InvalidToken);
        }
        if !status.is_success() {
            return Err(AuthError::Backend(format!("auth endpoint returned {status}")));
        }
        let user: RemoteUser = resp
            .json()
            .await
            .map_err(|err| AuthError::Backend(err.to_string()))?;
        match user.id.filter(|id| !id.is_empty()) {
            Some(id) => Ok(AuthUser { id }),
            None => Err(AuthError::InvalidToken),
        }
    }
}

/// Pick a verifier from config: remote endpoint first, then the static table.
pub fn verifier_from_config(
    cfg: &AuthConfig,
    timeout: Duration,
) -> reqwest::Result<std::sync::Arc<dyn TokenVerifier>> {
    if let Some(url) = &cfg.url {
        return Ok(std::sync::Arc::new(RemoteTokenVerifier::new(
            url,
            cfg.api_key.clone(),
            timeout,
        )?));
    }
    if !cfg.static_tokens.is_empty() {
        return Ok(std::sync::Arc::new(StaticTokenVerifier::new(
            cfg.static_tokens.clone(),
        )));
    }
    warn!(target: "podgate::auth", "no token verifier configured; all authenticated routes will reject");
    Ok(std::sync::Arc::new(DenyAllVerifier))
}
