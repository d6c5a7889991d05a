use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use http::header;
use sha2::{Digest, Sha256};
use soilrepo_contracts::Principal;

mod oidc;
mod session;

pub use oidc::{OidcAuthenticator, OidcConfig};
pub use session::{SessionAuthenticator, SessionRegistry};

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    pub fn required() -> Self {
        Self {
            code: "ERR_AUTH_REQUIRED",
            message: "missing or invalid credentials".to_string(),
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

/// Everything a strategy may look at: request headers and decoded query pairs.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub headers: &'a HeaderMap,
    pub query: &'a HashMap<String, String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    fn mechanism(&self) -> &'static str;

    /// `None` means "not mine or not valid"; the resolver moves on to the next strategy.
    async fn authenticate(&self, creds: &Credentials<'_>) -> Option<Principal>;
}

/// Ordered list of strategies. The first one to produce a principal wins.
#[derive(Clone, Default)]
pub struct AuthResolver {
    strategies: Arc<Vec<Arc<dyn Authenticator>>>,
}

impl AuthResolver {
    pub fn new(strategies: Vec<Arc<dyn Authenticator>>) -> Self {
        Self {
            strategies: Arc::new(strategies),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn mechanisms(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.mechanism()).collect()
    }

    pub async fn resolve(&self, creds: &Credentials<'_>) -> Result<Principal, AuthError> {
        for strategy in self.strategies.iter() {
            if let Some(principal) = strategy.authenticate(creds).await {
                return Ok(principal);
            }
            tracing::debug!(mechanism = strategy.mechanism(), "auth strategy did not match");
        }
        Err(AuthError::required())
    }
}

pub struct ApiKeyAuthenticator {
    expected_digest: [u8; 32],
}

impl ApiKeyAuthenticator {
    /// Returns `None` for a blank secret, which disables the mechanism.
    pub fn new(secret: &str) -> Option<Self> {
        let secret = secret.trim();
        if secret.is_empty() {
            return None;
        }
        Some(Self {
            expected_digest: sha256(secret.as_bytes()),
        })
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    fn mechanism(&self) -> &'static str {
        "api_key"
    }

    async fn authenticate(&self, creds: &Credentials<'_>) -> Option<Principal> {
        let provided = provided_api_key(creds)?;
        let digest = sha256(provided.as_bytes());
        constant_time_eq(&digest, &self.expected_digest).then(Principal::api_key)
    }
}

fn provided_api_key(creds: &Credentials<'_>) -> Option<String> {
    let from_header = creds
        .headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(key) = from_header {
        return Some(key.to_string());
    }

    let from_authz = authorization_value(creds.headers, "ApiKey");
    if let Some(key) = from_authz {
        return Some(key.to_string());
    }

    creds
        .query
        .get("api_key")
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Value of `Authorization: <scheme> <value>`, scheme compared case-insensitively.
pub(crate) fn authorization_value<'h>(headers: &'h HeaderMap, scheme: &str) -> Option<&'h str> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)?;
    let (given_scheme, rest) = authz.split_once(' ')?;
    if !given_scheme.eq_ignore_ascii_case(scheme) {
        return None;
    }
    let rest = rest.trim();
    (!rest.is_empty()).then_some(rest)
}

pub(crate) fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
