use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use serde_json::Value;
use soilrepo_contracts::Principal;
use tokio::sync::RwLock;

use crate::{AuthError, Authenticator, Credentials, authorization_value};

const ALLOWED_ALGORITHMS: [Algorithm; 3] = [Algorithm::RS256, Algorithm::PS256, Algorithm::ES256];
const KID_MISS_REFRESH_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub audience: Option<String>,
    pub client_id: Option<String>,
    pub jwks_url: Option<String>,
    pub jwks_json: Option<String>,
    pub jwks_timeout: Duration,
    pub jwks_refresh_ttl: Duration,
    pub clock_skew: Duration,
}

#[derive(Clone)]
pub struct OidcAuthenticator {
    config: OidcConfig,
    http: reqwest::Client,
    jwks: Arc<RwLock<JwksCache>>,
}

#[derive(Debug, Default)]
struct JwksCache {
    jwks: Option<JwkSet>,
    discovered_issuer: Option<String>,
    fetched_at: Option<Instant>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: Option<String>,
    jwks_uri: Option<String>,
}

impl OidcAuthenticator {
    /// Keys are not fetched here; the cache fills on the first bearer token it sees.
    pub fn new(config: OidcConfig) -> Result<Self, AuthError> {
        if config.issuer.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "oidc issuer must be non-empty".to_string(),
            });
        }

        if let Some(jwks_json) = config.jwks_json.as_ref()
            && serde_json::from_str::<JwkSet>(jwks_json).is_err()
        {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "SOILREPO_OIDC_JWKS_JSON is not valid JWKS JSON".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(config.jwks_timeout)
            .build()
            .map_err(|_| AuthError {
                code: "ERR_INTERNAL",
                message: "failed to initialize oidc http client".to_string(),
            })?;

        Ok(Self {
            config,
            http,
            jwks: Arc::new(RwLock::new(JwksCache::default())),
        })
    }

    /// Validates the token and returns its claims.
    pub async fn verify(&self, token: &str) -> Result<Value, AuthError> {
        let header = decode_header(token).map_err(|_| invalid("invalid JWT header"))?;

        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(invalid("unsupported JWT alg"));
        }

        let kid = header.kid.ok_or_else(|| invalid("JWT header missing kid"))?;
        let (decoding_key, issuer) = self.decoding_key_for_kid(&kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.validate_aud = false;
        validation.leeway = self.config.clock_skew.as_secs();

        let claims = decode::<Value>(token, &decoding_key, &validation)
            .map_err(|_| invalid("JWT validation failed"))?
            .claims;

        if claims.get("iat").is_none() {
            return Err(invalid("JWT missing iat"));
        }

        if !audience_matches(
            &claims,
            self.config.audience.as_deref(),
            self.config.client_id.as_deref(),
        ) {
            return Err(invalid("JWT audience mismatch"));
        }

        Ok(claims)
    }

    async fn decoding_key_for_kid(&self, kid: &str) -> Result<(DecodingKey, String), AuthError> {
        let ttl = self.config.jwks_refresh_ttl;

        {
            let cache = self.jwks.read().await;
            if !cache.is_stale(ttl)
                && let Some(jwk) = cache.jwk_for_kid(kid)
            {
                return Ok((key_from_jwk(jwk)?, self.issuer(&cache)));
            }
        }

        let mut cache = self.jwks.write().await;

        // Another request may have refreshed while we waited for the lock.
        if !cache.is_stale(ttl)
            && let Some(jwk) = cache.jwk_for_kid(kid)
        {
            return Ok((key_from_jwk(jwk)?, self.issuer(&cache)));
        }

        let cooldown_elapsed = cache
            .fetched_at
            .map(|t| t.elapsed() >= KID_MISS_REFRESH_COOLDOWN)
            .unwrap_or(true);

        if cache.is_stale(ttl) || cooldown_elapsed {
            match cache.refresh(&self.http, &self.config).await {
                Ok(()) => {
                    tracing::info!(
                        keys = cache.jwks.as_ref().map(|s| s.keys.len()).unwrap_or(0),
                        "jwks refreshed"
                    );
                }
                Err(err) => {
                    tracing::warn!(code = err.code, error = %err.message, "jwks refresh failed");
                    if cache.jwks.is_none() {
                        return Err(err);
                    }
                }
            }
        }

        match cache.jwk_for_kid(kid) {
            Some(jwk) => Ok((key_from_jwk(jwk)?, self.issuer(&cache))),
            None => Err(invalid("JWT kid not found in JWKS")),
        }
    }

    fn issuer(&self, cache: &JwksCache) -> String {
        cache
            .discovered_issuer
            .clone()
            .unwrap_or_else(|| self.config.issuer.clone())
    }
}

#[async_trait]
impl Authenticator for OidcAuthenticator {
    fn mechanism(&self) -> &'static str {
        "bearer"
    }

    async fn authenticate(&self, creds: &Credentials<'_>) -> Option<Principal> {
        let token = authorization_value(creds.headers, "Bearer")?;
        match self.verify(token).await {
            Ok(claims) => {
                let subject = claim_string(&claims, "sub")
                    .or_else(|| claim_string(&claims, "preferred_username"));
                Some(Principal::bearer(subject))
            }
            Err(err) => {
                tracing::debug!(code = err.code, reason = %err.message, "bearer token rejected");
                None
            }
        }
    }
}

impl JwksCache {
    fn jwk_for_kid(&self, kid: &str) -> Option<&Jwk> {
        self.jwks.as_ref()?.find(kid)
    }

    fn is_stale(&self, ttl: Duration) -> bool {
        self.fetched_at.map(|t| t.elapsed() > ttl).unwrap_or(true)
    }

    async fn refresh(
        &mut self,
        http: &reqwest::Client,
        config: &OidcConfig,
    ) -> Result<(), AuthError> {
        let jwks = if let Some(jwks_json) = config.jwks_json.as_ref() {
            serde_json::from_str::<JwkSet>(jwks_json).map_err(|_| AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "SOILREPO_OIDC_JWKS_JSON is not valid JWKS JSON".to_string(),
            })?
        } else {
            let url = match config.jwks_url.as_ref() {
                Some(url) => url.clone(),
                None => {
                    let discovery = discover(http, &config.issuer).await?;
                    if let Some(issuer) = discovery.issuer.filter(|s| !s.trim().is_empty()) {
                        self.discovered_issuer = Some(issuer);
                    }
                    discovery.jwks_uri.ok_or_else(|| AuthError {
                        code: "ERR_AUTH_UNAVAILABLE",
                        message: "discovery document has no jwks_uri".to_string(),
                    })?
                }
            };
            fetch_json::<JwkSet>(http, &url).await?
        };

        self.jwks = Some(jwks);
        self.fetched_at = Some(Instant::now());
        Ok(())
    }
}

async fn discover(http: &reqwest::Client, issuer: &str) -> Result<DiscoveryDocument, AuthError> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    fetch_json::<DiscoveryDocument>(http, &url).await
}

async fn fetch_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> Result<T, AuthError> {
    http.get(url)
        .send()
        .await
        .map_err(|_| unavailable(format!("failed to fetch {}", url)))?
        .error_for_status()
        .map_err(|_| unavailable(format!("{} returned non-success status", url)))?
        .json::<T>()
        .await
        .map_err(|_| unavailable(format!("failed to parse JSON from {}", url)))
}

fn key_from_jwk(jwk: &Jwk) -> Result<DecodingKey, AuthError> {
    DecodingKey::from_jwk(jwk).map_err(|_| invalid("failed to parse JWK decoding key"))
}

fn invalid(message: &str) -> AuthError {
    AuthError {
        code: "ERR_AUTH_INVALID",
        message: message.to_string(),
    }
}

fn unavailable(message: String) -> AuthError {
    AuthError {
        code: "ERR_AUTH_UNAVAILABLE",
        message,
    }
}

fn audience_matches(claims: &Value, audience: Option<&str>, client_id: Option<&str>) -> bool {
    let aud = claim_string_vec(claims, "aud");
    let azp_is_client = match (claims.get("azp").and_then(Value::as_str), client_id) {
        (Some(azp), Some(client_id)) => azp == client_id,
        _ => false,
    };

    match (audience, client_id) {
        (None, None) => true,
        (Some(audience), _) => aud.iter().any(|a| a == audience) || azp_is_client,
        (None, Some(client_id)) => aud.iter().any(|a| a == client_id) || azp_is_client,
    }
}

fn claim_string(claims: &Value, claim: &str) -> Option<String> {
    claims
        .get(claim)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn claim_string_vec(claims: &Value, claim: &str) -> Vec<String> {
    match claims.get(claim) {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
