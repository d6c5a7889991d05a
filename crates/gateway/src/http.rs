use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use soilrepo_auth::{
    ApiKeyAuthenticator, AuthResolver, Authenticator, Credentials, OidcAuthenticator,
    SessionAuthenticator, SessionRegistry,
};
use soilrepo_contracts::Principal;
use soilrepo_filter::ValidationError;
use soilrepo_ingest::IngestError;
use soilrepo_policy::FieldPolicy;
use soilrepo_store::{
    EnrichmentStore, FixedSchema, IntrospectedSchema, PgExecutor, QueryExecutor, SAMPLE_IMAGES,
    SAMPLE_PARAMETERS, SAMPLES, SqliteExecutor, StorageError, validate_canonical_schema,
};
use tracing::Span;
use ulid::Ulid;

use crate::config::{GatewayConfig, StartupError};

mod canonical;
mod lab;
mod samples;

const LEGACY_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const LAB_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    auth: AuthResolver,
    sessions: SessionRegistry,
    policy: FieldPolicy,
    legacy: SqliteExecutor,
    legacy_schema: IntrospectedSchema,
    lab: EnrichmentStore,
    canonical: Option<Arc<CanonicalStore>>,
}

pub(crate) struct CanonicalStore {
    executor: PgExecutor,
    samples: FixedSchema,
    images: FixedSchema,
    parameters: FixedSchema,
}

impl AppState {
    /// Opens every configured store and builds the auth chain. Missing canonical
    /// tables or columns abort startup.
    pub async fn build(config: GatewayConfig) -> Result<Self, StartupError> {
        let sessions = SessionRegistry::new(config.session_ttl);
        let mut strategies: Vec<Arc<dyn Authenticator>> = Vec::new();
        if let Some(api_key) = config
            .api_key
            .as_deref()
            .and_then(ApiKeyAuthenticator::new)
        {
            strategies.push(Arc::new(api_key));
        }
        if let Some(oidc_config) = config.oidc.clone() {
            let oidc = OidcAuthenticator::new(oidc_config).map_err(|err| StartupError {
                code: err.code,
                message: err.message,
            })?;
            strategies.push(Arc::new(oidc));
        }
        strategies.push(Arc::new(SessionAuthenticator::new(
            config.session_cookie.clone(),
            sessions.clone(),
        )));
        let auth = AuthResolver::new(strategies);

        let legacy = SqliteExecutor::open(&config.sqlite_path, LEGACY_QUERY_TIMEOUT)
            .await
            .map_err(|err| StartupError {
                code: StorageError::CODE,
                message: format!(
                    "failed to open samples database {}: {}",
                    config.sqlite_path.display(),
                    err
                ),
            })?;
        let legacy_schema = IntrospectedSchema::new(
            legacy.pool().clone(),
            config.sample_table.clone(),
            config.schema_cache_ttl,
        );

        let lab = EnrichmentStore::open_and_migrate(&config.lab_db_path, LAB_WRITE_TIMEOUT)
            .await
            .map_err(|err| StartupError {
                code: StorageError::CODE,
                message: format!("failed to initialize lab_enrichment store: {}", err),
            })?;

        let canonical = match config.canonical_db_url.as_deref() {
            None => None,
            Some(url) => {
                let executor = PgExecutor::connect(url, config.pg_query_timeout)
                    .await
                    .map_err(|err| StartupError {
                        code: StorageError::CODE,
                        message: format!("failed to connect to canonical database: {}", err),
                    })?;
                validate_canonical_schema(executor.pool())
                    .await
                    .map_err(|err| StartupError {
                        code: "ERR_SCHEMA_MISMATCH",
                        message: err.to_string(),
                    })?;
                Some(Arc::new(CanonicalStore {
                    executor,
                    samples: FixedSchema::new(&SAMPLES),
                    images: FixedSchema::new(&SAMPLE_IMAGES),
                    parameters: FixedSchema::new(&SAMPLE_PARAMETERS),
                }))
            }
        };

        tracing::info!(
            mechanisms = ?auth.mechanisms(),
            canonical = canonical.is_some(),
            "data api state initialized"
        );

        Ok(Self {
            config,
            auth,
            sessions,
            policy: FieldPolicy::standard(),
            legacy,
            legacy_schema,
            lab,
            canonical,
        })
    }

    /// Sessions accepted by the cookie strategy. The web login issues and revokes here.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn lab_store(&self) -> &EnrichmentStore {
        &self.lab
    }

    pub fn has_canonical(&self) -> bool {
        self.canonical.is_some()
    }

    /// Drains every pool; called once the server has stopped accepting requests.
    pub async fn close(&self) {
        self.legacy.close().await;
        self.lab.close().await;
        if let Some(canonical) = self.canonical.as_deref() {
            canonical.executor.close().await;
        }
    }

    /// Resolves the caller and records the mechanism on the current span.
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) -> Result<Principal, ApiError> {
        let creds = Credentials { headers, query };
        match self.auth.resolve(&creds).await {
            Ok(principal) => {
                let kind = principal.kind.as_str();
                Span::current().record("auth_kind", kind);
                crate::metrics::observe_auth(kind);
                Ok(principal)
            }
            Err(_) => {
                Span::current().record("auth_kind", "none");
                crate::metrics::observe_auth("none");
                Err(auth_error())
            }
        }
    }

    fn canonical(&self) -> Result<Arc<CanonicalStore>, ApiError> {
        self.canonical.clone().ok_or_else(|| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                StorageError::CODE,
                "canonical database is not configured",
                false,
            )
        })
    }
}

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn routes(state: AppState) -> Router {
    let prefix = state.config.api_prefix.clone();
    let api = |path: &str| format!("{prefix}{path}");

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(&api("/ping"), get(ping))
        .route(&api("/samples"), get(samples::list))
        .route(&api("/samples/count"), get(samples::count))
        .route(&api("/canonical/samples"), get(canonical::samples))
        .route(&api("/canonical/samples/count"), get(canonical::samples_count))
        .route(&api("/canonical/sample_images"), get(canonical::images))
        .route(&api("/canonical/sample_parameters"), get(canonical::parameters))
        .route(&api("/canonical/all.zip"), get(canonical::export_zip))
        .route(
            &api("/lab-enrichment"),
            post(lab::upload).layer(DefaultBodyLimit::max(state.config.max_upload_bytes)),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    checks.insert("sqlite", state.legacy.ping().await.is_ok());
    checks.insert("lab_enrichment", state.lab.ping().await.is_ok());
    if let Some(canonical) = state.canonical.as_deref() {
        checks.insert("canonical", canonical.executor.ping().await.is_ok());
    }

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if state.config.metrics_require_auth
        && let Err(err) = state.authenticate(&headers, &query).await
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Records latency and outcome on `span` and feeds the HTTP metrics.
pub(crate) fn finish<T>(
    span: &Span,
    route: &'static str,
    method: &'static str,
    started: Instant,
    result: &Result<T, ApiError>,
) {
    let status = match result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    let outcome = match result {
        Ok(_) => "ok",
        Err((_, Json(err))) => err.code.as_str(),
    };

    span.record("latency_ms", started.elapsed().as_millis() as u64);
    span.record("outcome", outcome);
    crate::metrics::observe_http_request(route, method, status.as_u16(), started.elapsed());
}

pub(crate) fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
}

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}

/// Never says which mechanism came close.
pub(crate) fn auth_error() -> ApiError {
    json_error(
        StatusCode::UNAUTHORIZED,
        "ERR_AUTH_REQUIRED",
        "missing or invalid credentials",
        false,
    )
}

pub(crate) fn validation_error(err: &ValidationError) -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        ValidationError::CODE,
        err.to_string(),
        false,
    )
}

pub(crate) fn storage_error(err: &StorageError) -> ApiError {
    tracing::warn!(error = %err, "storage request failed");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        StorageError::CODE,
        "storage unavailable",
        true,
    )
}

pub(crate) fn ingest_error(err: &IngestError) -> ApiError {
    match err {
        IngestError::Validation(err) => validation_error(err),
        IngestError::Storage(err) => storage_error(err),
    }
}

pub(crate) fn internal_error(message: &str) -> ApiError {
    tracing::warn!(message, "response rendering failed");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "ERR_INTERNAL",
        "failed to render response",
        false,
    )
}
