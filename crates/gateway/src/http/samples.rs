use std::collections::HashMap;
use std::time::Instant;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use soilrepo_store::{QueryExecutor, SchemaProvider, StorageError};
use tracing::Instrument;

use super::{
    ApiError, AppState, extract_request_id, finish, internal_error, storage_error,
    validation_error,
};

/// Legacy samples page in JSON, CSV or GeoJSON.
pub(super) async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "samples.list",
        request_id = %request_id,
        auth_kind = tracing::field::Empty,
        table = tracing::field::Empty,
        rows = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        state.authenticate(&headers, &params).await?;

        let schema = state
            .legacy_schema
            .resolve()
            .await
            .map_err(|err| storage_error(&err))?;
        tracing::Span::current().record("table", schema.table_name.as_str());

        let filter = soilrepo_filter::compile(&params, &schema, &state.policy)
            .map_err(|err| validation_error(&err))?;

        let page = match state.legacy.fetch_page(&schema, &filter).await {
            Ok(page) => page.retain_fields(|field| state.policy.allowed(field)),
            Err(err) => return Err(legacy_read_failed(&state, err).await),
        };
        tracing::Span::current().record("rows", page.rows.len() as u64);

        crate::serialize::render(&page, &filter, &schema)
            .map_err(|err| internal_error(&err.to_string()))
    }
    .instrument(span.clone())
    .await;

    finish(&span, "/samples", "GET", started, &result);
    result
}

/// Same filter set as [`list`], so the count always matches the paged total.
pub(super) async fn count(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "samples.count",
        request_id = %request_id,
        auth_kind = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        state.authenticate(&headers, &params).await?;

        let schema = state
            .legacy_schema
            .resolve()
            .await
            .map_err(|err| storage_error(&err))?;
        let filter = soilrepo_filter::compile(&params, &schema, &state.policy)
            .map_err(|err| validation_error(&err))?;

        let count = match state.legacy.count(&schema, &filter).await {
            Ok(count) => count,
            Err(err) => return Err(legacy_read_failed(&state, err).await),
        };

        Ok::<_, ApiError>(Json(serde_json::json!({"count": count})).into_response())
    }
    .instrument(span.clone())
    .await;

    finish(&span, "/samples/count", "GET", started, &result);
    result
}

/// The legacy table can change under a cached schema; the next request re-introspects.
async fn legacy_read_failed(state: &AppState, err: StorageError) -> ApiError {
    state.legacy_schema.invalidate().await;
    storage_error(&err)
}
