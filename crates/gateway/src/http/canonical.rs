use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use soilrepo_contracts::{FilterDescriptor, SchemaDescriptor};
use soilrepo_store::{FixedSchema, QueryExecutor, SampleScope, SchemaProvider, StorageError};
use tracing::Instrument;

use super::{
    ApiError, AppState, CanonicalStore, extract_request_id, finish, internal_error,
    storage_error, validation_error,
};
use crate::serialize::{ZipStream, zip_stream};

/// Parameters the export ignores; every entry carries all allowed columns.
const EXPORT_IGNORED_PARAMS: &[&str] = &[
    "fields",
    "format",
    "limit",
    "offset",
    "order",
    "order_by",
    "dir",
    "direction",
    "sample_id",
    "parameter_code",
];

#[derive(Debug, Clone, Copy)]
enum Table {
    Samples,
    Images,
    Parameters,
}

impl Table {
    fn schema(self, store: &CanonicalStore) -> &FixedSchema {
        match self {
            Table::Samples => &store.samples,
            Table::Images => &store.images,
            Table::Parameters => &store.parameters,
        }
    }

    fn route(self) -> &'static str {
        match self {
            Table::Samples => "/canonical/samples",
            Table::Images => "/canonical/sample_images",
            Table::Parameters => "/canonical/sample_parameters",
        }
    }
}

pub(super) async fn samples(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    list(state, headers, params, Table::Samples).await
}

pub(super) async fn images(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    list(state, headers, params, Table::Images).await
}

pub(super) async fn parameters(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    list(state, headers, params, Table::Parameters).await
}

async fn list(
    state: AppState,
    headers: HeaderMap,
    params: HashMap<String, String>,
    table: Table,
) -> Result<Response, ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "canonical.list",
        request_id = %request_id,
        table = ?table,
        auth_kind = tracing::field::Empty,
        rows = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        state.authenticate(&headers, &params).await?;
        let store = state.canonical()?;

        let schema = table
            .schema(&store)
            .resolve()
            .await
            .map_err(|err| storage_error(&err))?;
        let filter = soilrepo_filter::compile(&params, &schema, &state.policy)
            .map_err(|err| validation_error(&err))?;

        let page = store
            .executor
            .fetch_page(&schema, &filter)
            .await
            .map_err(|err| storage_error(&err))?
            .retain_fields(|field| state.policy.allowed(field));
        tracing::Span::current().record("rows", page.rows.len() as u64);

        crate::serialize::render(&page, &filter, &schema)
            .map_err(|err| internal_error(&err.to_string()))
    }
    .instrument(span.clone())
    .await;

    finish(&span, table.route(), "GET", started, &result);
    result
}

pub(super) async fn samples_count(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "canonical.samples_count",
        request_id = %request_id,
        auth_kind = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        state.authenticate(&headers, &params).await?;
        let store = state.canonical()?;

        let schema = store
            .samples
            .resolve()
            .await
            .map_err(|err| storage_error(&err))?;
        let filter = soilrepo_filter::compile(&params, &schema, &state.policy)
            .map_err(|err| validation_error(&err))?;
        let count = store
            .executor
            .count(&schema, &filter)
            .await
            .map_err(|err| storage_error(&err))?;

        Ok::<_, ApiError>(Json(serde_json::json!({"count": count})).into_response())
    }
    .instrument(span.clone())
    .await;

    finish(&span, "/canonical/samples/count", "GET", started, &result);
    result
}

/// `samples.csv`, `sample_images.csv` and `sample_parameters.csv`. The samples filter
/// picks the sample set; the other two entries are scoped to it and add their own
/// time and country filters where the table has those columns.
///
/// Every filter is compiled before the response starts, so bad parameters still get a
/// JSON error. After that the archive is streamed; a storage failure mid-export breaks
/// the transfer.
pub(super) async fn export_zip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "canonical.export",
        request_id = %request_id,
        auth_kind = tracing::field::Empty,
        rows = tracing::field::Empty,
        bytes = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        state.authenticate(&headers, &params).await?;
        let store = state.canonical()?;

        let mut export_params = params.clone();
        export_params.retain(|key, _| !EXPORT_IGNORED_PARAMS.contains(&key.as_str()));
        export_params.insert("fields".to_string(), "*".to_string());

        let mut entries = Vec::with_capacity(EXPORT_ENTRIES.len());
        for (name, table) in EXPORT_ENTRIES {
            let schema = table
                .schema(&store)
                .resolve()
                .await
                .map_err(|err| storage_error(&err))?;
            let filter = soilrepo_filter::compile(&export_params, &schema, &state.policy)
                .map_err(|err| validation_error(&err))?;
            let header = state.policy.apply_to_field_list(&filter.fields);
            entries.push(ExportEntry {
                name,
                schema,
                filter,
                header,
            });
        }

        let (stream, response) = zip_stream();
        tokio::spawn(write_export(store, entries, stream).instrument(tracing::Span::current()));
        Ok::<_, ApiError>(response)
    }
    .instrument(span.clone())
    .await;

    finish(&span, "/canonical/all.zip", "GET", started, &result);
    result
}

/// Archive order; the first entry is the sample set the others are scoped to.
const EXPORT_ENTRIES: [(&str, Table); 3] = [
    ("samples.csv", Table::Samples),
    ("sample_images.csv", Table::Images),
    ("sample_parameters.csv", Table::Parameters),
];

struct ExportEntry {
    name: &'static str,
    schema: SchemaDescriptor,
    filter: FilterDescriptor,
    header: Vec<String>,
}

async fn write_export(
    store: Arc<CanonicalStore>,
    entries: Vec<ExportEntry>,
    mut stream: ZipStream,
) {
    let started = Instant::now();
    match stream_entries(&store, &entries, &mut stream).await {
        Ok(rows) => match stream.finish().await {
            Ok(bytes) => {
                let span = tracing::Span::current();
                span.record("rows", rows);
                span.record("bytes", bytes);
                tracing::info!(
                    rows,
                    bytes,
                    stream_ms = started.elapsed().as_millis() as u64,
                    "canonical export streamed"
                );
            }
            Err(err) => tracing::warn!(error = %err, rows, "canonical export not delivered"),
        },
        Err(err) => {
            tracing::warn!(error = %err, "canonical export aborted");
            stream.abort(&err).await;
        }
    }
}

async fn stream_entries(
    store: &CanonicalStore,
    entries: &[ExportEntry],
    stream: &mut ZipStream,
) -> Result<u64, StorageError> {
    let Some(samples) = entries.first() else {
        return Ok(0);
    };

    let mut rows = 0u64;
    for (idx, entry) in entries.iter().enumerate() {
        let scope = (idx > 0).then_some(SampleScope {
            schema: &samples.schema,
            filter: &samples.filter,
        });
        stream.start_entry(entry.name, &entry.header).await?;
        rows += store
            .executor
            .stream_rows(&entry.schema, &entry.filter, scope, stream)
            .await?;
    }
    Ok(rows)
}
