use std::collections::HashMap;
use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use soilrepo_filter::ValidationError;
use soilrepo_ingest::UploadPayload;
use tracing::Instrument;

use super::{
    ApiError, AppState, extract_request_id, finish, ingest_error, json_error, validation_error,
};

#[derive(Debug, Serialize)]
struct UploadResponse {
    ok: bool,
    processed: u64,
    skipped: u64,
}

/// Accepts multipart (`file` field), raw CSV, raw XLSX or a JSON row array, and upserts
/// one record per `(qr_code, param)`.
pub(super) async fn upload(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Response, ApiError> {
    let headers = request.headers().clone();
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "lab_enrichment.ingest",
        request_id = %request_id,
        auth_kind = tracing::field::Empty,
        format = tracing::field::Empty,
        processed = tracing::field::Empty,
        skipped = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        let principal = state.authenticate(&headers, &params).await?;

        let payload = read_payload(&state, &headers, request).await?;
        tracing::Span::current().record("format", payload.format());

        let uploader = soilrepo_ingest::uploader_id(&principal, header_str(&headers, "x-user-id"));
        let summary = soilrepo_ingest::ingest(payload, &uploader, state.lab_store())
            .await
            .map_err(|err| ingest_error(&err))?;

        tracing::Span::current().record("processed", summary.processed);
        tracing::Span::current().record("skipped", summary.skipped);
        crate::metrics::observe_lab_records(summary.processed, summary.skipped);

        Ok::<_, ApiError>(
            Json(UploadResponse {
                ok: true,
                processed: summary.processed,
                skipped: summary.skipped,
            })
            .into_response(),
        )
    }
    .instrument(span.clone())
    .await;

    finish(&span, "/lab-enrichment", "POST", started, &result);
    result
}

async fn read_payload(
    state: &AppState,
    headers: &HeaderMap,
    request: Request,
) -> Result<UploadPayload, ApiError> {
    let content_type = header_str(headers, header::CONTENT_TYPE.as_str());
    let is_multipart = content_type
        .map(|ct| ct.trim().to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false);

    if is_multipart {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|err| body_error(err.status(), err.body_text()))?;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| body_error(err.status(), err.body_text()))?
        {
            if field.name() != Some("file") {
                continue;
            }
            let filename = field.file_name().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|err| body_error(err.status(), err.body_text()))?;
            return Ok(UploadPayload::from_file(filename.as_deref(), bytes.to_vec()));
        }

        return Err(validation_error(&ValidationError::new(
            "file",
            "multipart upload has no `file` field",
        )));
    }

    let body = Bytes::from_request(request, state)
        .await
        .map_err(|err| body_error(err.status(), err.body_text()))?;
    UploadPayload::from_body(content_type, &body).map_err(|err| validation_error(&err))
}

/// Oversized bodies keep their 413; every other body problem is a 400.
fn body_error(status: StatusCode, message: String) -> ApiError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        json_error(status, "ERR_PAYLOAD_TOO_LARGE", message, false)
    } else {
        validation_error(&ValidationError::new("body", message))
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
