use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use soilrepo_contracts::{IngestSummary, LabEnrichmentRecord, Principal, PrincipalKind};
use soilrepo_filter::ValidationError;
use soilrepo_store::{EnrichmentStore, StorageError};

mod normalize;
mod payload;

pub use normalize::{
    ID_COLUMNS, cell_text, is_identifier_column, is_unit_column, normalize_qr, paired_unit,
    row_identifier,
};
pub use payload::{RawRow, RowSource, UploadPayload};

pub const DEFAULT_UPLOADER: &str = "api";

#[derive(Debug)]
pub enum IngestError {
    Validation(ValidationError),
    Storage(StorageError),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Validation(err) => write!(f, "{err}"),
            IngestError::Storage(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<ValidationError> for IngestError {
    fn from(value: ValidationError) -> Self {
        IngestError::Validation(value)
    }
}

impl From<StorageError> for IngestError {
    fn from(value: StorageError) -> Self {
        IngestError::Storage(value)
    }
}

/// Where normalized records go. All records of one upload are handed over in one call.
#[async_trait]
pub trait EnrichmentSink: Send + Sync {
    async fn upsert_all(&self, records: &[LabEnrichmentRecord]) -> Result<u64, StorageError>;
}

#[async_trait]
impl EnrichmentSink for EnrichmentStore {
    async fn upsert_all(&self, records: &[LabEnrichmentRecord]) -> Result<u64, StorageError> {
        EnrichmentStore::upsert_all(self, records).await
    }
}

/// Bearer subject, else the `X-User-Id` header, else `"api"`.
pub fn uploader_id(principal: &Principal, user_id_header: Option<&str>) -> String {
    if principal.kind == PrincipalKind::BearerToken
        && let Some(subject) = principal.subject.as_deref()
        && !subject.trim().is_empty()
    {
        return subject.to_string();
    }

    user_id_header
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_UPLOADER.to_string())
}

/// Parses `payload` and upserts one record per non-empty parameter cell.
///
/// `processed` counts records, not rows: a row with three parameters adds three.
/// `skipped` counts rows that were not objects or had no usable identifier.
pub async fn ingest<S>(
    payload: UploadPayload,
    uploader: &str,
    sink: &S,
) -> Result<IngestSummary, IngestError>
where
    S: EnrichmentSink + ?Sized,
{
    let format = payload.format();
    let updated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut records = Vec::new();
    let mut skipped = 0u64;
    for row in payload.into_rows()? {
        match row {
            RawRow::Object(pairs) => match row_records(&pairs, uploader, &updated_at) {
                Some(mut emitted) => records.append(&mut emitted),
                None => skipped += 1,
            },
            RawRow::NotObject => skipped += 1,
        }
    }

    let processed = sink.upsert_all(&records).await?;
    tracing::info!(format, processed, skipped, "lab enrichment upload stored");

    Ok(IngestSummary { processed, skipped })
}

/// Records for one row, or `None` when the row has no identifier.
fn row_records(
    pairs: &[(String, Value)],
    uploader: &str,
    updated_at: &str,
) -> Option<Vec<LabEnrichmentRecord>> {
    let qr_code = row_identifier(pairs)?;
    let raw_row = Value::Object(pairs.iter().cloned().collect::<Map<_, _>>()).to_string();

    Some(
        pairs
            .iter()
            .filter(|(name, _)| !is_identifier_column(name) && !is_unit_column(name))
            .filter_map(|(name, value)| {
                let value = cell_text(value)?;
                Some(LabEnrichmentRecord {
                    qr_code: qr_code.clone(),
                    param: name.clone(),
                    value,
                    unit: paired_unit(pairs, name),
                    user_id: uploader.to_string(),
                    raw_row: raw_row.clone(),
                    updated_at: updated_at.to_string(),
                })
            })
            .collect(),
    )
}
