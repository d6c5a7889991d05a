use std::convert::Infallible;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};
use soilrepo_contracts::{FilterDescriptor, OutputFormat, ResultSet, SchemaDescriptor};
use soilrepo_store::{RowSink, StorageError};
use tokio::sync::mpsc;
use zip::ZipWriter;
use zip::write::{SimpleFileOptions, StreamWriter};

pub(crate) const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8";
pub(crate) const GEOJSON_CONTENT_TYPE: &str = "application/geo+json";
pub(crate) const ZIP_CONTENT_TYPE: &str = "application/zip";
pub(crate) const ZIP_DISPOSITION: &str = "attachment; filename=\"soilrepo_export.zip\"";

/// Renders one page in the format the filter asked for.
pub(crate) fn render(
    set: &ResultSet,
    filter: &FilterDescriptor,
    schema: &SchemaDescriptor,
) -> Result<Response, csv::Error> {
    Ok(match filter.format {
        OutputFormat::Json => axum::Json(json_body(set, filter)).into_response(),
        OutputFormat::Csv => csv_response(set)?,
        OutputFormat::GeoJson => with_content_type(
            axum::Json(geojson_body(set, schema)).into_response(),
            GEOJSON_CONTENT_TYPE,
        ),
    })
}

pub(crate) fn json_body(set: &ResultSet, filter: &FilterDescriptor) -> Value {
    let data = set
        .rows
        .iter()
        .map(|row| Value::Object(set.row_object(row)))
        .collect::<Vec<_>>();

    json!({
        "meta": {
            "count": set.total,
            "limit": filter.limit,
            "offset": filter.offset,
            "order": filter.order_by,
            "dir": filter.direction.as_str(),
        },
        "data": data,
    })
}

/// Rows without two finite coordinates are dropped. Coordinates never appear in
/// `properties`.
pub(crate) fn geojson_body(set: &ResultSet, schema: &SchemaDescriptor) -> Value {
    let coordinate_idx = schema.geo_columns().and_then(|(lon, lat)| {
        let lon_idx = set.fields.iter().position(|f| f == lon)?;
        let lat_idx = set.fields.iter().position(|f| f == lat)?;
        Some((lon_idx, lat_idx))
    });

    let features = match coordinate_idx {
        None => Vec::new(),
        Some((lon_idx, lat_idx)) => set
            .rows
            .iter()
            .filter_map(|row| {
                let lon = row.get(lon_idx).and_then(coordinate)?;
                let lat = row.get(lat_idx).and_then(coordinate)?;

                let properties = set
                    .fields
                    .iter()
                    .zip(row.iter())
                    .enumerate()
                    .filter(|(idx, _)| *idx != lon_idx && *idx != lat_idx)
                    .map(|(_, (field, value))| (field.clone(), value.clone()))
                    .collect::<Map<_, _>>();

                Some(json!({
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [lon, lat]},
                    "properties": properties,
                }))
            })
            .collect(),
    };

    json!({"type": "FeatureCollection", "features": features})
}

fn coordinate(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

/// Header chunk, then one chunk per row.
pub(crate) fn csv_response(set: &ResultSet) -> Result<Response, csv::Error> {
    let mut chunks = Vec::with_capacity(set.rows.len() + 1);
    chunks.push(csv_record(set.fields.iter().map(String::as_str))?);
    for row in &set.rows {
        let cells = row.iter().map(csv_cell).collect::<Vec<_>>();
        chunks.push(csv_record(cells.iter().map(String::as_str))?);
    }

    let stream = futures::stream::iter(
        chunks
            .into_iter()
            .map(|chunk| Ok::<_, Infallible>(Bytes::from(chunk))),
    );
    Ok(with_content_type(
        Body::from_stream(stream).into_response(),
        CSV_CONTENT_TYPE,
    ))
}

/// One CSV line, quoted only where needed.
pub(crate) fn csv_record<'a>(cells: impl IntoIterator<Item = &'a str>) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(Vec::new());
    writer.write_record(cells)?;
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

pub(crate) fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn with_content_type(mut response: Response, content_type: &'static str) -> Response {
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Compressed bytes are handed to the response body once this much has accumulated.
const ZIP_CHUNK_BYTES: usize = 32 * 1024;
/// Chunks in flight between the database cursor and the client.
const ZIP_CHANNEL_DEPTH: usize = 4;

/// Output side of the archive writer, drained as it fills.
#[derive(Clone, Default)]
struct ArchiveBuffer(Arc<Mutex<Vec<u8>>>);

impl ArchiveBuffer {
    fn take(&self, min: usize) -> Option<Vec<u8>> {
        let mut buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        (!buf.is_empty() && buf.len() >= min).then(|| std::mem::take(&mut *buf))
    }
}

impl Write for ArchiveBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Archive of CSV entries written in streaming mode: no seeking, sizes go into data
/// descriptors, so finished bytes can leave before the archive is complete.
pub(crate) struct ZipExport {
    writer: ZipWriter<StreamWriter<ArchiveBuffer>>,
    out: ArchiveBuffer,
}

impl ZipExport {
    pub(crate) fn new() -> Self {
        let out = ArchiveBuffer::default();
        Self {
            writer: ZipWriter::new_stream(out.clone()),
            out,
        }
    }

    /// Starts `name` and writes its header line.
    pub(crate) fn start_entry(&mut self, name: &str, fields: &[String]) -> std::io::Result<()> {
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        self.writer.start_file(name, options)?;
        let header = csv_record(fields.iter().map(String::as_str))?;
        self.writer.write_all(&header)
    }

    pub(crate) fn write_row(&mut self, row: &[Value]) -> std::io::Result<()> {
        let cells = row.iter().map(csv_cell).collect::<Vec<_>>();
        let line = csv_record(cells.iter().map(String::as_str))?;
        self.writer.write_all(&line)
    }

    /// Bytes produced since the last call, if at least `min` are waiting.
    pub(crate) fn take_chunk(&self, min: usize) -> Option<Vec<u8>> {
        self.out.take(min)
    }

    /// Writes the central directory and returns every byte not yet taken.
    pub(crate) fn finish(self) -> std::io::Result<Vec<u8>> {
        self.writer.finish()?;
        Ok(self.out.take(0).unwrap_or_default())
    }
}

/// Producer half of a streamed ZIP download. Each accepted row may push a chunk into a
/// bounded channel; a full channel suspends the producer until the client catches up.
pub(crate) struct ZipStream {
    export: ZipExport,
    tx: mpsc::Sender<std::io::Result<Vec<u8>>>,
    bytes: u64,
}

/// The response is returned right away; its body yields whatever the [`ZipStream`]
/// sends and ends when the stream is finished or dropped.
pub(crate) fn zip_stream() -> (ZipStream, Response) {
    let (tx, rx) = mpsc::channel(ZIP_CHANNEL_DEPTH);
    let body = Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    }));

    let response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, ZIP_CONTENT_TYPE),
            (header::CONTENT_DISPOSITION, ZIP_DISPOSITION),
        ],
        body,
    )
        .into_response();

    let stream = ZipStream {
        export: ZipExport::new(),
        tx,
        bytes: 0,
    };
    (stream, response)
}

impl ZipStream {
    pub(crate) async fn start_entry(
        &mut self,
        name: &str,
        fields: &[String],
    ) -> Result<(), StorageError> {
        self.export.start_entry(name, fields)?;
        self.push(ZIP_CHUNK_BYTES).await
    }

    /// Returns the total archive size.
    pub(crate) async fn finish(self) -> Result<u64, StorageError> {
        let ZipStream { export, tx, bytes } = self;
        let tail = export.finish()?;
        let total = bytes + tail.len() as u64;
        if !tail.is_empty() {
            tx.send(Ok(tail)).await.map_err(|_| download_closed())?;
        }
        Ok(total)
    }

    /// Fails the body so the client gets a broken transfer instead of a short archive
    /// that looks complete.
    pub(crate) async fn abort(self, err: &StorageError) {
        let _ = self.tx.send(Err(std::io::Error::other(err.to_string()))).await;
    }

    async fn push(&mut self, min: usize) -> Result<(), StorageError> {
        if let Some(chunk) = self.export.take_chunk(min) {
            self.bytes += chunk.len() as u64;
            self.tx.send(Ok(chunk)).await.map_err(|_| download_closed())?;
        }
        Ok(())
    }
}

#[async_trait]
impl RowSink for ZipStream {
    async fn accept(&mut self, row: Vec<Value>) -> Result<(), StorageError> {
        self.export.write_row(&row)?;
        self.push(ZIP_CHUNK_BYTES).await
    }
}

fn download_closed() -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "export download closed by client",
    ))
}
