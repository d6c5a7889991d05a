use std::io::Cursor;

use calamine::{Data, Reader};
use serde_json::Value;
use soilrepo_filter::ValidationError;

const XLSX_CONTENT_TYPES: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-excel",
];
const XLSX_EXTENSIONS: &[&str] = &[".xlsx", ".xlsm", ".xls"];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// An upload body after format detection, before any row is read.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadPayload {
    Json(Vec<Value>),
    Csv(Vec<u8>),
    Xlsx(Vec<u8>),
}

/// One input row. Column order follows the source where the source has one.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRow {
    Object(Vec<(String, Value)>),
    NotObject,
}

impl UploadPayload {
    /// Detects a raw (non-multipart) body by content type.
    pub fn from_body(content_type: Option<&str>, body: &[u8]) -> Result<Self, ValidationError> {
        let media_type = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();

        if is_csv_type(&media_type) {
            return Ok(Self::Csv(body.to_vec()));
        }
        if XLSX_CONTENT_TYPES.contains(&media_type.as_str()) {
            return Ok(Self::Xlsx(body.to_vec()));
        }
        if media_type == "application/json" || media_type.ends_with("+json") {
            return Self::from_json(body);
        }

        Err(ValidationError::new(
            "content-type",
            "expected a JSON, CSV or XLSX body, or multipart/form-data with a `file` field",
        ))
    }

    /// Detects a multipart `file` field by extension, then by content.
    pub fn from_file(filename: Option<&str>, bytes: Vec<u8>) -> Self {
        let by_extension = filename
            .map(|name| name.trim().to_ascii_lowercase())
            .is_some_and(|name| XLSX_EXTENSIONS.iter().any(|ext| name.ends_with(ext)));

        if by_extension || bytes.starts_with(ZIP_MAGIC) {
            Self::Xlsx(bytes)
        } else {
            Self::Csv(bytes)
        }
    }

    pub fn from_json(body: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|err| ValidationError::new("body", format!("invalid JSON: {err}")))?;

        match value {
            Value::Array(rows) => Ok(Self::Json(rows)),
            Value::Object(mut object) => match object.remove("rows") {
                Some(Value::Array(rows)) => Ok(Self::Json(rows)),
                _ => Err(ValidationError::new(
                    "body",
                    "expected a JSON array of rows or {\"rows\": [...]}",
                )),
            },
            _ => Err(ValidationError::new(
                "body",
                "expected a JSON array of rows or {\"rows\": [...]}",
            )),
        }
    }

    pub fn format(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Csv(_) => "csv",
            Self::Xlsx(_) => "xlsx",
        }
    }

    /// Opens the payload for reading. Header-level problems (no header row, a workbook
    /// that cannot be opened) are validation errors; row-level problems are not.
    pub fn into_rows(self) -> Result<RowSource, ValidationError> {
        match self {
            Self::Json(rows) => Ok(RowSource::Json(rows.into_iter())),
            Self::Csv(bytes) => csv_rows(bytes),
            Self::Xlsx(bytes) => Ok(RowSource::Buffered(xlsx_rows(bytes)?.into_iter())),
        }
    }
}

fn is_csv_type(media_type: &str) -> bool {
    matches!(media_type, "text/csv" | "application/csv" | "text/plain") || media_type.contains("csv")
}

/// Uniform row iterator over every payload kind.
pub enum RowSource {
    Json(std::vec::IntoIter<Value>),
    Csv {
        headers: Vec<String>,
        records: csv::StringRecordsIntoIter<Cursor<Vec<u8>>>,
    },
    Buffered(std::vec::IntoIter<RawRow>),
}

impl Iterator for RowSource {
    type Item = RawRow;

    fn next(&mut self) -> Option<RawRow> {
        match self {
            RowSource::Json(rows) => rows.next().map(|row| match row {
                Value::Object(object) => RawRow::Object(object.into_iter().collect()),
                _ => RawRow::NotObject,
            }),
            RowSource::Csv { headers, records } => records.next().map(|record| match record {
                Ok(record) => RawRow::Object(
                    headers
                        .iter()
                        .zip(record.iter())
                        .filter(|(header, _)| !header.is_empty())
                        .map(|(header, cell)| (header.clone(), Value::String(cell.to_string())))
                        .collect(),
                ),
                Err(_) => RawRow::NotObject,
            }),
            RowSource::Buffered(rows) => rows.next(),
        }
    }
}

fn csv_rows(mut bytes: Vec<u8>) -> Result<RowSource, ValidationError> {
    if bytes.starts_with(UTF8_BOM) {
        bytes.drain(..UTF8_BOM.len());
    }

    let header_line = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let delimiter = if header_line.contains(&b';') && !header_line.contains(&b',') {
        b';'
    } else {
        b','
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(Cursor::new(bytes));

    let headers = reader
        .headers()
        .map_err(|err| ValidationError::new("file", format!("unreadable CSV header: {err}")))?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(ValidationError::new("file", "CSV has no header row"));
    }

    Ok(RowSource::Csv {
        headers,
        records: reader.into_records(),
    })
}

fn xlsx_rows(bytes: Vec<u8>) -> Result<Vec<RawRow>, ValidationError> {
    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|err| ValidationError::new("file", format!("unreadable workbook: {err}")))?;

    let range = match workbook.worksheet_range_at(0) {
        Some(Ok(range)) => range,
        Some(Err(err)) => {
            return Err(ValidationError::new(
                "file",
                format!("unreadable worksheet: {err}"),
            ));
        }
        None => return Err(ValidationError::new("file", "workbook has no worksheets")),
    };

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers = header_row
        .iter()
        .map(|cell| cell.to_string().trim().to_string())
        .collect::<Vec<_>>();

    Ok(rows
        .filter(|row| row.iter().any(|cell| !matches!(cell, Data::Empty)))
        .map(|row| {
            RawRow::Object(
                headers
                    .iter()
                    .zip(row.iter())
                    .filter(|(header, _)| !header.is_empty())
                    .map(|(header, cell)| (header.clone(), cell_value(cell)))
                    .collect(),
            )
        })
        .collect())
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Int(n) => Value::from(*n),
        Data::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Data::String(s) => Value::String(s.clone()),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()))
            .unwrap_or(Value::Null),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(_) | Data::Empty => Value::Null,
    }
}
