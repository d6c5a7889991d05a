use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    ApiKey,
    BearerToken,
    Session,
}

impl PrincipalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PrincipalKind::ApiKey => "api_key",
            PrincipalKind::BearerToken => "bearer",
            PrincipalKind::Session => "session",
        }
    }
}

/// Caller identity resolved for one request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub subject: Option<String>,
}

impl Principal {
    pub fn api_key() -> Self {
        Self {
            kind: PrincipalKind::ApiKey,
            subject: None,
        }
    }

    pub fn bearer(subject: Option<String>) -> Self {
        Self {
            kind: PrincipalKind::BearerToken,
            subject,
        }
    }

    pub fn session(subject: impl Into<String>) -> Self {
        Self {
            kind: PrincipalKind::Session,
            subject: Some(subject.into()),
        }
    }
}

/// Well-known column roles a table may provide. A role is only recorded on the
/// descriptor when the named column actually exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnRoles<'a> {
    pub time: Option<&'a str>,
    pub lon: Option<&'a str>,
    pub lat: Option<&'a str>,
    pub country: Option<&'a str>,
    pub sample_id: Option<&'a str>,
    pub default_fields: &'a [&'a str],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    pub table_name: String,
    pub available_columns: Vec<String>,
    pub has_geo: bool,
    pub time_column: Option<String>,
    pub lon_column: Option<String>,
    pub lat_column: Option<String>,
    pub country_column: Option<String>,
    pub sample_id_column: Option<String>,
    pub default_fields: Vec<String>,
}

impl SchemaDescriptor {
    pub fn new(
        table_name: impl Into<String>,
        available_columns: Vec<String>,
        roles: ColumnRoles<'_>,
    ) -> Self {
        let present = |name: Option<&str>| {
            name.filter(|n| available_columns.iter().any(|c| c == n))
                .map(str::to_string)
        };

        let time_column = present(roles.time);
        let lon_column = present(roles.lon);
        let lat_column = present(roles.lat);
        let country_column = present(roles.country);
        let sample_id_column = present(roles.sample_id);
        let has_geo = lon_column.is_some() && lat_column.is_some();

        let default_fields = roles
            .default_fields
            .iter()
            .filter(|f| available_columns.iter().any(|c| c == *f))
            .map(|f| f.to_string())
            .collect();

        Self {
            table_name: table_name.into(),
            available_columns,
            has_geo,
            time_column,
            lon_column: if has_geo { lon_column } else { None },
            lat_column: if has_geo { lat_column } else { None },
            country_column,
            sample_id_column,
            default_fields,
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.available_columns.iter().any(|c| c == name)
    }

    pub fn geo_columns(&self) -> Option<(&str, &str)> {
        match (self.lon_column.as_deref(), self.lat_column.as_deref()) {
            (Some(lon), Some(lat)) => Some((lon, lat)),
            _ => None,
        }
    }
}

/// Axis-aligned box in WGS-84 degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Csv,
    GeoJson,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::GeoJson => "geojson",
        }
    }
}

/// Normalized, validated read filter. Only produced by the filter compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDescriptor {
    pub time_from: Option<String>,
    pub time_to: Option<String>,
    pub bbox: Option<BBox>,
    pub within: Option<BBox>,
    pub country: Option<String>,
    pub sample_id: Option<String>,
    pub parameter_code: Option<String>,
    pub fields: Vec<String>,
    pub limit: u32,
    pub offset: u64,
    pub order_by: String,
    pub direction: Direction,
    pub format: OutputFormat,
}

/// One page of rows. `rows[i][j]` is the value of `fields[j]`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    pub fields: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub total: u64,
}

impl ResultSet {
    pub fn retain_fields(self, keep: impl Fn(&str) -> bool) -> ResultSet {
        let keep_idx = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| keep(f.as_str()))
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();

        if keep_idx.len() == self.fields.len() {
            return self;
        }

        let fields = keep_idx
            .iter()
            .map(|idx| self.fields[*idx].clone())
            .collect();
        let rows = self
            .rows
            .into_iter()
            .map(|row| {
                keep_idx
                    .iter()
                    .map(|idx| row.get(*idx).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        ResultSet {
            fields,
            rows,
            total: self.total,
        }
    }

    pub fn row_object(&self, row: &[Value]) -> serde_json::Map<String, Value> {
        let mut out = serde_json::Map::with_capacity(self.fields.len());
        for (field, value) in self.fields.iter().zip(row.iter()) {
            out.insert(field.clone(), value.clone());
        }
        out
    }
}

/// One normalized lab parameter, unique by `(qr_code, param)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabEnrichmentRecord {
    pub qr_code: String,
    pub param: String,
    pub value: String,
    pub unit: Option<String>,
    pub user_id: String,
    pub raw_row: String,
    pub updated_at: String,
}

/// `processed` counts emitted parameter records, `skipped` counts rejected input rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IngestSummary {
    pub processed: u64,
    pub skipped: u64,
}
