use std::collections::HashMap;

use soilrepo_contracts::{Direction, FilterDescriptor, OutputFormat, SchemaDescriptor};
use soilrepo_policy::FieldPolicy;

mod geo;
mod time;

pub use geo::{parse_bbox, parse_within, within_to_bbox};
pub use time::{TimeBound, normalize_instant};

pub const DEFAULT_LIMIT: u32 = 100;
pub const MAX_LIMIT: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub param: String,
    pub message: String,
}

impl ValidationError {
    pub const CODE: &'static str = "ERR_INVALID_PARAMS";

    pub fn new(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid `{}`: {}", self.param, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Turns raw query parameters into a validated [`FilterDescriptor`] for `schema`.
///
/// Every parameter is validated even when the schema cannot apply it, so a malformed
/// `bbox` is a 400 on any table. Filters on columns the schema lacks are then dropped.
pub fn compile(
    params: &HashMap<String, String>,
    schema: &SchemaDescriptor,
    policy: &FieldPolicy,
) -> Result<FilterDescriptor, ValidationError> {
    let time_from = time_param(params, "from", TimeBound::Start)?;
    let time_to = time_param(params, "to", TimeBound::End)?;

    let bbox = match param(params, &["bbox"]) {
        Some(raw) => Some(parse_bbox(raw).ok_or_else(|| {
            ValidationError::new("bbox", "expected west,south,east,north as four numbers")
        })?),
        None => None,
    };
    let within = match param(params, &["within"]) {
        Some(raw) => Some(parse_within(raw).ok_or_else(|| {
            ValidationError::new("within", "expected lat,lon,r_km as three numbers, r_km >= 0")
        })?),
        None => None,
    };

    let country = match param(params, &["country", "country_code"]) {
        Some(raw) => Some(parse_country(raw)?),
        None => None,
    };

    let format = parse_format(param(params, &["format"]))?;
    let limit = match parse_integer(params, "limit")? {
        Some(n) => n.clamp(1, i64::from(MAX_LIMIT)) as u32,
        None => DEFAULT_LIMIT,
    };
    let offset = parse_integer(params, "offset")?.unwrap_or(0).max(0) as u64;

    let fields = resolve_fields(param(params, &["fields"]), schema, policy, format);
    let order_by = resolve_order(param(params, &["order", "order_by"]), schema, policy);
    let direction = match param(params, &["dir", "direction"]) {
        Some(raw) if raw.eq_ignore_ascii_case("asc") => Direction::Asc,
        _ => Direction::Desc,
    };

    let has_time = schema.time_column.is_some();
    let sample_id = param(params, &["sample_id"])
        .filter(|_| schema.sample_id_column.is_some())
        .map(str::to_string);
    let parameter_code = param(params, &["parameter_code"])
        .filter(|_| schema.has_column("parameter_code"))
        .map(str::to_string);

    Ok(FilterDescriptor {
        time_from: time_from.filter(|_| has_time),
        time_to: time_to.filter(|_| has_time),
        bbox: bbox.filter(|_| schema.has_geo),
        within: within.filter(|_| schema.has_geo),
        country: country.filter(|_| schema.country_column.is_some()),
        sample_id,
        parameter_code,
        fields,
        limit,
        offset,
        order_by,
        direction,
        format,
    })
}

/// First non-blank value among `names`, trimmed.
fn param<'a>(params: &'a HashMap<String, String>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| params.get(*name))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

fn time_param(
    params: &HashMap<String, String>,
    name: &str,
    bound: TimeBound,
) -> Result<Option<String>, ValidationError> {
    let Some(raw) = param(params, &[name]) else {
        return Ok(None);
    };
    normalize_instant(raw, bound).map(Some).ok_or_else(|| {
        ValidationError::new(
            name,
            "expected YYYY-MM-DD, YYYY-MM-DDTHH:MM, YYYY-MM-DDTHH:MM:SS or YYYY-MM-DDTHH:MM:SS.ffffff",
        )
    })
}

fn parse_country(raw: &str) -> Result<String, ValidationError> {
    if raw.len() != 2 || !raw.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(ValidationError::new(
            "country",
            "expected a two-letter country code",
        ));
    }
    Ok(raw.to_ascii_uppercase())
}

fn parse_format(raw: Option<&str>) -> Result<OutputFormat, ValidationError> {
    let Some(raw) = raw else {
        return Ok(OutputFormat::Json);
    };
    match raw.to_ascii_lowercase().as_str() {
        "json" => Ok(OutputFormat::Json),
        "csv" => Ok(OutputFormat::Csv),
        "geojson" => Ok(OutputFormat::GeoJson),
        _ => Err(ValidationError::new(
            "format",
            "expected one of json, csv, geojson",
        )),
    }
}

fn parse_integer(
    params: &HashMap<String, String>,
    name: &str,
) -> Result<Option<i64>, ValidationError> {
    match param(params, &[name]) {
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ValidationError::new(name, "expected an integer")),
        None => Ok(None),
    }
}

fn resolve_fields(
    raw: Option<&str>,
    schema: &SchemaDescriptor,
    policy: &FieldPolicy,
    format: OutputFormat,
) -> Vec<String> {
    let requested: Vec<&str> = match raw {
        Some("*") => schema.available_columns.iter().map(String::as_str).collect(),
        Some(list) => list.split(',').map(str::trim).filter(|f| !f.is_empty()).collect(),
        None => Vec::new(),
    };

    let mut fields = Vec::new();
    for field in requested {
        push_unique(&mut fields, field, schema, policy);
    }

    if fields.is_empty() {
        for field in &schema.default_fields {
            push_unique(&mut fields, field, schema, policy);
        }
    }

    if fields.is_empty() {
        for field in &schema.available_columns {
            push_unique(&mut fields, field, schema, policy);
        }
    }

    if format == OutputFormat::GeoJson
        && let Some((lon, lat)) = schema.geo_columns()
    {
        push_unique(&mut fields, lon, schema, policy);
        push_unique(&mut fields, lat, schema, policy);
    }

    fields
}

fn push_unique(fields: &mut Vec<String>, field: &str, schema: &SchemaDescriptor, policy: &FieldPolicy) {
    if policy.allowed(field) && schema.has_column(field) && !fields.iter().any(|f| f == field) {
        fields.push(field.to_string());
    }
}

fn resolve_order(raw: Option<&str>, schema: &SchemaDescriptor, policy: &FieldPolicy) -> String {
    let usable = |c: &str| schema.has_column(c) && policy.allowed(c);

    if let Some(requested) = raw
        && usable(requested)
    {
        return requested.to_string();
    }

    if let Some(time) = schema.time_column.as_deref()
        && usable(time)
    {
        return time.to_string();
    }

    schema
        .available_columns
        .iter()
        .find(|c| policy.allowed(c))
        .cloned()
        .unwrap_or_default()
}
