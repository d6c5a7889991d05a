use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use soilrepo_contracts::{ColumnRoles, SchemaDescriptor};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::StorageError;

#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn resolve(&self) -> Result<SchemaDescriptor, StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Number,
    Timestamp,
}

/// One table of the canonical Postgres schema.
#[derive(Debug, Clone, Copy)]
pub struct CanonicalTable {
    pub name: &'static str,
    pub columns: &'static [(&'static str, ColumnKind)],
    pub time_column: Option<&'static str>,
    pub lon_column: Option<&'static str>,
    pub lat_column: Option<&'static str>,
    pub country_column: Option<&'static str>,
    pub sample_id_column: Option<&'static str>,
}

use ColumnKind::{Number, Text, Timestamp};

pub const SAMPLES: CanonicalTable = CanonicalTable {
    name: "samples",
    columns: &[
        ("sample_id", Text),
        ("qr_code", Text),
        ("timestamp_utc", Timestamp),
        ("lat", Number),
        ("lon", Number),
        ("country_code", Text),
        ("location_accuracy_m", Number),
        ("ph", Number),
        ("soil_texture_orig", Text),
        ("soil_texture_en", Text),
        ("soil_structure_orig", Text),
        ("soil_structure_en", Text),
        ("earthworms_count", Number),
        ("contamination_plastic", Text),
        ("contamination_debris", Text),
        ("contamination_other_orig", Text),
        ("contamination_other_en", Text),
        ("observations_orig", Text),
        ("observations_en", Text),
        ("metals_info_orig", Text),
        ("metals_info_en", Text),
        ("qa_state", Text),
    ],
    time_column: Some("timestamp_utc"),
    lon_column: Some("lon"),
    lat_column: Some("lat"),
    country_column: Some("country_code"),
    sample_id_column: Some("sample_id"),
};

pub const SAMPLE_IMAGES: CanonicalTable = CanonicalTable {
    name: "sample_images",
    columns: &[
        ("sample_id", Text),
        ("image_id", Text),
        ("country_code", Text),
        ("image_url", Text),
        ("image_description_orig", Text),
        ("image_description_en", Text),
        ("collected_at", Timestamp),
    ],
    time_column: Some("collected_at"),
    lon_column: None,
    lat_column: None,
    country_column: Some("country_code"),
    sample_id_column: Some("sample_id"),
};

pub const SAMPLE_PARAMETERS: CanonicalTable = CanonicalTable {
    name: "sample_parameters",
    columns: &[
        ("sample_id", Text),
        ("country_code", Text),
        ("parameter_code", Text),
        ("parameter_name", Text),
        ("value", Text),
        ("uom", Text),
        ("analysis_method", Text),
        ("analysis_date", Text),
        ("lab_id", Text),
    ],
    time_column: None,
    lon_column: None,
    lat_column: None,
    country_column: Some("country_code"),
    sample_id_column: Some("sample_id"),
};

pub static CANONICAL_TABLES: [CanonicalTable; 3] = [SAMPLES, SAMPLE_IMAGES, SAMPLE_PARAMETERS];

pub fn canonical_table(name: &str) -> Option<&'static CanonicalTable> {
    CANONICAL_TABLES.iter().find(|t| t.name == name)
}

impl CanonicalTable {
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> {
        self.columns.iter().map(|(name, _)| *name)
    }

    pub fn column_kind(&self, column: &str) -> ColumnKind {
        self.columns
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, kind)| *kind)
            .unwrap_or(Text)
    }

    pub fn descriptor(&self) -> SchemaDescriptor {
        let names = self.column_names().collect::<Vec<_>>();
        SchemaDescriptor::new(
            self.name,
            names.iter().map(|s| s.to_string()).collect(),
            ColumnRoles {
                time: self.time_column,
                lon: self.lon_column,
                lat: self.lat_column,
                country: self.country_column,
                sample_id: self.sample_id_column,
                default_fields: &names,
            },
        )
    }
}

/// Canonical tables have a fixed shape; nothing is looked up at request time.
#[derive(Debug, Clone, Copy)]
pub struct FixedSchema {
    table: &'static CanonicalTable,
}

impl FixedSchema {
    pub fn new(table: &'static CanonicalTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &'static CanonicalTable {
        self.table
    }
}

#[async_trait]
impl SchemaProvider for FixedSchema {
    async fn resolve(&self) -> Result<SchemaDescriptor, StorageError> {
        Ok(self.table.descriptor())
    }
}

pub const LEGACY_DEFAULT_FIELDS: &[&str] = &[
    "sampleId",
    "collectedAt",
    "GPS_long",
    "GPS_lat",
    "PH_ph",
    "SOIL_TEXTURE_texture",
    "SOIL_STRUCTURE_structure",
    "SOIL_DIVER_earthworms",
    "SOIL_CONTAMINATION_plastic",
];

const LEGACY_TABLE_SHORTLIST: &[&str] = &["samples", "sample", "data", "records"];
const LEGACY_ID_COLUMN: &str = "sampleId";
const INTERNAL_TABLES: &[&str] = &["_sqlx_migrations", "lab_enrichment"];

/// Legacy SQLite samples table, discovered by introspection and cached for `ttl`.
#[derive(Clone)]
pub struct IntrospectedSchema {
    pool: SqlitePool,
    table_override: Option<String>,
    ttl: Duration,
    cached: Arc<RwLock<Option<(SchemaDescriptor, Instant)>>>,
}

impl IntrospectedSchema {
    pub fn new(pool: SqlitePool, table_override: Option<String>, ttl: Duration) -> Self {
        Self {
            pool,
            table_override: table_override.filter(|t| !t.trim().is_empty()),
            ttl,
            cached: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    async fn introspect(&self) -> Result<SchemaDescriptor, StorageError> {
        let table = match self.table_override.as_ref() {
            Some(table) => table.clone(),
            None => self.discover_table().await?,
        };

        let columns = table_columns(&self.pool, &table).await?;
        if columns.is_empty() {
            return Err(StorageError::TableNotFound(table));
        }

        tracing::debug!(table = %table, columns = columns.len(), "legacy schema introspected");

        Ok(SchemaDescriptor::new(
            table,
            columns,
            ColumnRoles {
                time: Some("collectedAt"),
                lon: Some("GPS_long"),
                lat: Some("GPS_lat"),
                country: Some("country_code"),
                sample_id: Some(LEGACY_ID_COLUMN),
                default_fields: LEGACY_DEFAULT_FIELDS,
            },
        ))
    }

    async fn discover_table(&self) -> Result<String, StorageError> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&self.pool)
        .await?;

        let tables = tables
            .into_iter()
            .filter(|t| !INTERNAL_TABLES.contains(&t.as_str()))
            .collect::<Vec<_>>();

        pick_table(&self.pool, &tables).await
    }
}

async fn pick_table(pool: &SqlitePool, tables: &[String]) -> Result<String, StorageError> {
    for candidate in LEGACY_TABLE_SHORTLIST {
        if tables.iter().any(|t| t == candidate) {
            return Ok(candidate.to_string());
        }
    }

    for table in tables {
        let columns = table_columns(pool, table).await?;
        if columns.iter().any(|c| c == LEGACY_ID_COLUMN) {
            return Ok(table.clone());
        }
    }

    tables.first().cloned().ok_or(StorageError::NoTables)
}

async fn table_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>, StorageError> {
    let sql = format!("SELECT name FROM pragma_table_info({}) ORDER BY cid", sql_string(table));
    let columns: Vec<String> = sqlx::query_scalar(&sql).fetch_all(pool).await?;
    Ok(columns)
}

/// Table-valued pragmas take the table name as a string literal.
fn sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl SchemaProvider for IntrospectedSchema {
    async fn resolve(&self) -> Result<SchemaDescriptor, StorageError> {
        if !self.ttl.is_zero() {
            let cached = self.cached.read().await;
            if let Some((schema, at)) = cached.as_ref()
                && at.elapsed() < self.ttl
            {
                return Ok(schema.clone());
            }
        }

        let mut cached = self.cached.write().await;
        if !self.ttl.is_zero()
            && let Some((schema, at)) = cached.as_ref()
            && at.elapsed() < self.ttl
        {
            return Ok(schema.clone());
        }

        let schema = self.introspect().await?;
        if !self.ttl.is_zero() {
            *cached = Some((schema.clone(), Instant::now()));
        }
        Ok(schema)
    }
}
