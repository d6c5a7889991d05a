use async_trait::async_trait;
use serde_json::Value;
use soilrepo_contracts::{FilterDescriptor, ResultSet, SchemaDescriptor};

mod enrichment;
mod postgres;
mod schema;
pub mod sql;
mod sqlite;

pub use enrichment::EnrichmentStore;
pub use postgres::{PgExecutor, validate_canonical_schema};
pub use schema::{
    CANONICAL_TABLES, CanonicalTable, ColumnKind, FixedSchema, IntrospectedSchema,
    LEGACY_DEFAULT_FIELDS, SAMPLE_IMAGES, SAMPLE_PARAMETERS, SAMPLES, SchemaProvider,
    canonical_table,
};
pub use sql::SampleScope;
pub use sqlite::SqliteExecutor;

#[derive(Debug)]
pub enum StorageError {
    Timeout,
    NoTables,
    TableNotFound(String),
    SchemaMismatch(String),
    Io(std::io::Error),
    Migrate(sqlx::migrate::MigrateError),
    Sqlx(sqlx::Error),
}

impl StorageError {
    pub const CODE: &'static str = "ERR_STORAGE_UNAVAILABLE";
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Timeout => write!(f, "storage operation timed out"),
            StorageError::NoTables => write!(f, "database contains no tables"),
            StorageError::TableNotFound(table) => write!(f, "table `{}` not found", table),
            StorageError::SchemaMismatch(message) => write!(f, "schema mismatch: {}", message),
            StorageError::Io(err) => write!(f, "storage io error: {}", err),
            StorageError::Migrate(err) => write!(f, "migration failed: {}", err),
            StorageError::Sqlx(err) => write!(f, "storage sql error: {}", err),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<sqlx::Error> for StorageError {
    fn from(value: sqlx::Error) -> Self {
        StorageError::Sqlx(value)
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(value: sqlx::migrate::MigrateError) -> Self {
        StorageError::Migrate(value)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        StorageError::Io(value)
    }
}

/// Bounded reads against one backend. The page query and the count query share
/// one WHERE predicate, so `total` is exact for the filter.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn fetch_page(
        &self,
        schema: &SchemaDescriptor,
        filter: &FilterDescriptor,
    ) -> Result<ResultSet, StorageError>;

    async fn count(
        &self,
        schema: &SchemaDescriptor,
        filter: &FilterDescriptor,
    ) -> Result<u64, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}

/// Receives exported rows one at a time. Awaiting in `accept` pauses the database cursor,
/// so a slow consumer holds back the read instead of buffering it.
#[async_trait]
pub trait RowSink: Send {
    async fn accept(&mut self, row: Vec<Value>) -> Result<(), StorageError>;
}
