use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use soilrepo_contracts::{FilterDescriptor, ResultSet, SchemaDescriptor};
use soilrepo_policy::FieldPolicy;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, SqlitePool, TypeInfo, ValueRef};

use crate::sql::{BindValue, Dialect, Predicate, count_sql, quote_ident, select_sql};
use crate::{QueryExecutor, StorageError};

/// Opens a WAL-mode pool on a SQLite file.
pub(crate) async fn open_pool(
    path: &Path,
    create_if_missing: bool,
    max_connections: u32,
) -> Result<SqlitePool, StorageError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create_if_missing)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = tokio::time::timeout(
        Duration::from_secs(5),
        SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options),
    )
    .await
    .map_err(|_| StorageError::Timeout)??;
    Ok(pool)
}

/// Reads the legacy samples table.
#[derive(Clone)]
pub struct SqliteExecutor {
    pool: SqlitePool,
    policy: FieldPolicy,
    query_timeout: Duration,
}

impl SqliteExecutor {
    pub async fn open(path: &Path, query_timeout: Duration) -> Result<Self, StorageError> {
        let pool = open_pool(path, false, 8).await?;
        Ok(Self::new(pool, query_timeout))
    }

    pub fn new(pool: SqlitePool, query_timeout: Duration) -> Self {
        Self {
            pool,
            policy: FieldPolicy::standard(),
            query_timeout,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    /// Page and count share one read transaction, so `total` and `rows` come from the
    /// same snapshot.
    async fn fetch_page(
        &self,
        schema: &SchemaDescriptor,
        filter: &FilterDescriptor,
    ) -> Result<ResultSet, StorageError> {
        let fields = self.policy.apply_to_field_list(&filter.fields);
        let predicate = Predicate::for_filter(Dialect::Sqlite, schema, filter, None);

        let read = async {
            let mut tx = self.pool.begin().await?;

            let rows: Vec<Vec<Value>> = if fields.is_empty() {
                Vec::new()
            } else {
                let select_list = fields.iter().map(|f| quote_ident(f)).collect::<Vec<_>>();
                let sql = select_sql(schema, &select_list, &predicate, filter, true);

                let mut query = sqlx::query(&sql);
                for bind in predicate.binds() {
                    query = match bind {
                        BindValue::Text(s) => query.bind(s.as_str()),
                        BindValue::Float(f) => query.bind(*f),
                    };
                }
                let rows = query.fetch_all(&mut *tx).await?;

                rows.iter()
                    .map(|row| (0..fields.len()).map(|idx| sqlite_cell(row, idx)).collect())
                    .collect()
            };

            let total = count_rows(&mut tx, schema, &predicate).await?;
            tx.commit().await?;
            Ok::<_, StorageError>((rows, total))
        };

        let (rows, total) = tokio::time::timeout(self.query_timeout, read)
            .await
            .map_err(|_| StorageError::Timeout)??;

        Ok(ResultSet {
            fields,
            rows,
            total,
        })
    }

    async fn count(
        &self,
        schema: &SchemaDescriptor,
        filter: &FilterDescriptor,
    ) -> Result<u64, StorageError> {
        let predicate = Predicate::for_filter(Dialect::Sqlite, schema, filter, None);

        let read = async {
            let mut conn = self.pool.acquire().await?;
            count_rows(&mut conn, schema, &predicate).await
        };
        tokio::time::timeout(self.query_timeout, read)
            .await
            .map_err(|_| StorageError::Timeout)?
    }

    async fn ping(&self) -> Result<(), StorageError> {
        tokio::time::timeout(
            Duration::from_secs(2),
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| StorageError::Timeout)??;
        Ok(())
    }
}

async fn count_rows(
    conn: &mut SqliteConnection,
    schema: &SchemaDescriptor,
    predicate: &Predicate,
) -> Result<u64, StorageError> {
    let sql = count_sql(schema, predicate);
    let mut query = sqlx::query_scalar::<_, i64>(&sql);
    for bind in predicate.binds() {
        query = match bind {
            BindValue::Text(s) => query.bind(s.as_str()),
            BindValue::Float(f) => query.bind(*f),
        };
    }
    let count = query.fetch_one(&mut *conn).await?;
    Ok(count.max(0) as u64)
}

/// SQLite storage classes map onto JSON scalars; BLOBs become null.
fn sqlite_cell(row: &SqliteRow, idx: usize) -> Value {
    let Ok(raw) = row.try_get_raw(idx) else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }

    match raw.type_info().name() {
        "INTEGER" => row
            .try_get_unchecked::<i64, _>(idx)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "REAL" => row
            .try_get_unchecked::<f64, _>(idx)
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "TEXT" => row
            .try_get_unchecked::<String, _>(idx)
            .map(Value::String)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}
