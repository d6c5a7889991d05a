use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use soilrepo_contracts::{FilterDescriptor, ResultSet, SchemaDescriptor};
use soilrepo_policy::FieldPolicy;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::schema::{CANONICAL_TABLES, CanonicalTable, ColumnKind, canonical_table};
use crate::sql::{BindValue, Dialect, Predicate, SampleScope, count_sql, quote_ident, select_sql};
use crate::{QueryExecutor, RowSink, StorageError};

/// Reads the canonical Postgres tables. Every read runs in its own transaction with a
/// local `statement_timeout` and a UTC session time zone.
#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
    policy: FieldPolicy,
    query_timeout: Duration,
}

impl PgExecutor {
    pub async fn connect(db_url: &str, query_timeout: Duration) -> Result<Self, StorageError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(5),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| StorageError::Timeout)??;

        Ok(Self::new(pool, query_timeout))
    }

    pub fn new(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            policy: FieldPolicy::standard(),
            query_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, StorageError> {
        let mut tx = self.pool.begin().await?;

        let timeout_str = format!("{}ms", self.query_timeout.as_millis());
        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(&timeout_str)
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT set_config('TimeZone', 'UTC', true)")
            .execute(&mut *tx)
            .await?;

        Ok(tx)
    }

    /// Every row matching `filter` (no paging), handed to `sink` one at a time in
    /// `filter.fields` order. Returns the number of rows delivered.
    pub async fn stream_rows<S>(
        &self,
        schema: &SchemaDescriptor,
        filter: &FilterDescriptor,
        scope: Option<SampleScope<'_>>,
        sink: &mut S,
    ) -> Result<u64, StorageError>
    where
        S: RowSink + ?Sized,
    {
        let table = table_for(schema)?;
        let fields = self.policy.apply_to_field_list(&filter.fields);
        if fields.is_empty() {
            return Ok(0);
        }

        let predicate = Predicate::for_filter(Dialect::Postgres, schema, filter, scope);
        let select_list = fields.iter().map(|f| select_expr(table, f)).collect::<Vec<_>>();
        let sql = select_sql(schema, &select_list, &predicate, filter, false);

        let mut tx = self.begin().await?;
        let mut delivered = 0u64;
        {
            let mut query = sqlx::query(&sql);
            for bind in predicate.binds() {
                query = match bind {
                    BindValue::Text(s) => query.bind(s.as_str()),
                    BindValue::Float(f) => query.bind(*f),
                };
            }

            let mut rows = query.fetch(&mut *tx);
            while let Some(row) = rows.try_next().await? {
                sink.accept(decode_row(table, &fields, &row)).await?;
                delivered += 1;
            }
        }
        tx.commit().await?;

        Ok(delivered)
    }
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn fetch_page(
        &self,
        schema: &SchemaDescriptor,
        filter: &FilterDescriptor,
    ) -> Result<ResultSet, StorageError> {
        let table = table_for(schema)?;
        let fields = self.policy.apply_to_field_list(&filter.fields);
        let predicate = Predicate::for_filter(Dialect::Postgres, schema, filter, None);

        let mut tx = self.begin().await?;

        let rows = if fields.is_empty() {
            Vec::new()
        } else {
            let select_list = fields.iter().map(|f| select_expr(table, f)).collect::<Vec<_>>();
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
                .map(|row| decode_row(table, &fields, row))
                .collect()
        };

        let total = count_in(&mut tx, schema, &predicate).await?;
        tx.commit().await?;

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
        let predicate = Predicate::for_filter(Dialect::Postgres, schema, filter, None);
        let mut tx = self.begin().await?;
        let total = count_in(&mut tx, schema, &predicate).await?;
        tx.commit().await?;
        Ok(total)
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

async fn count_in(
    tx: &mut Transaction<'_, Postgres>,
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
    let count = query.fetch_one(&mut **tx).await?;
    Ok(count.max(0) as u64)
}

fn table_for(schema: &SchemaDescriptor) -> Result<&'static CanonicalTable, StorageError> {
    canonical_table(&schema.table_name)
        .ok_or_else(|| StorageError::TableNotFound(schema.table_name.clone()))
}

fn select_expr(table: &CanonicalTable, column: &str) -> String {
    let ident = quote_ident(column);
    match table.column_kind(column) {
        ColumnKind::Number => format!("CAST({ident} AS DOUBLE PRECISION) AS {ident}"),
        ColumnKind::Timestamp => format!(
            r#"to_char(CAST({ident} AS TIMESTAMPTZ) AT TIME ZONE 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS') AS {ident}"#
        ),
        ColumnKind::Text => format!("CAST({ident} AS TEXT) AS {ident}"),
    }
}

fn decode_row(table: &CanonicalTable, fields: &[String], row: &PgRow) -> Vec<Value> {
    fields
        .iter()
        .enumerate()
        .map(|(idx, field)| match table.column_kind(field) {
            ColumnKind::Number => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ColumnKind::Text | ColumnKind::Timestamp => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(Value::String)
                .unwrap_or(Value::Null),
        })
        .collect()
}

/// Checks that every canonical table exists in the current schema with all the
/// columns the API selects.
pub async fn validate_canonical_schema(pool: &PgPool) -> Result<(), StorageError> {
    for table in CANONICAL_TABLES.iter() {
        let rows = sqlx::query(
            "SELECT column_name \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(table.name)
        .fetch_all(pool)
        .await?;

        if rows.is_empty() {
            return Err(StorageError::SchemaMismatch(format!(
                "required table `{}` does not exist in current schema",
                table.name
            )));
        }

        let available_columns = rows
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("column_name").ok())
            .map(|c| c.to_ascii_lowercase())
            .collect::<BTreeSet<_>>();

        let missing = table
            .column_names()
            .filter(|c| !available_columns.contains(*c))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(StorageError::SchemaMismatch(format!(
                "table `{}` is missing columns [{}]",
                table.name,
                missing.join(", ")
            )));
        }
    }

    Ok(())
}
