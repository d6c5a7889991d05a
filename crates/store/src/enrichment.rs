use std::path::Path;
use std::time::Duration;

use soilrepo_contracts::LabEnrichmentRecord;
use sqlx::{Row, SqlitePool};

use crate::StorageError;
use crate::sqlite::open_pool;

const UPSERT_SQL: &str = "INSERT INTO lab_enrichment (qr_code, param, value, unit, user_id, raw_row, updated_at) \
     VALUES (?, ?, ?, ?, ?, ?, ?) \
     ON CONFLICT (qr_code, param) DO UPDATE SET \
     value = excluded.value, unit = excluded.unit, user_id = excluded.user_id, \
     raw_row = excluded.raw_row, updated_at = excluded.updated_at";

/// The `lab_enrichment` key/value table, unique by `(qr_code, param)`.
#[derive(Clone)]
pub struct EnrichmentStore {
    pool: SqlitePool,
    write_timeout: Duration,
}

impl EnrichmentStore {
    pub async fn open(path: &Path, write_timeout: Duration) -> Result<Self, StorageError> {
        let pool = open_pool(path, true, 4).await?;
        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn open_and_migrate(
        path: &Path,
        write_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let store = Self::open(path, write_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StorageError::Timeout)??;
        Ok(())
    }

    /// Writes every record in one transaction; last write wins per `(qr_code, param)`.
    pub async fn upsert_all(&self, records: &[LabEnrichmentRecord]) -> Result<u64, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }

        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;
            for record in records {
                sqlx::query(UPSERT_SQL)
                    .bind(&record.qr_code)
                    .bind(&record.param)
                    .bind(&record.value)
                    .bind(record.unit.as_deref())
                    .bind(&record.user_id)
                    .bind(&record.raw_row)
                    .bind(&record.updated_at)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|_| StorageError::Timeout)??;

        Ok(records.len() as u64)
    }

    pub async fn count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lab_enrichment")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn get(
        &self,
        qr_code: &str,
        param: &str,
    ) -> Result<Option<LabEnrichmentRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT qr_code, param, value, unit, user_id, raw_row, updated_at \
             FROM lab_enrichment WHERE qr_code = ? AND param = ?",
        )
        .bind(qr_code)
        .bind(param)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(LabEnrichmentRecord {
            qr_code: row.try_get("qr_code")?,
            param: row.try_get("param")?,
            value: row.try_get::<Option<String>, _>("value")?.unwrap_or_default(),
            unit: row.try_get("unit")?,
            user_id: row.try_get::<Option<String>, _>("user_id")?.unwrap_or_default(),
            raw_row: row.try_get::<Option<String>, _>("raw_row")?.unwrap_or_default(),
            updated_at: row.try_get("updated_at")?,
        }))
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        tokio::time::timeout(
            Duration::from_secs(2),
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| StorageError::Timeout)??;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
