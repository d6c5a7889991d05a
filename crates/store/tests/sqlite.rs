use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use soilrepo_contracts::LabEnrichmentRecord;
use soilrepo_policy::FieldPolicy;
use soilrepo_store::{
    EnrichmentStore, IntrospectedSchema, QueryExecutor, SchemaProvider, SqliteExecutor,
    StorageError,
};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;

fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("soilrepo-{}-{}.db", label, ulid::Ulid::new()))
}

async fn fresh_pool(path: &Path) -> SqlitePool {
    SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true),
    )
    .await
    .expect("sqlite connect should succeed")
}

async fn exec(pool: &SqlitePool, sql: &str) {
    sqlx::query(sql)
        .execute(pool)
        .await
        .unwrap_or_else(|err| panic!("`{sql}` failed: {err}"));
}

async fn seed_legacy(pool: &SqlitePool) {
    exec(
        pool,
        "CREATE TABLE samples (sampleId TEXT, collectedAt TEXT, GPS_long REAL, GPS_lat REAL, \
         PH_ph REAL, email TEXT, userId TEXT, QA_state TEXT)",
    )
    .await;
    for (id, at, lon, lat, ph) in [
        ("S1", "2024-05-01T10:00:00Z", 10.5, 45.5, 6.1),
        ("S2", "2024-05-02T10:00:00Z", 11.0, 46.0, 6.8),
        ("S3", "2024-05-03T10:00:00Z", 11.9, 46.9, 7.2),
        ("S4", "2024-06-01T10:00:00Z", 2.35, 48.85, 5.5),
        ("S5", "2024-06-02T10:00:00Z", -3.7, 40.4, 8.0),
    ] {
        sqlx::query(
            "INSERT INTO samples (sampleId, collectedAt, GPS_long, GPS_lat, PH_ph, email, userId, QA_state) \
             VALUES (?, ?, ?, ?, ?, 'someone@example.org', 'u-1', 'ok')",
        )
        .bind(id)
        .bind(at)
        .bind(lon)
        .bind(lat)
        .bind(ph)
        .execute(pool)
        .await
        .expect("seed insert should succeed");
    }
}

fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn page_and_count_agree_under_filters() {
    let path = temp_db_path("legacy");
    let pool = fresh_pool(&path).await;
    seed_legacy(&pool).await;

    let schema = IntrospectedSchema::new(pool.clone(), None, Duration::from_secs(60))
        .resolve()
        .await
        .expect("schema should resolve");
    assert_eq!(schema.table_name, "samples");
    assert!(schema.has_geo);

    let executor = SqliteExecutor::new(pool.clone(), Duration::from_secs(5));
    let policy = FieldPolicy::standard();

    let filter = soilrepo_filter::compile(
        &query(&[("bbox", "10,45,12,47"), ("fields", "*"), ("order", "sampleId"), ("dir", "asc")]),
        &schema,
        &policy,
    )
    .expect("filter should compile");

    let page = executor
        .fetch_page(&schema, &filter)
        .await
        .expect("page should load");
    assert_eq!(page.total, 3);
    assert_eq!(page.rows.len(), 3);
    assert_eq!(
        executor.count(&schema, &filter).await.expect("count should load"),
        3
    );
    assert!(!page.fields.iter().any(|f| f == "email" || f == "userId" || f == "QA_state"));
    let ids = page
        .rows
        .iter()
        .map(|row| page.row_object(row)["sampleId"].clone())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![Value::from("S1"), Value::from("S2"), Value::from("S3")]);

    let windowed = soilrepo_filter::compile(
        &query(&[("from", "2024-05-02"), ("to", "2024-06-01"), ("limit", "1")]),
        &schema,
        &policy,
    )
    .expect("filter should compile");
    let page = executor
        .fetch_page(&schema, &windowed)
        .await
        .expect("page should load");
    assert_eq!(page.rows.len(), 1);
    assert_eq!(page.total, 3);
    // default order is collectedAt desc
    assert_eq!(page.row_object(&page.rows[0])["sampleId"], "S4");

    pool.close().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn bbox_around_origin_skips_rows_without_numeric_coordinates() {
    let path = temp_db_path("origin");
    let pool = fresh_pool(&path).await;
    exec(&pool, "CREATE TABLE samples (sampleId TEXT, GPS_long, GPS_lat)").await;
    exec(
        &pool,
        "INSERT INTO samples VALUES \
         ('real', 0.2, -0.3), \
         ('text', ' 0.5 ', '0.25'), \
         ('blank', '', ''), \
         ('missing', NULL, NULL), \
         ('words', 'n/a', 'unknown'), \
         ('half', 0.1, '')",
    )
    .await;

    let schema = IntrospectedSchema::new(pool.clone(), None, Duration::ZERO)
        .resolve()
        .await
        .expect("schema should resolve");
    let filter = soilrepo_filter::compile(
        &query(&[("bbox", "-1,-1,1,1"), ("fields", "sampleId"), ("order", "sampleId"), ("dir", "asc")]),
        &schema,
        &FieldPolicy::standard(),
    )
    .expect("filter should compile");

    let executor = SqliteExecutor::new(pool.clone(), Duration::from_secs(5));
    let page = executor
        .fetch_page(&schema, &filter)
        .await
        .expect("page should load");
    let ids = page
        .rows
        .iter()
        .map(|row| page.row_object(row)["sampleId"].clone())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![Value::from("real"), Value::from("text")]);
    assert_eq!(page.total, 2);
    assert_eq!(executor.count(&schema, &filter).await.expect("count"), 2);

    pool.close().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn page_total_ignores_uncommitted_writes() {
    let path = temp_db_path("snapshot");
    let pool = fresh_pool(&path).await;
    seed_legacy(&pool).await;

    let executor = SqliteExecutor::open(&path, Duration::from_secs(5))
        .await
        .expect("executor should open");
    let schema = IntrospectedSchema::new(executor.pool().clone(), None, Duration::ZERO)
        .resolve()
        .await
        .expect("schema should resolve");
    let filter = soilrepo_filter::compile(
        &query(&[("limit", "1000")]),
        &schema,
        &FieldPolicy::standard(),
    )
    .expect("filter should compile");

    let mut writer = pool.begin().await.expect("writer should begin");
    sqlx::query("INSERT INTO samples (sampleId, collectedAt) VALUES ('S6', '2024-07-01T00:00:00Z')")
        .execute(&mut *writer)
        .await
        .expect("insert should succeed");

    let page = executor
        .fetch_page(&schema, &filter)
        .await
        .expect("page should load");
    assert_eq!(page.total, 5);
    assert_eq!(page.rows.len(), 5);

    writer.commit().await.expect("writer should commit");
    let page = executor
        .fetch_page(&schema, &filter)
        .await
        .expect("page should load");
    assert_eq!(page.total, 6);
    assert_eq!(page.rows.len() as u64, page.total);

    executor.close().await;
    pool.close().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn executor_drops_denied_fields_even_if_requested() {
    let path = temp_db_path("policy");
    let pool = fresh_pool(&path).await;
    seed_legacy(&pool).await;

    let schema = IntrospectedSchema::new(pool.clone(), None, Duration::ZERO)
        .resolve()
        .await
        .expect("schema should resolve");
    let mut filter = soilrepo_filter::compile(&query(&[]), &schema, &FieldPolicy::standard())
        .expect("filter should compile");
    filter.fields = vec!["sampleId".to_string(), "email".to_string()];

    let page = SqliteExecutor::new(pool.clone(), Duration::from_secs(5))
        .fetch_page(&schema, &filter)
        .await
        .expect("page should load");
    assert_eq!(page.fields, vec!["sampleId"]);
    assert!(page.rows.iter().all(|row| row.len() == 1));

    pool.close().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn table_discovery_follows_fallback_order() {
    let path = temp_db_path("discovery");
    let pool = fresh_pool(&path).await;

    let err = IntrospectedSchema::new(pool.clone(), None, Duration::ZERO)
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NoTables), "{err}");

    exec(&pool, "CREATE TABLE alpha (x TEXT)").await;
    let schema = IntrospectedSchema::new(pool.clone(), None, Duration::ZERO)
        .resolve()
        .await
        .expect("schema should resolve");
    assert_eq!(schema.table_name, "alpha");

    exec(&pool, "CREATE TABLE uploads (sampleId TEXT, PH_ph REAL)").await;
    let schema = IntrospectedSchema::new(pool.clone(), None, Duration::ZERO)
        .resolve()
        .await
        .expect("schema should resolve");
    assert_eq!(schema.table_name, "uploads");

    exec(&pool, "CREATE TABLE records (y TEXT)").await;
    let schema = IntrospectedSchema::new(pool.clone(), None, Duration::ZERO)
        .resolve()
        .await
        .expect("schema should resolve");
    assert_eq!(schema.table_name, "records");

    let schema = IntrospectedSchema::new(pool.clone(), Some("alpha".to_string()), Duration::ZERO)
        .resolve()
        .await
        .expect("schema should resolve");
    assert_eq!(schema.table_name, "alpha");

    let err = IntrospectedSchema::new(pool.clone(), Some("missing".to_string()), Duration::ZERO)
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::TableNotFound(_)), "{err}");

    pool.close().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn introspected_schema_is_cached_until_invalidated() {
    let path = temp_db_path("cache");
    let pool = fresh_pool(&path).await;
    exec(&pool, "CREATE TABLE samples (sampleId TEXT)").await;

    let provider = IntrospectedSchema::new(pool.clone(), None, Duration::from_secs(300));
    let first = provider.resolve().await.expect("schema should resolve");
    assert_eq!(first.available_columns, vec!["sampleId"]);

    exec(&pool, "ALTER TABLE samples ADD COLUMN PH_ph REAL").await;
    let cached = provider.resolve().await.expect("schema should resolve");
    assert_eq!(cached.available_columns, vec!["sampleId"]);

    provider.invalidate().await;
    let fresh = provider.resolve().await.expect("schema should resolve");
    assert_eq!(fresh.available_columns, vec!["sampleId", "PH_ph"]);

    pool.close().await;
    let _ = std::fs::remove_file(&path);
}

fn record(qr: &str, param: &str, value: &str, unit: Option<&str>) -> LabEnrichmentRecord {
    LabEnrichmentRecord {
        qr_code: qr.to_string(),
        param: param.to_string(),
        value: value.to_string(),
        unit: unit.map(str::to_string),
        user_id: "api".to_string(),
        raw_row: "{}".to_string(),
        updated_at: "2024-05-01T00:00:00Z".to_string(),
    }
}

#[tokio::test]
async fn enrichment_upsert_is_last_write_wins() {
    let path = temp_db_path("lab");
    let store = EnrichmentStore::open_and_migrate(&path, Duration::from_secs(5))
        .await
        .expect("store should open");
    store.migrate().await.expect("migrations should be idempotent");

    let written = store
        .upsert_all(&[
            record("AB12", "Cd", "0.1", Some("mg/kg")),
            record("AB12", "Pb", "3", None),
        ])
        .await
        .expect("upsert should succeed");
    assert_eq!(written, 2);
    assert_eq!(store.count().await.expect("count"), 2);

    store
        .upsert_all(&[record("AB12", "Cd", "0.2", None)])
        .await
        .expect("upsert should succeed");
    assert_eq!(store.count().await.expect("count"), 2);

    let cd = store
        .get("AB12", "Cd")
        .await
        .expect("get should succeed")
        .expect("record should exist");
    assert_eq!(cd.value, "0.2");
    assert_eq!(cd.unit, None);

    assert_eq!(store.get("AB12", "Zn").await.expect("get should succeed"), None);
    assert_eq!(store.upsert_all(&[]).await.expect("empty upsert"), 0);

    store.close().await;
    let _ = std::fs::remove_file(&path);
}
