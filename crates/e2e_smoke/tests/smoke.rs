use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::Router;
use reqwest::StatusCode;
use serde_json::{Value, json};
use soilrepo_gateway::config::GatewayConfig;
use soilrepo_gateway::http::{AppState, routes};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const API_KEY: &str = "SOILREPO_CANARY_API_KEY_5f1c2a9e";

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    db_path: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(label: &str) -> Self {
        Self::start_with(label, &[]).await
    }

    async fn start_with(label: &str, extra: &[(&str, String)]) -> Self {
        let db_path =
            std::env::temp_dir().join(format!("soilrepo-e2e-{}-{}.db", label, ulid::Ulid::new()));
        seed_legacy_db(&db_path).await;

        let mut kv = HashMap::from([
            ("SOILREPO_BIND_ADDR".to_string(), "127.0.0.1:0".to_string()),
            (
                "SOILREPO_SQLITE_PATH".to_string(),
                db_path.to_string_lossy().to_string(),
            ),
            ("SOILREPO_API_KEY".to_string(), API_KEY.to_string()),
            ("SOILREPO_MAX_UPLOAD_BYTES".to_string(), "65536".to_string()),
        ]);
        kv.extend(extra.iter().map(|(k, v)| (k.to_string(), v.clone())));
        let config = GatewayConfig::from_kv(&kv).expect("gateway config should be valid");

        let state = AppState::build(config)
            .await
            .expect("gateway state should init");
        let (addr, shutdown, task) = spawn_server(routes(state.clone())).await;

        Self {
            addr,
            state,
            db_path,
            shutdown: Some(shutdown),
            task,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}/api/v1{}", self.addr, path)
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
        self.state.close().await;
        let _ = std::fs::remove_file(&self.db_path);
    }
}

async fn seed_legacy_db(path: &Path) {
    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true),
    )
    .await
    .expect("sqlite connect should succeed");

    sqlx::query(
        "CREATE TABLE samples (sampleId TEXT, collectedAt TEXT, GPS_long REAL, GPS_lat REAL, \
         PH_ph REAL, email TEXT, userId TEXT, QA_state TEXT)",
    )
    .execute(&pool)
    .await
    .expect("create table should succeed");

    for (id, at, lon, lat, ph) in [
        ("S1", "2024-05-01T10:00:00Z", 10.5, 45.5, 6.1),
        ("S2", "2024-05-02T10:00:00Z", 11.0, 46.0, 6.8),
        ("S3", "2024-05-03T10:00:00Z", 11.9, 46.9, 7.2),
        ("S4", "2024-06-01T10:00:00Z", 2.35, 48.85, 5.5),
        ("S5", "2024-06-02T10:00:00Z", -3.7, 40.4, 8.0),
    ] {
        sqlx::query(
            "INSERT INTO samples (sampleId, collectedAt, GPS_long, GPS_lat, PH_ph, email, userId, QA_state) \
             VALUES (?, ?, ?, ?, ?, 'volunteer@example.org', 'u-7', 'validated')",
        )
        .bind(id)
        .bind(at)
        .bind(lon)
        .bind(lat)
        .bind(ph)
        .execute(&pool)
        .await
        .expect("seed insert should succeed");
    }

    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_and_health_need_no_credentials() {
    init_test_tracing();
    let server = TestServer::start("health").await;
    let client = reqwest::Client::new();
    wait_for_healthz(&client, server.addr).await;

    let response = client.get(server.url("/ping")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({"ok": true}));

    let response = client
        .get(format!("http://{}/readyz", server.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.json::<Value>().await.unwrap();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["checks"]["sqlite"], true);
    assert!(body["checks"].get("canonical").is_none());

    let response = client
        .get(format!("http://{}/metrics", server.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_or_wrong_credentials_get_the_same_401() {
    let logs = init_test_tracing();
    let server = TestServer::start("auth").await;
    let client = reqwest::Client::new();
    wait_for_healthz(&client, server.addr).await;

    let attempts = [
        client.get(server.url("/samples?bbox=not,a,box&format=xml")),
        client
            .get(server.url("/samples"))
            .header("x-api-key", "wrong-key"),
        client
            .get(server.url("/samples/count"))
            .header("authorization", "Bearer not.a.jwt"),
        client
            .get(server.url("/canonical/samples"))
            .header("cookie", "soilrepo_session=unknown"),
        client.post(server.url("/lab-enrichment")).json(&json!([])),
    ];

    for request in attempts {
        let response = request.send().await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response.json::<Value>().await.unwrap();
        assert_eq!(body["code"], "ERR_AUTH_REQUIRED");
        assert_eq!(body["message"], "missing or invalid credentials");
    }

    for request in [
        client.get(server.url("/samples")).header("X-API-Key", API_KEY),
        client
            .get(server.url("/samples"))
            .header("Authorization", format!("ApiKey {API_KEY}")),
        client.get(server.url(&format!("/samples?api_key={API_KEY}"))),
    ] {
        assert_eq!(request.send().await.unwrap().status(), StatusCode::OK);
    }

    let token = server.state.sessions().issue("web-user");
    let response = client
        .get(server.url("/samples/count"))
        .header("cookie", format!("theme=dark; soilrepo_session={token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    server.state.sessions().revoke(&token);
    let response = client
        .get(server.url("/samples/count"))
        .header("cookie", format!("soilrepo_session={token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let log_text = String::from_utf8(logs.lock().unwrap().clone()).unwrap();
    assert!(!log_text.contains(API_KEY), "api key leaked into logs");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bbox_geojson_returns_only_features_inside_the_box() {
    init_test_tracing();
    let server = TestServer::start("geojson").await;
    let client = reqwest::Client::new();
    wait_for_healthz(&client, server.addr).await;

    let response = client
        .get(server.url(
            "/samples?bbox=10,45,12,47&fields=sampleId,GPS_long,GPS_lat&format=geojson",
        ))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/geo+json"
    );

    let body = response.json::<Value>().await.unwrap();
    assert_eq!(body["type"], "FeatureCollection");
    let features = body["features"].as_array().unwrap();
    assert_eq!(features.len(), 3);
    for feature in features {
        assert_eq!(feature["geometry"]["type"], "Point");
        let properties = feature["properties"].as_object().unwrap();
        assert_eq!(properties.keys().collect::<Vec<_>>(), vec!["sampleId"]);
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_fields_never_leave_the_api() {
    init_test_tracing();
    let server = TestServer::start("policy").await;
    let client = reqwest::Client::new();
    wait_for_healthz(&client, server.addr).await;

    let response = client
        .get(server.url("/samples?fields=*&limit=1000"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.json::<Value>().await.unwrap();
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 5);
    for row in data {
        let row = row.as_object().unwrap();
        assert!(row.contains_key("sampleId"));
        assert!(!row.contains_key("email"));
        assert!(!row.contains_key("userId"));
        assert!(!row.contains_key("QA_state"));
    }

    let response = client
        .get(server.url("/samples?fields=email,userId,QA_state,PH_ph&format=csv&order=sampleId&dir=asc"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/csv")
    );
    let text = response.text().await.unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("PH_ph"));
    assert_eq!(lines.next(), Some("6.1"));
    assert!(!text.contains("volunteer@example.org"));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn count_matches_unpaged_listing() {
    init_test_tracing();
    let server = TestServer::start("count").await;
    let client = reqwest::Client::new();
    wait_for_healthz(&client, server.addr).await;

    for filter in [
        "",
        "bbox=10,45,12,47",
        "from=2024-05-02&to=2024-06-01",
        "within=46,11,150",
        "from=2024-05-02T10:00&bbox=-10,35,20,50",
    ] {
        let count = client
            .get(server.url(&format!("/samples/count?{filter}")))
            .header("x-api-key", API_KEY)
            .send()
            .await
            .unwrap()
            .json::<Value>()
            .await
            .unwrap()["count"]
            .as_u64()
            .unwrap();

        let page = client
            .get(server.url(&format!("/samples?{filter}&limit=1000&offset=0")))
            .header("x-api-key", API_KEY)
            .send()
            .await
            .unwrap()
            .json::<Value>()
            .await
            .unwrap();

        assert_eq!(page["meta"]["count"].as_u64().unwrap(), count, "filter {filter}");
        assert_eq!(page["data"].as_array().unwrap().len() as u64, count, "filter {filter}");
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_filters_are_400_and_canonical_is_unavailable() {
    init_test_tracing();
    let server = TestServer::start("errors").await;
    let client = reqwest::Client::new();
    wait_for_healthz(&client, server.addr).await;

    for query in ["bbox=1,2,3", "within=46,11,-1", "from=yesterday", "format=xml", "limit=ten"] {
        let response = client
            .get(server.url(&format!("/samples?{query}")))
            .header("x-api-key", API_KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "query {query}");
        let body = response.json::<Value>().await.unwrap();
        assert_eq!(body["code"], "ERR_INVALID_PARAMS");
    }

    for path in ["/canonical/samples", "/canonical/all.zip", "/canonical/sample_images"] {
        let response = client
            .get(server.url(path))
            .header("x-api-key", API_KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR, "path {path}");
        let body = response.json::<Value>().await.unwrap();
        assert_eq!(body["code"], "ERR_STORAGE_UNAVAILABLE");
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn renamed_legacy_table_is_rediscovered_after_a_failed_read() {
    init_test_tracing();
    let server = TestServer::start("rename").await;
    let client = reqwest::Client::new();
    wait_for_healthz(&client, server.addr).await;

    let list = |client: &reqwest::Client| {
        client
            .get(server.url("/samples?fields=sampleId,PH_ph"))
            .header("x-api-key", API_KEY)
            .send()
    };
    let response = list(&client).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.json::<Value>().await.unwrap()["meta"]["count"], 5);

    let pool = SqlitePool::connect_with(SqliteConnectOptions::new().filename(&server.db_path))
        .await
        .unwrap();
    sqlx::query("ALTER TABLE samples RENAME TO field_samples")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    // The cached schema still names the old table.
    let response = list(&client).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.json::<Value>().await.unwrap()["code"],
        "ERR_STORAGE_UNAVAILABLE"
    );

    let response = list(&client).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.json::<Value>().await.unwrap();
    assert_eq!(body["meta"]["count"], 5);
    let rows = body["data"].as_array().unwrap();
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|row| row["PH_ph"].is_number()));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn canonical_zip_export_holds_three_scoped_entries() {
    let Some(db_url) = test_pg_url() else {
        eprintln!("skipping canonical export test; set SOILREPO_TEST_PG_URL to enable");
        return;
    };
    init_test_tracing();

    let schema_name = format!("soilrepo_e2e_{}", ulid::Ulid::new()).to_ascii_lowercase();
    let admin = sqlx::PgPool::connect(&db_url)
        .await
        .expect("DB connect should succeed");
    sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
        .execute(&admin)
        .await
        .expect("create schema should succeed");
    let schema_url = schema_db_url(&db_url, &schema_name);
    seed_canonical_db(&schema_url).await;

    let server =
        TestServer::start_with("export", &[("SOILREPO_CANONICAL_DB_URL", schema_url)]).await;
    let client = reqwest::Client::new();
    wait_for_healthz(&client, server.addr).await;

    let response = client
        .get(server.url("/canonical/all.zip?country=de&limit=1&fields=sample_id"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/zip");
    assert!(
        response.headers()["content-disposition"]
            .to_str()
            .unwrap()
            .contains("soilrepo_export.zip")
    );
    let bytes = response.bytes().await.unwrap();

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec()))
        .expect("body should be a complete archive");
    let mut names = archive.file_names().map(str::to_string).collect::<Vec<_>>();
    names.sort();
    assert_eq!(
        names,
        ["sample_images.csv", "sample_parameters.csv", "samples.csv"]
    );

    let samples = read_entry(&mut archive, "samples.csv");
    let header = samples[0].split(',').collect::<Vec<_>>();
    assert_eq!(header[0], "sample_id");
    assert!(header.contains(&"ph"));
    assert!(!header.contains(&"qa_state"));
    let ids = first_cells(&samples);
    assert_eq!(ids, ["s-1", "s-2"]);
    assert!(samples.iter().all(|line| !line.contains("validated")));

    let images = read_entry(&mut archive, "sample_images.csv");
    assert_eq!(images[0].split(',').next(), Some("sample_id"));
    assert!(images[0].contains("image_id"));
    assert_eq!(first_cells(&images), ["s-1", "s-2"]);

    let parameters = read_entry(&mut archive, "sample_parameters.csv");
    assert!(parameters[0].starts_with("sample_id,"));
    assert!(parameters[0].contains("parameter_code"));
    assert_eq!(first_cells(&parameters), ["s-1", "s-2"]);
    assert!(parameters.iter().all(|line| !line.contains("s-3")));

    server.stop().await;
    sqlx::query(&format!("DROP SCHEMA {} CASCADE", schema_name))
        .execute(&admin)
        .await
        .expect("drop schema should succeed");
    admin.close().await;
}

fn test_pg_url() -> Option<String> {
    std::env::var("SOILREPO_TEST_PG_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

const CANONICAL_DDL: &[&str] = &[
    "CREATE TABLE samples (sample_id TEXT PRIMARY KEY, qr_code TEXT, timestamp_utc TIMESTAMPTZ, \
     lat DOUBLE PRECISION, lon DOUBLE PRECISION, country_code TEXT, location_accuracy_m DOUBLE PRECISION, \
     ph NUMERIC, soil_texture_orig TEXT, soil_texture_en TEXT, soil_structure_orig TEXT, \
     soil_structure_en TEXT, earthworms_count INTEGER, contamination_plastic TEXT, \
     contamination_debris TEXT, contamination_other_orig TEXT, contamination_other_en TEXT, \
     observations_orig TEXT, observations_en TEXT, metals_info_orig TEXT, metals_info_en TEXT, \
     qa_state TEXT)",
    "CREATE TABLE sample_images (sample_id TEXT, image_id TEXT, country_code TEXT, image_url TEXT, \
     image_description_orig TEXT, image_description_en TEXT, collected_at TIMESTAMPTZ)",
    "CREATE TABLE sample_parameters (sample_id TEXT, country_code TEXT, parameter_code TEXT, \
     parameter_name TEXT, value TEXT, uom TEXT, analysis_method TEXT, analysis_date DATE, lab_id TEXT)",
];

async fn seed_canonical_db(url: &str) {
    let pool = sqlx::PgPool::connect(url)
        .await
        .expect("schema connect should succeed");
    for ddl in CANONICAL_DDL {
        sqlx::query(ddl)
            .execute(&pool)
            .await
            .expect("ddl should apply");
    }

    for (id, country, ts) in [
        ("s-1", "DE", "2024-05-01T10:00:00Z"),
        ("s-2", "de", "2024-05-02T10:00:00Z"),
        ("s-3", "IT", "2024-05-03T10:00:00Z"),
    ] {
        sqlx::query(
            "INSERT INTO samples (sample_id, country_code, lon, lat, timestamp_utc, ph, qa_state) \
             VALUES ($1, $2, 11.0, 46.0, $3::timestamptz, 6.5, 'validated')",
        )
        .bind(id)
        .bind(country)
        .bind(ts)
        .execute(&pool)
        .await
        .expect("insert sample should succeed");
        sqlx::query(
            "INSERT INTO sample_images (sample_id, image_id, country_code, collected_at) \
             VALUES ($1, $2, $3, $4::timestamptz)",
        )
        .bind(id)
        .bind(format!("img-{id}"))
        .bind(country)
        .bind(ts)
        .execute(&pool)
        .await
        .expect("insert image should succeed");
        sqlx::query(
            "INSERT INTO sample_parameters (sample_id, country_code, parameter_code, value, uom) \
             VALUES ($1, $2, 'Cd', '0.1', 'mg/kg')",
        )
        .bind(id)
        .bind(country)
        .execute(&pool)
        .await
        .expect("insert parameter should succeed");
    }
    pool.close().await;
}

fn read_entry(archive: &mut zip::ZipArchive<std::io::Cursor<Vec<u8>>>, name: &str) -> Vec<String> {
    let mut text = String::new();
    std::io::Read::read_to_string(&mut archive.by_name(name).unwrap(), &mut text).unwrap();
    text.lines().map(str::to_string).collect()
}

/// First column of every data line, sorted.
fn first_cells(lines: &[String]) -> Vec<String> {
    let mut cells = lines[1..]
        .iter()
        .filter_map(|line| line.split(',').next())
        .map(str::to_string)
        .collect::<Vec<_>>();
    cells.sort();
    cells
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lab_enrichment_upserts_by_qr_code_and_param() {
    init_test_tracing();
    let server = TestServer::start("lab").await;
    let client = reqwest::Client::new();
    wait_for_healthz(&client, server.addr).await;

    let response = client
        .post(server.url("/lab-enrichment"))
        .header("x-api-key", API_KEY)
        .json(&json!([{"qr_code": "ECHO-AB12", "Cd": 0.1, "Cd_unit": "mg/kg"}]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({"ok": true, "processed": 1, "skipped": 0})
    );

    let store = server.state.lab_store();
    let stored = store.get("AB12", "Cd").await.unwrap().expect("record stored");
    assert_eq!(stored.value, "0.1");
    assert_eq!(stored.unit.as_deref(), Some("mg/kg"));
    assert_eq!(stored.user_id, "api");

    let response = client
        .post(server.url("/lab-enrichment"))
        .header("x-api-key", API_KEY)
        .header("x-user-id", "lab-7")
        .json(&json!({"rows": [{"id": "AB12", "Cd": 0.25}, {"Cd": 1}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({"ok": true, "processed": 1, "skipped": 1})
    );
    assert_eq!(store.count().await.unwrap(), 1);
    let stored = store.get("AB12", "Cd").await.unwrap().unwrap();
    assert_eq!(stored.value, "0.25");
    assert_eq!(stored.user_id, "lab-7");

    let boundary = "soilrepoBoundary7d1e";
    let multipart = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nfirst batch\r\n\
         --{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"lab.csv\"\r\n\
         Content-Type: text/csv\r\n\r\nqr_code,Pb,Zn,unit\r\nABCD1234,3,5.5,ppm\r\n\r\n--{boundary}--\r\n"
    );
    let response = client
        .post(server.url("/lab-enrichment"))
        .header("x-api-key", API_KEY)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(multipart)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({"ok": true, "processed": 2, "skipped": 0})
    );
    let zn = store.get("ABCD-1234", "Zn").await.unwrap().unwrap();
    assert_eq!(zn.value, "5.5");
    assert_eq!(zn.unit.as_deref(), Some("ppm"));

    let response = client
        .post(server.url(&format!("/lab-enrichment?api_key={API_KEY}")))
        .header("content-type", "text/csv")
        .body("qr_code;pH\nXYZ9999;6.5\n")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({"ok": true, "processed": 1, "skipped": 0})
    );
    assert!(store.get("XYZ-9999", "pH").await.unwrap().is_some());
    assert_eq!(store.count().await.unwrap(), 4);

    for (content_type, body) in [
        ("application/json", r#"{"id":"AB12"}"#),
        ("image/png", "png"),
        ("multipart/form-data; boundary=x", "--x\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nv\r\n--x--\r\n"),
    ] {
        let response = client
            .post(server.url("/lab-enrichment"))
            .header("x-api-key", API_KEY)
            .header("content-type", content_type)
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{content_type}");
    }

    let response = client
        .post(server.url("/lab-enrichment"))
        .header("x-api-key", API_KEY)
        .header("content-type", "text/csv")
        .body(vec![b'a'; 70_000])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let response = client
        .get(server.url("/samples/count"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.json::<Value>().await.unwrap(), json!({"count": 5}));

    server.stop().await;
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

async fn wait_for_healthz(client: &reqwest::Client, addr: SocketAddr) {
    let url = format!("http://{}/healthz", addr);

    for _ in 0..50 {
        if let Ok(response) = client.get(&url).send().await
            && response.status().is_success()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    panic!("server did not become ready at {}", url);
}

struct TestWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut lock = self
            .buf
            .lock()
            .map_err(|_| std::io::Error::other("log mutex poisoned"))?;
        lock.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_test_tracing() -> Arc<Mutex<Vec<u8>>> {
    static LOG_BUF: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();

    LOG_BUF
        .get_or_init(|| {
            let buf = Arc::new(Mutex::new(Vec::new()));
            let make_writer = {
                let buf = buf.clone();
                move || TestWriter { buf: buf.clone() }
            };

            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
                .with_ansi(false)
                .with_writer(make_writer)
                .finish();

            tracing::subscriber::set_global_default(subscriber)
                .expect("global tracing subscriber should be set once");

            buf
        })
        .clone()
}
