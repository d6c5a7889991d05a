use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static AUTH_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static LAB_ENRICHMENT_RECORDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("soilrepo_http_requests_total", "Data API HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create soilrepo_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "soilrepo_http_request_duration_seconds",
                    "Data API HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create soilrepo_http_request_duration_seconds"),
        )
    })
}

fn auth_outcomes_total() -> &'static IntCounterVec {
    AUTH_OUTCOMES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "soilrepo_auth_outcomes_total",
                    "Resolved authentication mechanism per request.",
                ),
                &["mechanism"],
            )
            .expect("create soilrepo_auth_outcomes_total"),
        )
    })
}

fn lab_enrichment_records_total() -> &'static IntCounterVec {
    LAB_ENRICHMENT_RECORDS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "soilrepo_lab_enrichment_records_total",
                    "Lab enrichment records upserted and input rows skipped.",
                ),
                &["outcome"],
            )
            .expect("create soilrepo_lab_enrichment_records_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

/// `mechanism` is `api_key`, `bearer`, `session` or `none`.
pub fn observe_auth(mechanism: &str) {
    auth_outcomes_total().with_label_values(&[mechanism]).inc();
}

pub fn observe_lab_records(processed: u64, skipped: u64) {
    lab_enrichment_records_total()
        .with_label_values(&["processed"])
        .inc_by(processed);
    lab_enrichment_records_total()
        .with_label_values(&["skipped"])
        .inc_by(skipped);
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = auth_outcomes_total();
    let _ = lab_enrichment_records_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
