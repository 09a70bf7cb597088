use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static CONFIG_RELOADS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static DROPPED_BODIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

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

fn decisions_total() -> &'static IntCounterVec {
    DECISIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "gatehouse_decisions_total",
                    "Authorization decisions by policy package and outcome.",
                ),
                &["package", "outcome"],
            )
            .expect("create gatehouse_decisions_total"),
        )
    })
}

fn request_duration_seconds() -> &'static HistogramVec {
    REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "gatehouse_request_duration_seconds",
                    "Decision pipeline duration in seconds.",
                )
                .buckets(vec![
                    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ]),
                &["outcome"],
            )
            .expect("create gatehouse_request_duration_seconds"),
        )
    })
}

fn config_reloads_total() -> &'static IntCounterVec {
    CONFIG_RELOADS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "gatehouse_config_reloads_total",
                    "Configuration reload attempts by result.",
                ),
                &["result"],
            )
            .expect("create gatehouse_config_reloads_total"),
        )
    })
}

fn dropped_bodies_total() -> &'static IntCounterVec {
    DROPPED_BODIES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "gatehouse_dropped_query_bodies_total",
                    "Query bodies dropped during preprocessing or translation.",
                ),
                &["code"],
            )
            .expect("create gatehouse_dropped_query_bodies_total"),
        )
    })
}

/// `package` is empty when the request failed before routing.
pub fn observe_decision(package: &str, outcome: &str, duration: Duration) {
    let package = if package.is_empty() { "-" } else { package };
    decisions_total()
        .with_label_values(&[package, outcome])
        .inc();
    request_duration_seconds()
        .with_label_values(&[outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_config_reload(result: &str) {
    config_reloads_total().with_label_values(&[result]).inc();
}

pub fn inc_dropped_body(code: &str) {
    dropped_bodies_total().with_label_values(&[code]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = decisions_total();
    let _ = request_duration_seconds();
    let _ = config_reloads_total();
    let _ = dropped_bodies_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
