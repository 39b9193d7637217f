//! Logging setup and federation metrics instruments.

use once_cell::sync::{Lazy, OnceCell};
use opentelemetry::metrics::{Counter, Histogram, Meter};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{FlError, Result};

pub const JSON_LOG_ENV: &str = "TALOS_JSON_LOG";

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber once per process. `RUST_LOG` filters (default `info`);
/// `TALOS_JSON_LOG=1` switches to flattened JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let json = std::env::var(JSON_LOG_ENV).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        let installed = if json {
            registry.with(fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false)).try_init()
        } else {
            registry.with(fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true)).try_init()
        };
        installed.map_err(|e| FlError::Telemetry(e.to_string()))
    })?;
    info!(service, "tracing initialized");
    Ok(())
}

#[derive(Clone, Debug)]
pub struct FlMetrics {
    pub rounds_completed: Counter<u64>,
    pub client_updates: Counter<u64>,
    pub client_failures: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
    pub mask_sparsity: Histogram<f64>,
}

static FL_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("talos_federation"));

/// No-ops until the host process installs a meter provider.
pub static FL_METRICS: Lazy<FlMetrics> = Lazy::new(|| FlMetrics {
    rounds_completed: FL_METER.u64_counter("fl_rounds_completed_total").with_description("Federated rounds aggregated").build(),
    client_updates: FL_METER.u64_counter("fl_client_updates_total").with_description("Client updates accepted for aggregation").build(),
    client_failures: FL_METER.u64_counter("fl_client_failures_total").with_description("Selected clients that produced no update").build(),
    aggregation_latency_ms: FL_METER
        .f64_histogram("fl_aggregation_latency_ms")
        .with_description("FedAvg reduction latency (ms)")
        .with_unit("ms")
        .build(),
    mask_sparsity: FL_METER.f64_histogram("fl_mask_sparsity").with_description("Realized sparsity of calibrated client masks").build(),
});
