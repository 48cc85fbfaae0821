//! Observability wiring for the control-plane service.
//!
//! # Purpose
//! Initializes structured logging and the process-wide Prometheus recorder,
//! and registers descriptions for the metrics the control plane emits.
//!
//! # Notes
//! Initialization is guarded by `OnceLock` to keep startup idempotent in tests.
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static OBS_INIT: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber (`RUST_LOG`, default `info`) and the
/// metrics recorder. Safe to call more than once.
pub fn init_observability(service_name: &str) -> PrometheusHandle {
    OBS_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();
        tracing::debug!(service = service_name, "tracing initialized");
    });

    install_metrics_recorder()
}

/// Render the current metrics in the Prometheus text format.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    handle.render()
}

fn describe_metrics() {
    metrics::describe_counter!(
        "controlplane_mutations_applied_total",
        "Mutations applied to local storage, by type"
    );
    metrics::describe_histogram!(
        "controlplane_apply_latency_seconds",
        metrics::Unit::Seconds,
        "Time from submitting a mutation to its local apply"
    );
    metrics::describe_counter!(
        "tenant_migrations_total",
        "Tenant schema migrations, by outcome"
    );
    metrics::describe_counter!("tenant_pool_created_total", "Tenant database pools opened");
    metrics::describe_counter!("tenant_cache_created_total", "Tenant cache clients opened");
    metrics::describe_counter!("signing_key_rotations_total", "Signing key rotations written");
    metrics::describe_counter!("raft_elections_total", "Elections started by this node");
    metrics::describe_gauge!("raft_commit_index", "Highest committed log index");
}

fn install_metrics_recorder() -> PrometheusHandle {
    if let Some(handle) = METRICS_HANDLE.get() {
        return handle.clone();
    }
    let handle = METRICS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder");
        describe_metrics();
        handle
    });
    handle.clone()
}
