//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,orrery=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Start the Prometheus exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

pub fn record_commit(objects: usize, duration_us: u64) {
    metrics::counter!("orrery_commits_total").increment(1);
    metrics::histogram!("orrery_commit_objects").record(objects as f64);
    metrics::histogram!("orrery_commit_duration_us").record(duration_us as f64);
}

/// `reason` is one of `journal`, `sync`, `must_abort`.
pub fn record_commit_failure(reason: &str) {
    metrics::counter!("orrery_commit_failures_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_rollback(restored: bool) {
    metrics::counter!("orrery_rollbacks_total", "restored" => restored.to_string()).increment(1);
}

pub fn record_journal_transactions(count: u64) {
    metrics::gauge!("orrery_journal_transactions").set(count as f64);
}

pub fn record_dispatch(channel: &str, outcome: &str, duration_us: u64) {
    metrics::counter!(
        "orrery_sync_dispatch_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    metrics::histogram!("orrery_sync_dispatch_duration_us", "channel" => channel.to_string())
        .record(duration_us as f64);
}

pub fn record_sync_queue(channel: &str, queued: usize) {
    metrics::gauge!("orrery_sync_queue_size", "channel" => channel.to_string()).set(queued as f64);
}

pub fn record_audit_counters(total_events: u64, failed_writes: u64, mails_sent: u64) {
    metrics::gauge!("orrery_audit_events").set(total_events as f64);
    metrics::gauge!("orrery_audit_failed_writes").set(failed_writes as f64);
    metrics::gauge!("orrery_audit_mails_sent").set(mails_sent as f64);
}
