use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crm_domain::delivery::ProcessOutcome;
use crm_domain::sweep::SweepReport;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const DELIVERY_TOTAL: &str = "crm_worker_delivery_total";
const DELIVERY_DURATION_MS: &str = "crm_worker_delivery_duration_ms";
const SWEEP_PROCESSED_TOTAL: &str = "crm_worker_sweep_processed_total";
const OUTBOX_PENDING_GAUGE: &str = "crm_worker_outbox_pending_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the recorder and serves `/metrics` on `listen_addr` from a
/// background task for as long as the runtime lives.
pub fn init_metrics(listen_addr: &str) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("invalid metrics listen address {listen_addr}"))?;
    let (recorder, exporter) = PrometheusBuilder::new().with_http_listener(addr).build()?;
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|_| anyhow!("a metrics recorder is already installed"))?;
    tokio::spawn(async move {
        if let Err(err) = exporter.await {
            tracing::error!(error = ?err, "metrics listener stopped");
        }
    });
    let _ = METRICS_HANDLE.set(handle);
    tracing::info!(%addr, "metrics endpoint listening");
    Ok(())
}

pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn register_delivery(outcome: &ProcessOutcome, elapsed: Duration) {
    let state = outcome.label();
    counter!(DELIVERY_TOTAL, "state" => state).increment(1);
    histogram!(DELIVERY_DURATION_MS, "state" => state).record(elapsed.as_secs_f64() * 1_000.0);
}

pub fn register_sweep(report: &SweepReport) {
    for (result, count) in [
        ("mailed", report.mailed),
        ("already_queued", report.already_queued),
        ("skipped", report.skipped_without_credential),
        ("failed", report.failed),
    ] {
        if count > 0 {
            counter!(SWEEP_PROCESSED_TOTAL, "result" => result).increment(count as u64);
        }
    }
}

pub fn set_outbox_pending(pending: u64) {
    gauge!(OUTBOX_PENDING_GAUGE).set(pending as f64);
}
