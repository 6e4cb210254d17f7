mod observability;

use std::sync::Arc;

use crm_domain::delivery::DeliveryWorker;
use crm_domain::mail::DeliveryStateKind;
use crm_domain::notifications::NotificationProjector;
use crm_domain::outbox::OutboxWriter;
use crm_domain::ports::outbox::MailListQuery;
use crm_domain::sweep::WelcomeSweep;
use crm_infra::relay::{SmtpRelay, SmtpRelayConfig};
use crm_infra::wiring::Backends;
use crm_infra::{config::AppConfig, logging::init_tracing};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    if config.metrics_enabled {
        observability::init_metrics(&config.metrics_listen_addr)?;
    }

    let backends = Backends::from_config(&config).await?;
    backends.probe.health_check().await?;
    info!(
        backend = backends.probe.backend(),
        collection = backends.outbox.collection(),
        "worker starting"
    );

    let relay = Arc::new(SmtpRelay::new(SmtpRelayConfig::from_app_config(&config))?);
    let projector = NotificationProjector::new(backends.notifications.clone());
    let worker = Arc::new(
        DeliveryWorker::new(backends.outbox.clone(), relay)
            .with_relay_timeout(config.relay_timeout())
            .with_failure_notifications(projector),
    );
    let changes = backends.changes.subscribe().await?;
    let mut delivery = tokio::spawn(worker.serve_with(changes, |outcome, elapsed| {
        observability::register_delivery(outcome, elapsed);
    }));

    let sweep = WelcomeSweep::new(
        backends.notifications.clone(),
        backends.members.clone(),
        OutboxWriter::new(backends.outbox.clone()),
        config.login_url.clone(),
        config.company_name.clone(),
    );
    let pending_query = MailListQuery {
        state: Some(DeliveryStateKind::Unset),
        ..MailListQuery::default()
    };
    let mut ticker = tokio::time::interval(config.welcome_sweep_interval());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sweep.run_once().await {
                    Ok(report) => observability::register_sweep(&report),
                    Err(err) => warn!(error = %err, "welcome sweep failed"),
                }
                match backends.outbox.list(&pending_query).await {
                    Ok(pending) => observability::set_outbox_pending(pending.len() as u64),
                    Err(err) => warn!(error = %err, "failed to count pending outbox documents"),
                }
            }
            result = &mut delivery => {
                if let Err(err) = result {
                    error!(error = %err, "delivery task aborted");
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    if let Some(rendered) = observability::render_metrics() {
        tracing::debug!(metrics = %rendered, "final metrics snapshot");
    }
    info!("worker shutdown");
    Ok(())
}
