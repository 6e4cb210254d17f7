//! Out-of-band maintenance for the mail outbox.
//!
//! Every subcommand prints a JSON report on stdout and logs through the
//! shared tracing setup on stderr.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use crm_domain::delivery::DeliveryWorker;
use crm_domain::diagnostics::OutboxDiagnostics;
use crm_infra::relay::{SmtpRelay, SmtpRelayConfig};
use crm_infra::wiring::Backends;
use crm_infra::{config::AppConfig, logging::init_tracing};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "crm-tools", version, about = "Mail outbox diagnostics and repair")]
struct Cli {
    /// Outbox collection to operate on. Defaults to OUTBOX_COLLECTION.
    #[arg(long, global = true)]
    collection: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count documents per delivery state and list problem documents.
    Scan {
        #[arg(long, default_value_t = 5)]
        examples: usize,
    },
    /// Write an empty attachments list on documents that lack the field.
    Repair,
    /// Move every document from the legacy collection into the canonical one.
    Migrate {
        #[arg(long, env = "MIGRATE_BATCH_SIZE")]
        batch_size: Option<usize>,
    },
    /// Queue a synthetic mail and wait for it to reach a terminal state.
    SendTest {
        #[arg(long)]
        to: String,
        #[arg(long, env = "SEND_TEST_WAIT_MS")]
        wait_ms: Option<u64>,
        /// Deliver from this process instead of relying on a running worker.
        #[arg(long)]
        inline_worker: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load()?;
    if let Some(collection) = cli.collection {
        config.outbox_collection = collection;
    }
    init_tracing(&config)?;

    let backends = Backends::from_config(&config).await?;
    backends
        .probe
        .health_check()
        .await
        .with_context(|| format!("{} backend is unreachable", backends.probe.backend()))?;

    let report = match cli.command {
        Command::Scan { examples } => {
            let diagnostics =
                OutboxDiagnostics::new(backends.outbox.clone()).with_examples_per_state(examples);
            serde_json::to_value(diagnostics.scan().await?)?
        }
        Command::Repair => {
            let diagnostics = OutboxDiagnostics::new(backends.outbox.clone());
            serde_json::to_value(diagnostics.repair().await?)?
        }
        Command::Migrate { batch_size } => {
            let diagnostics = OutboxDiagnostics::new(backends.outbox.clone());
            let batch_size = batch_size.unwrap_or(config.migrate_batch_size);
            let report = diagnostics
                .migrate(backends.legacy_outbox.as_ref(), batch_size)
                .await?;
            serde_json::to_value(report)?
        }
        Command::SendTest {
            to,
            wait_ms,
            inline_worker,
        } => {
            let wait = wait_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.send_test_wait());
            let worker = if inline_worker {
                let relay = Arc::new(SmtpRelay::new(SmtpRelayConfig::from_app_config(&config))?);
                let worker = Arc::new(
                    DeliveryWorker::new(backends.outbox.clone(), relay)
                        .with_relay_timeout(config.relay_timeout()),
                );
                let changes = backends.changes.subscribe().await?;
                Some(tokio::spawn(worker.serve(changes)))
            } else {
                None
            };
            let diagnostics = OutboxDiagnostics::new(backends.outbox.clone());
            let report = diagnostics.send_test(&to, wait).await?;
            if let Some(handle) = worker {
                handle.abort();
            }
            if report.timed_out {
                tracing::warn!(
                    mail_id = %report.mail_id,
                    "test mail did not reach a terminal state"
                );
            }
            serde_json::to_value(report)?
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "backend": backends.probe.backend(),
            "collection": backends.outbox.collection(),
            "report": report,
        }))?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_test_arguments() {
        let cli = Cli::try_parse_from([
            "crm-tools",
            "send-test",
            "--to",
            "ops@example.com",
            "--wait-ms",
            "1500",
            "--inline-worker",
        ])
        .expect("parse");
        match cli.command {
            Command::SendTest {
                to,
                wait_ms,
                inline_worker,
            } => {
                assert_eq!(to, "ops@example.com");
                assert_eq!(wait_ms, Some(1500));
                assert!(inline_worker);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn collection_override_is_global() {
        let cli =
            Cli::try_parse_from(["crm-tools", "scan", "--collection", "mail"]).expect("parse");
        assert_eq!(cli.collection.as_deref(), Some("mail"));
        assert!(matches!(cli.command, Command::Scan { examples: 5 }));
    }

    #[test]
    fn migrate_requires_no_arguments() {
        let cli = Cli::try_parse_from(["crm-tools", "migrate"]).expect("parse");
        assert!(matches!(cli.command, Command::Migrate { .. }));
    }
}
