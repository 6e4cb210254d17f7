//! Operator utilities that run against an outbox out of band: scan, repair,
//! migrate and send-test. Each is safe to re-run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::{Instant, sleep};

use crate::DomainResult;
use crate::error::DomainError;
use crate::mail::{DeliveryState, DeliveryStateKind, MailDocument, MailMessage, TemplateMetadata};
use crate::ports::outbox::{MAX_ATOMIC_WRITES, MailListQuery, MailOutboxRepository};
use crate::util::{format_ms_rfc3339, now_ms};

pub const DEFAULT_SEND_TEST_WAIT: Duration = Duration::from_secs(30);
const SEND_TEST_POLL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, Serialize)]
pub struct ScanExample {
    pub mail_id: String,
    pub to: Vec<String>,
    pub subject: Option<String>,
    pub created_at: String,
    pub problems: Vec<&'static str>,
    pub error_code: Option<String>,
}

impl ScanExample {
    fn from_document(document: &MailDocument) -> Self {
        Self {
            mail_id: document.mail_id.clone(),
            to: document.to.clone(),
            subject: document.message.subject.clone(),
            created_at: format_ms_rfc3339(document.created_at_ms),
            problems: document.diagnose(),
            error_code: match &document.delivery {
                DeliveryState::Error { code, .. } => Some(code.clone()),
                _ => None,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScanReport {
    pub collection: String,
    pub total: usize,
    pub counts: BTreeMap<DeliveryStateKind, usize>,
    pub examples: BTreeMap<DeliveryStateKind, Vec<ScanExample>>,
    pub missing_attachments: usize,
    /// Unset documents the worker would reject or never pick up.
    pub problems: Vec<ScanExample>,
}

impl ScanReport {
    pub fn count(&self, kind: DeliveryStateKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct RepairReport {
    pub candidates: usize,
    pub repaired: usize,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub legacy_before: u64,
    pub canonical_before: u64,
    pub already_migrated: u64,
    pub copied: usize,
    pub deleted: usize,
    pub batches: usize,
    pub canonical_after: u64,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("batch size must be between 1 and {MAX_ATOMIC_WRITES}, got {0}")]
    InvalidBatchSize(usize),
    #[error("legacy and canonical collections are both '{0}'")]
    SameCollection(String),
    #[error("batch {batch} failed: {source}")]
    Batch {
        batch: usize,
        #[source]
        source: DomainError,
    },
    #[error(
        "post-migration count mismatch: legacy has {legacy_remaining} left, canonical has {canonical_actual} (expected {canonical_expected})"
    )]
    CountMismatch {
        legacy_remaining: u64,
        canonical_expected: u64,
        canonical_actual: u64,
    },
    #[error(transparent)]
    Store(#[from] DomainError),
}

#[derive(Clone, Debug, Serialize)]
pub struct SendTestReport {
    pub mail_id: String,
    pub state: DeliveryState,
    pub waited_ms: u128,
    pub timed_out: bool,
}

#[derive(Clone)]
pub struct OutboxDiagnostics {
    outbox: Arc<dyn MailOutboxRepository>,
    examples_per_state: usize,
}

impl OutboxDiagnostics {
    pub fn new(outbox: Arc<dyn MailOutboxRepository>) -> Self {
        Self {
            outbox,
            examples_per_state: 5,
        }
    }

    pub fn with_examples_per_state(mut self, examples_per_state: usize) -> Self {
        self.examples_per_state = examples_per_state;
        self
    }

    pub async fn scan(&self) -> DomainResult<ScanReport> {
        let documents = self.outbox.list(&MailListQuery::default()).await?;
        let mut report = ScanReport {
            collection: self.outbox.collection().to_string(),
            total: documents.len(),
            counts: DeliveryStateKind::ALL.into_iter().map(|kind| (kind, 0)).collect(),
            examples: BTreeMap::new(),
            missing_attachments: 0,
            problems: Vec::new(),
        };

        for document in &documents {
            let kind = document.delivery.kind();
            *report.counts.entry(kind).or_default() += 1;
            let examples = report.examples.entry(kind).or_default();
            if examples.len() < self.examples_per_state {
                examples.push(ScanExample::from_document(document));
            }
            if !document.is_dispatch_ready() {
                report.missing_attachments += 1;
            }
            if kind == DeliveryStateKind::Unset && !document.diagnose().is_empty() {
                report.problems.push(ScanExample::from_document(document));
            }
        }

        tracing::info!(
            collection = %report.collection,
            total = report.total,
            unset = report.count(DeliveryStateKind::Unset),
            processing = report.count(DeliveryStateKind::Processing),
            success = report.count(DeliveryStateKind::Success),
            error = report.count(DeliveryStateKind::Error),
            missing_attachments = report.missing_attachments,
            "outbox scan finished"
        );
        Ok(report)
    }

    /// Writes an empty attachment list to every document missing one. The
    /// field write is what wakes the worker for those documents.
    pub async fn repair(&self) -> DomainResult<RepairReport> {
        let candidates = self
            .outbox
            .list(&MailListQuery {
                missing_attachments: true,
                ..MailListQuery::default()
            })
            .await?;
        let mut report = RepairReport {
            candidates: candidates.len(),
            repaired: 0,
        };
        for document in candidates {
            if self.outbox.set_empty_attachments(&document.mail_id).await? {
                tracing::info!(mail_id = %document.mail_id, "attachments field added");
                report.repaired += 1;
            }
        }
        Ok(report)
    }

    /// Moves every document from `legacy` into this outbox. Copies are written
    /// first, in batches of at most `batch_size`; originals are deleted only
    /// once every copy is committed. A re-run after a partial failure picks up
    /// where the previous one stopped.
    pub async fn migrate(
        &self,
        legacy: &dyn MailOutboxRepository,
        batch_size: usize,
    ) -> Result<MigrationReport, MigrationError> {
        if batch_size == 0 || batch_size > MAX_ATOMIC_WRITES {
            return Err(MigrationError::InvalidBatchSize(batch_size));
        }
        if legacy.collection() == self.outbox.collection() {
            return Err(MigrationError::SameCollection(
                legacy.collection().to_string(),
            ));
        }

        let legacy_before = legacy.count().await?;
        let canonical_before = self.outbox.count().await?;
        let originals = legacy.list(&MailListQuery::default()).await?;

        let migrated_at_ms = now_ms();
        let mut copies = Vec::with_capacity(originals.len());
        let mut already_migrated = 0u64;
        for original in &originals {
            let copy = original.migrated_copy(migrated_at_ms);
            if self.outbox.get(&copy.mail_id).await?.is_some() {
                already_migrated += 1;
            }
            copies.push(copy);
        }

        let mut report = MigrationReport {
            legacy_before,
            canonical_before,
            already_migrated,
            ..MigrationReport::default()
        };

        for chunk in copies.chunks(batch_size) {
            report.batches += 1;
            let written = self
                .outbox
                .write_batch(chunk)
                .await
                .map_err(|source| MigrationError::Batch {
                    batch: report.batches,
                    source,
                })?;
            report.copied += written;
            tracing::info!(batch = report.batches, written, "migration copy batch committed");
        }

        let original_ids: Vec<String> = originals
            .iter()
            .map(|document| document.mail_id.clone())
            .collect();
        for chunk in original_ids.chunks(batch_size) {
            report.batches += 1;
            let deleted = legacy
                .delete_batch(chunk)
                .await
                .map_err(|source| MigrationError::Batch {
                    batch: report.batches,
                    source,
                })?;
            report.deleted += deleted;
        }

        let legacy_after = legacy.count().await?;
        report.canonical_after = self.outbox.count().await?;
        let canonical_expected = canonical_before + legacy_before - already_migrated;
        if legacy_after != 0 || report.canonical_after != canonical_expected {
            tracing::error!(
                legacy_after,
                canonical_after = report.canonical_after,
                canonical_expected,
                "migration verification failed"
            );
            return Err(MigrationError::CountMismatch {
                legacy_remaining: legacy_after,
                canonical_expected,
                canonical_actual: report.canonical_after,
            });
        }

        tracing::info!(
            copied = report.copied,
            deleted = report.deleted,
            canonical_after = report.canonical_after,
            "migration verified"
        );
        Ok(report)
    }

    /// Enqueues a synthetic document and polls until it reaches a terminal
    /// state or `wait` elapses.
    pub async fn send_test(&self, to: &str, wait: Duration) -> DomainResult<SendTestReport> {
        if to.trim().is_empty() {
            return Err(DomainError::Validation("send-test recipient is required".into()));
        }
        let sent_at = format_ms_rfc3339(now_ms());
        let mut document = MailDocument::new(
            vec![to.trim().to_string()],
            MailMessage {
                subject: Some(format!("Outbox delivery test {sent_at}")),
                html: Some(format!(
                    "<p>Outbox delivery test.</p><p>Queued at {sent_at}.</p>"
                )),
                text: Some(format!("Outbox delivery test.\nQueued at {sent_at}.")),
            },
        );
        document.template = Some(TemplateMetadata {
            name: "send-test".to_string(),
            data: BTreeMap::new(),
        });
        let created = self.outbox.create(&document).await?;
        tracing::info!(mail_id = %created.mail_id, to, "test mail queued");

        let started = Instant::now();
        let deadline = started + wait;
        loop {
            let current = self
                .outbox
                .get(&created.mail_id)
                .await?
                .ok_or(DomainError::NotFound)?;
            let terminal = current.delivery.is_terminal();
            if terminal || Instant::now() >= deadline {
                return Ok(SendTestReport {
                    mail_id: created.mail_id,
                    state: current.delivery,
                    waited_ms: started.elapsed().as_millis(),
                    timed_out: !terminal,
                });
            }
            sleep(SEND_TEST_POLL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }
}
