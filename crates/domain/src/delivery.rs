//! Delivery worker: moves one outbox document through
//! `Unset -> Processing -> {Success, Error}`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::DomainResult;
use crate::error::DomainError;
use crate::mail::{DeliveryState, MALFORMED_DOCUMENT, MailDocument, RELAY_TIMEOUT};
use crate::notifications::NotificationProjector;
use crate::mail::DeliveryStateKind;
use crate::ports::outbox::{DeliveryTransition, MailListQuery, MailOutboxRepository, OutboxChange};
use crate::ports::relay::{MailRelay, RelayMessage};
use crate::templates::PARAM_INVITED_BY;
use crate::util::now_ms;

pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The attachments field is absent; the document waits for repair.
    NotDispatchReady,
    /// This invocation wrote the terminal state.
    Completed(DeliveryState),
    /// Another invocation already finished the document.
    AlreadyTerminal(DeliveryState),
}

impl ProcessOutcome {
    pub fn state(&self) -> Option<&DeliveryState> {
        match self {
            Self::NotDispatchReady => None,
            Self::Completed(state) | Self::AlreadyTerminal(state) => Some(state),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NotDispatchReady => "not_ready",
            Self::Completed(state) | Self::AlreadyTerminal(state) => state.kind().as_str(),
        }
    }
}

#[derive(Clone)]
pub struct DeliveryWorker {
    outbox: Arc<dyn MailOutboxRepository>,
    relay: Arc<dyn MailRelay>,
    projector: Option<NotificationProjector>,
    relay_timeout: Duration,
}

impl DeliveryWorker {
    pub fn new(outbox: Arc<dyn MailOutboxRepository>, relay: Arc<dyn MailRelay>) -> Self {
        Self {
            outbox,
            relay,
            projector: None,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
        }
    }

    pub fn with_relay_timeout(mut self, relay_timeout: Duration) -> Self {
        self.relay_timeout = relay_timeout;
        self
    }

    /// Failed invitation mails raise a `delivery_failed` notification for
    /// whoever sent the invitation.
    pub fn with_failure_notifications(mut self, projector: NotificationProjector) -> Self {
        self.projector = Some(projector);
        self
    }

    pub async fn process(&self, mail_id: &str) -> DomainResult<ProcessOutcome> {
        let document = self.outbox.get(mail_id).await?.ok_or(DomainError::NotFound)?;
        if document.delivery.is_terminal() {
            return Ok(ProcessOutcome::AlreadyTerminal(document.delivery));
        }
        if !document.is_dispatch_ready() {
            tracing::debug!(mail_id, "document lacks attachments field; not dispatch-ready");
            return Ok(ProcessOutcome::NotDispatchReady);
        }

        let Some(message) = RelayMessage::from_document(&document) else {
            let missing = document.missing_required_fields().join(", ");
            tracing::warn!(mail_id, missing = %missing, "malformed mail document");
            let state = DeliveryState::error(
                MALFORMED_DOCUMENT,
                format!("missing required fields: {missing}"),
            );
            return self.finish(&document, state).await;
        };

        let claimed = self
            .outbox
            .transition(
                mail_id,
                &DeliveryState::Processing {
                    started_at_ms: now_ms(),
                },
            )
            .await?;
        if let DeliveryTransition::AlreadyTerminal(current) = claimed {
            return Ok(ProcessOutcome::AlreadyTerminal(current.delivery));
        }

        let state = match timeout(self.relay_timeout, self.relay.send(&message)).await {
            Ok(Ok(accept)) => DeliveryState::success(accept.message_id, accept.response),
            Ok(Err(rejection)) => DeliveryState::error(rejection.code, rejection.message),
            Err(_) => DeliveryState::error(
                RELAY_TIMEOUT,
                format!(
                    "relay did not answer within {} ms",
                    self.relay_timeout.as_millis()
                ),
            ),
        };
        self.finish(&document, state).await
    }

    async fn finish(
        &self,
        document: &MailDocument,
        state: DeliveryState,
    ) -> DomainResult<ProcessOutcome> {
        match self.outbox.transition(&document.mail_id, &state).await? {
            DeliveryTransition::AlreadyTerminal(current) => {
                tracing::debug!(
                    mail_id = %document.mail_id,
                    state = current.delivery.kind().as_str(),
                    "document finished by another invocation"
                );
                Ok(ProcessOutcome::AlreadyTerminal(current.delivery))
            }
            DeliveryTransition::Applied(updated) => {
                match &updated.delivery {
                    DeliveryState::Success { message_id, .. } => {
                        tracing::info!(
                            mail_id = %updated.mail_id,
                            message_id = %message_id,
                            "mail delivered"
                        );
                    }
                    DeliveryState::Error { code, message, .. } => {
                        tracing::warn!(
                            mail_id = %updated.mail_id,
                            code = %code,
                            error = %message,
                            "mail delivery failed"
                        );
                        self.notify_failure(&updated, code).await;
                    }
                    _ => {}
                }
                Ok(ProcessOutcome::Completed(updated.delivery))
            }
        }
    }

    async fn notify_failure(&self, document: &MailDocument, code: &str) {
        let (Some(projector), Some(inviter_id)) =
            (&self.projector, document.template_param(PARAM_INVITED_BY))
        else {
            return;
        };
        if let Err(err) = projector
            .project_delivery_failure(inviter_id, &document.mail_id, &document.to, code)
            .await
        {
            tracing::warn!(
                mail_id = %document.mail_id,
                error = %err,
                "delivery failure notification not created"
            );
        }
    }

    /// Dispatch-ready documents that are not terminal, oldest first.
    ///
    /// Change events are only seen by a live subscriber, so anything queued
    /// while no worker listened, or left `Processing` by an invocation that
    /// died, is only reachable through this listing.
    pub async fn backlog(&self) -> DomainResult<Vec<String>> {
        let mut pending = Vec::new();
        for state in [DeliveryStateKind::Unset, DeliveryStateKind::Processing] {
            let query = MailListQuery {
                state: Some(state),
                ..MailListQuery::default()
            };
            let documents = self.outbox.list(&query).await?;
            pending.extend(documents.into_iter().filter(MailDocument::is_dispatch_ready));
        }
        pending.sort_by_key(|document| document.created_at_ms);
        Ok(pending.into_iter().map(|document| document.mail_id).collect())
    }

    /// Drains the backlog, then runs one task per change event until the feed
    /// closes, then waits for in-flight documents. Subscribe before calling so
    /// nothing queued between the listing and the feed is missed.
    pub async fn serve(self: Arc<Self>, changes: UnboundedReceiver<OutboxChange>) {
        self.serve_with(changes, |_, _| {}).await;
    }

    pub async fn serve_with<F>(
        self: Arc<Self>,
        mut changes: UnboundedReceiver<OutboxChange>,
        observe: F,
    ) where
        F: Fn(&ProcessOutcome, Duration) + Send + Sync + 'static,
    {
        let observe = Arc::new(observe);
        let mut in_flight = JoinSet::new();
        // Events for documents already taken from the backlog are redundant once.
        let mut resumed = HashSet::new();

        match self.backlog().await {
            Ok(pending) => {
                if !pending.is_empty() {
                    tracing::info!(
                        collection = self.outbox.collection(),
                        pending = pending.len(),
                        "resuming outbox backlog"
                    );
                }
                for mail_id in pending {
                    resumed.insert(mail_id.clone());
                    in_flight.spawn(Self::dispatch(self.clone(), observe.clone(), mail_id));
                }
            }
            Err(err) => tracing::error!(error = %err, "failed to list outbox backlog"),
        }

        while let Some(change) = changes.recv().await {
            if resumed.remove(&change.mail_id) {
                continue;
            }
            in_flight.spawn(Self::dispatch(self.clone(), observe.clone(), change.mail_id));
            while in_flight.try_join_next().is_some() {}
        }
        while in_flight.join_next().await.is_some() {}
        tracing::info!(
            collection = self.outbox.collection(),
            "change feed closed; delivery worker stopped"
        );
    }

    async fn dispatch<F>(worker: Arc<Self>, observe: Arc<F>, mail_id: String)
    where
        F: Fn(&ProcessOutcome, Duration) + Send + Sync + 'static,
    {
        let started = Instant::now();
        match worker.process(&mail_id).await {
            Ok(outcome) => observe(&outcome, started.elapsed()),
            Err(err) => {
                tracing::error!(mail_id = %mail_id, error = %err, "delivery invocation failed");
            }
        }
    }
}
