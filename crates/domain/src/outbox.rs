//! Appends rendered mail documents to the outbox for asynchronous delivery.

use std::sync::Arc;

use crate::DomainResult;
use crate::error::DomainError;
use crate::mail::{MailAttachment, MailDocument};
use crate::ports::outbox::MailOutboxRepository;
use crate::templates::{MailTemplate, TemplateParams};

#[derive(Clone, Debug)]
pub struct MailRequest {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub template: MailTemplate,
    pub params: TemplateParams,
    pub attachments: Vec<MailAttachment>,
}

impl MailRequest {
    pub fn new(to: Vec<String>, template: MailTemplate, params: TemplateParams) -> Self {
        Self {
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: None,
            template,
            params,
            attachments: Vec::new(),
        }
    }

    pub fn with_cc(mut self, cc: Vec<String>) -> Self {
        self.cc = cc;
        self
    }

    pub fn with_bcc(mut self, bcc: Vec<String>) -> Self {
        self.bcc = bcc;
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Result of an enqueue that must not fail the surrounding operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { mail_id: String },
    Failed { reason: String },
}

impl EnqueueOutcome {
    pub fn mail_id(&self) -> Option<&str> {
        match self {
            Self::Queued { mail_id } => Some(mail_id),
            Self::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            Self::Queued { .. } => None,
            Self::Failed { reason } => Some(reason),
        }
    }
}

#[derive(Clone)]
pub struct OutboxWriter {
    outbox: Arc<dyn MailOutboxRepository>,
}

impl OutboxWriter {
    pub fn new(outbox: Arc<dyn MailOutboxRepository>) -> Self {
        Self { outbox }
    }

    pub async fn enqueue(
        &self,
        to: Vec<String>,
        template: MailTemplate,
        params: TemplateParams,
    ) -> DomainResult<String> {
        self.enqueue_request(MailRequest::new(to, template, params))
            .await
    }

    pub async fn enqueue_request(&self, request: MailRequest) -> DomainResult<String> {
        let to: Vec<String> = request
            .to
            .into_iter()
            .map(|address| address.trim().to_string())
            .filter(|address| !address.is_empty())
            .collect();
        if to.is_empty() {
            return Err(DomainError::Validation(
                "mail recipient list is empty".into(),
            ));
        }

        let mut document = MailDocument::new(to, request.template.render(&request.params));
        document.cc = request.cc;
        document.bcc = request.bcc;
        document.reply_to = request.reply_to;
        // Always present: the relay ignores documents without the field.
        document.attachments = Some(request.attachments);
        document.template = Some(request.template.metadata(&request.params));

        let created = self.outbox.create(&document).await?;
        tracing::info!(
            mail_id = %created.mail_id,
            template = request.template.as_str(),
            collection = self.outbox.collection(),
            "mail enqueued"
        );
        Ok(created.mail_id)
    }

    /// Enqueues without propagating failure. The error is logged and handed
    /// back as an [`EnqueueOutcome::Failed`] so callers can surface it as a
    /// warning.
    pub async fn enqueue_best_effort(&self, request: MailRequest) -> EnqueueOutcome {
        let template = request.template;
        match self.enqueue_request(request).await {
            Ok(mail_id) => EnqueueOutcome::Queued { mail_id },
            Err(err) => {
                tracing::warn!(
                    template = template.as_str(),
                    error = %err,
                    "mail enqueue failed; continuing"
                );
                EnqueueOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}
