use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mail::{MailAttachment, MailDocument};
use crate::ports::BoxFuture;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayMessage {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<MailAttachment>,
}

impl RelayMessage {
    /// Returns `None` when the document lacks the fields a send needs.
    pub fn from_document(document: &MailDocument) -> Option<Self> {
        if !document.missing_required_fields().is_empty() {
            return None;
        }
        Some(Self {
            from: document.from.clone(),
            to: document.to.clone(),
            cc: document.cc.clone(),
            bcc: document.bcc.clone(),
            reply_to: document.reply_to.clone(),
            subject: document.message.subject.clone()?,
            html: document.message.html.clone(),
            text: document.message.text.clone(),
            attachments: document.attachments.clone().unwrap_or_default(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayAccept {
    pub message_id: String,
    pub response: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("relay rejected message ({code}): {message}")]
pub struct RelayRejection {
    pub code: String,
    pub message: String,
}

impl RelayRejection {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

pub trait MailRelay: Send + Sync {
    fn send(&self, message: &RelayMessage) -> BoxFuture<'_, Result<RelayAccept, RelayRejection>>;
}
