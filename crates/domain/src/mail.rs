//! Outbox documents and their delivery-state machine.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::util::{now_ms, uuid_v7_without_dashes};

pub const MALFORMED_DOCUMENT: &str = "MalformedDocument";
pub const RELAY_TIMEOUT: &str = "RelayTimeout";
pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailMessage {
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

/// Template name and parameters the document was rendered from. Kept for
/// observability only; the worker never re-renders.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateMetadata {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStateKind {
    Unset,
    Processing,
    Success,
    Error,
}

impl DeliveryStateKind {
    pub const ALL: [DeliveryStateKind; 4] = [
        DeliveryStateKind::Unset,
        DeliveryStateKind::Processing,
        DeliveryStateKind::Success,
        DeliveryStateKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

impl FromStr for DeliveryStateKind {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "unset" => Ok(Self::Unset),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            _ => Err("unknown delivery state"),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    #[default]
    Unset,
    Processing {
        started_at_ms: i64,
    },
    Success {
        message_id: String,
        response: String,
        delivered_at_ms: i64,
    },
    Error {
        code: String,
        message: String,
        failed_at_ms: i64,
    },
}

impl DeliveryState {
    pub fn kind(&self) -> DeliveryStateKind {
        match self {
            Self::Unset => DeliveryStateKind::Unset,
            Self::Processing { .. } => DeliveryStateKind::Processing,
            Self::Success { .. } => DeliveryStateKind::Success,
            Self::Error { .. } => DeliveryStateKind::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    pub fn success(message_id: impl Into<String>, response: impl Into<String>) -> Self {
        Self::Success {
            message_id: message_id.into(),
            response: response.into(),
            delivered_at_ms: now_ms(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self::Error {
            code: if code.trim().is_empty() {
                UNKNOWN_ERROR.to_string()
            } else {
                code
            },
            message: message.into(),
            failed_at_ms: now_ms(),
        }
    }

    /// Monotonic progression: terminal states accept nothing, `Processing`
    /// may be re-claimed by a duplicate trigger, and nothing returns to `Unset`.
    pub fn can_transition_to(&self, next: &DeliveryState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next.kind() {
            DeliveryStateKind::Unset => false,
            DeliveryStateKind::Processing => true,
            DeliveryStateKind::Success | DeliveryStateKind::Error => true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailDocument {
    pub mail_id: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub from: Option<String>,
    pub message: MailMessage,
    /// Absent on documents written by older producers. The relay only treats
    /// a document as dispatch-ready once this field exists.
    pub attachments: Option<Vec<MailAttachment>>,
    pub template: Option<TemplateMetadata>,
    #[serde(default)]
    pub delivery: DeliveryState,
    pub created_at_ms: i64,
    pub migrated_at_ms: Option<i64>,
    pub original_id: Option<String>,
}

impl MailDocument {
    pub fn new(to: Vec<String>, message: MailMessage) -> Self {
        Self {
            mail_id: uuid_v7_without_dashes(),
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: None,
            from: None,
            message,
            attachments: Some(Vec::new()),
            template: None,
            delivery: DeliveryState::Unset,
            created_at_ms: now_ms(),
            migrated_at_ms: None,
            original_id: None,
        }
    }

    pub fn is_dispatch_ready(&self) -> bool {
        self.attachments.is_some()
    }

    /// Fields the worker needs before it will hand the document to the relay.
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.to.iter().all(|address| address.trim().is_empty()) {
            missing.push("to");
        }
        if is_blank(self.message.subject.as_deref()) {
            missing.push("message.subject");
        }
        if is_blank(self.message.html.as_deref()) && is_blank(self.message.text.as_deref()) {
            missing.push("message.html|message.text");
        }
        missing
    }

    /// Everything an operator would flag, including the attachments field the
    /// relay's trigger depends on.
    pub fn diagnose(&self) -> Vec<&'static str> {
        let mut problems = self.missing_required_fields();
        if !self.is_dispatch_ready() {
            problems.push("attachments");
        }
        problems
    }

    pub fn template_param(&self, key: &str) -> Option<&str> {
        self.template
            .as_ref()
            .and_then(|template| template.data.get(key))
            .map(String::as_str)
    }

    /// Copy destined for another queue location, keyed deterministically on
    /// the original id so a repeated migration overwrites instead of
    /// duplicating.
    pub fn migrated_copy(&self, migrated_at_ms: i64) -> Self {
        let mut copy = self.clone();
        copy.mail_id = format!("migrated-{}", self.mail_id);
        copy.migrated_at_ms = Some(migrated_at_ms);
        copy.original_id = Some(self.mail_id.clone());
        copy
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|value| value.trim().is_empty())
}
