use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::DomainResult;
use crate::mail::{DeliveryState, DeliveryStateKind, MailDocument};
use crate::ports::BoxFuture;

/// Upper bound on documents written in one atomic batch.
pub const MAX_ATOMIC_WRITES: usize = 500;

#[derive(Clone, Debug, Default)]
pub struct MailListQuery {
    pub state: Option<DeliveryStateKind>,
    pub missing_attachments: bool,
    /// Zero means unbounded.
    pub limit: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryTransition {
    Applied(MailDocument),
    /// The stored state was already terminal; nothing was written.
    AlreadyTerminal(MailDocument),
}

impl DeliveryTransition {
    pub fn document(&self) -> &MailDocument {
        match self {
            Self::Applied(document) | Self::AlreadyTerminal(document) => document,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboxChangeKind {
    Created,
    AttachmentsWritten,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxChange {
    pub mail_id: String,
    pub kind: OutboxChangeKind,
}

/// One queue location (collection) of mail documents.
#[allow(clippy::needless_pass_by_value)]
pub trait MailOutboxRepository: Send + Sync {
    fn collection(&self) -> &str;

    fn create(&self, document: &MailDocument) -> BoxFuture<'_, DomainResult<MailDocument>>;

    fn get(&self, mail_id: &str) -> BoxFuture<'_, DomainResult<Option<MailDocument>>>;

    /// Oldest first.
    fn list(&self, query: &MailListQuery) -> BoxFuture<'_, DomainResult<Vec<MailDocument>>>;

    fn count(&self) -> BoxFuture<'_, DomainResult<u64>>;

    /// Writes `next` as the delivery state when the stored state allows it
    /// (see `DeliveryState::can_transition_to`).
    fn transition(
        &self,
        mail_id: &str,
        next: &DeliveryState,
    ) -> BoxFuture<'_, DomainResult<DeliveryTransition>>;

    /// Writes an empty attachment list if the field is absent. Returns whether
    /// a write happened.
    fn set_empty_attachments(&self, mail_id: &str) -> BoxFuture<'_, DomainResult<bool>>;

    /// Upserts up to [`MAX_ATOMIC_WRITES`] documents atomically.
    fn write_batch(&self, documents: &[MailDocument]) -> BoxFuture<'_, DomainResult<usize>>;

    /// Deletes up to [`MAX_ATOMIC_WRITES`] documents atomically.
    fn delete_batch(&self, mail_ids: &[String]) -> BoxFuture<'_, DomainResult<usize>>;
}

/// Creation/field-write events for one queue location, delivered at least
/// once.
pub trait OutboxChangeFeed: Send + Sync {
    fn subscribe(&self) -> BoxFuture<'_, DomainResult<UnboundedReceiver<OutboxChange>>>;
}
