use std::collections::HashMap;
use std::sync::Arc;

use crm_domain::DomainResult;
use crm_domain::error::DomainError;
use crm_domain::mail::{DeliveryState, MailDocument};
use crm_domain::members::MemberRecord;
use crm_domain::notifications::{NotificationRecord, NotificationType};
use crm_domain::ports::BoxFuture;
use crm_domain::ports::identity::{IdentityError, IdentityProvider};
use crm_domain::ports::members::MemberRepository;
use crm_domain::ports::notifications::{NotificationListQuery, NotificationRepository};
use crm_domain::ports::outbox::{
    DeliveryTransition, MAX_ATOMIC_WRITES, MailListQuery, MailOutboxRepository, OutboxChange,
    OutboxChangeFeed, OutboxChangeKind,
};
use crm_domain::util::uuid_v7_without_dashes;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Default)]
pub struct InMemoryMemberRepository {
    store: Arc<RwLock<HashMap<String, MemberRecord>>>,
}

impl InMemoryMemberRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemberRepository for InMemoryMemberRepository {
    fn create(&self, member: &MemberRecord) -> BoxFuture<'_, DomainResult<MemberRecord>> {
        let member = member.clone();
        let store = self.store.clone();
        Box::pin(async move {
            let mut store = store.write().await;
            if store.contains_key(&member.member_id)
                || store.values().any(|existing| existing.email == member.email)
            {
                return Err(DomainError::Conflict);
            }
            store.insert(member.member_id.clone(), member.clone());
            Ok(member)
        })
    }

    fn get(&self, member_id: &str) -> BoxFuture<'_, DomainResult<Option<MemberRecord>>> {
        let member_id = member_id.to_string();
        let store = self.store.clone();
        Box::pin(async move { Ok(store.read().await.get(&member_id).cloned()) })
    }

    fn find_by_email(&self, email: &str) -> BoxFuture<'_, DomainResult<Option<MemberRecord>>> {
        let email = email.to_ascii_lowercase();
        let store = self.store.clone();
        Box::pin(async move {
            Ok(store
                .read()
                .await
                .values()
                .find(|member| member.email == email)
                .cloned())
        })
    }

    fn list_by_company(&self, company_id: &str) -> BoxFuture<'_, DomainResult<Vec<MemberRecord>>> {
        let company_id = company_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            let mut members: Vec<_> = store
                .read()
                .await
                .values()
                .filter(|member| member.belong_to.contains(&company_id))
                .cloned()
                .collect();
            members.sort_by(|left, right| {
                left.created_at_ms
                    .cmp(&right.created_at_ms)
                    .then_with(|| left.member_id.cmp(&right.member_id))
            });
            Ok(members)
        })
    }

    fn update(&self, member: &MemberRecord) -> BoxFuture<'_, DomainResult<MemberRecord>> {
        let member = member.clone();
        let store = self.store.clone();
        Box::pin(async move {
            let mut store = store.write().await;
            let slot = store
                .get_mut(&member.member_id)
                .ok_or(DomainError::NotFound)?;
            *slot = member.clone();
            Ok(member)
        })
    }

    fn delete(&self, member_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let member_id = member_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            store
                .write()
                .await
                .remove(&member_id)
                .map(|_| ())
                .ok_or(DomainError::NotFound)
        })
    }
}

/// One outbox collection held in memory. Creations and attachment writes
/// are published to every subscriber, like a document store trigger.
pub struct InMemoryMailOutbox {
    collection: String,
    documents: Arc<RwLock<HashMap<String, MailDocument>>>,
    subscribers: Arc<RwLock<Vec<UnboundedSender<OutboxChange>>>>,
}

impl InMemoryMailOutbox {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            documents: Arc::default(),
            subscribers: Arc::default(),
        }
    }

    /// Stores a document exactly as given, bypassing validation and change
    /// events. Lets tests and fixtures reproduce documents written by older
    /// producers.
    pub async fn insert_raw(&self, document: MailDocument) {
        self.documents
            .write()
            .await
            .insert(document.mail_id.clone(), document);
    }

    async fn publish(
        subscribers: &RwLock<Vec<UnboundedSender<OutboxChange>>>,
        mail_id: &str,
        kind: OutboxChangeKind,
    ) {
        let mut subscribers = subscribers.write().await;
        subscribers.retain(|sender| {
            sender
                .send(OutboxChange {
                    mail_id: mail_id.to_string(),
                    kind,
                })
                .is_ok()
        });
    }
}

impl MailOutboxRepository for InMemoryMailOutbox {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn create(&self, document: &MailDocument) -> BoxFuture<'_, DomainResult<MailDocument>> {
        let document = document.clone();
        let documents = self.documents.clone();
        let subscribers = self.subscribers.clone();
        Box::pin(async move {
            {
                let mut documents = documents.write().await;
                if documents.contains_key(&document.mail_id) {
                    return Err(DomainError::Conflict);
                }
                documents.insert(document.mail_id.clone(), document.clone());
            }
            Self::publish(&subscribers, &document.mail_id, OutboxChangeKind::Created).await;
            Ok(document)
        })
    }

    fn get(&self, mail_id: &str) -> BoxFuture<'_, DomainResult<Option<MailDocument>>> {
        let mail_id = mail_id.to_string();
        let documents = self.documents.clone();
        Box::pin(async move { Ok(documents.read().await.get(&mail_id).cloned()) })
    }

    fn list(&self, query: &MailListQuery) -> BoxFuture<'_, DomainResult<Vec<MailDocument>>> {
        let query = query.clone();
        let documents = self.documents.clone();
        Box::pin(async move {
            let mut documents: Vec<_> = documents.read().await.values().cloned().collect();
            if let Some(state) = query.state {
                documents.retain(|document| document.delivery.kind() == state);
            }
            if query.missing_attachments {
                documents.retain(|document| document.attachments.is_none());
            }
            documents.sort_by(|left, right| {
                left.created_at_ms
                    .cmp(&right.created_at_ms)
                    .then_with(|| left.mail_id.cmp(&right.mail_id))
            });
            if query.limit > 0 {
                documents.truncate(query.limit);
            }
            Ok(documents)
        })
    }

    fn count(&self) -> BoxFuture<'_, DomainResult<u64>> {
        let documents = self.documents.clone();
        Box::pin(async move { Ok(documents.read().await.len() as u64) })
    }

    fn transition(
        &self,
        mail_id: &str,
        next: &DeliveryState,
    ) -> BoxFuture<'_, DomainResult<DeliveryTransition>> {
        let mail_id = mail_id.to_string();
        let next = next.clone();
        let documents = self.documents.clone();
        Box::pin(async move {
            let mut documents = documents.write().await;
            let document = documents.get_mut(&mail_id).ok_or(DomainError::NotFound)?;
            if document.delivery.is_terminal() {
                return Ok(DeliveryTransition::AlreadyTerminal(document.clone()));
            }
            if !document.delivery.can_transition_to(&next) {
                return Err(DomainError::Validation(format!(
                    "delivery state cannot move from {} to {}",
                    document.delivery.kind().as_str(),
                    next.kind().as_str()
                )));
            }
            document.delivery = next;
            Ok(DeliveryTransition::Applied(document.clone()))
        })
    }

    fn set_empty_attachments(&self, mail_id: &str) -> BoxFuture<'_, DomainResult<bool>> {
        let mail_id = mail_id.to_string();
        let documents = self.documents.clone();
        let subscribers = self.subscribers.clone();
        Box::pin(async move {
            {
                let mut documents = documents.write().await;
                let document = documents.get_mut(&mail_id).ok_or(DomainError::NotFound)?;
                if document.attachments.is_some() {
                    return Ok(false);
                }
                document.attachments = Some(Vec::new());
            }
            Self::publish(&subscribers, &mail_id, OutboxChangeKind::AttachmentsWritten).await;
            Ok(true)
        })
    }

    fn write_batch(&self, batch: &[MailDocument]) -> BoxFuture<'_, DomainResult<usize>> {
        let batch = batch.to_vec();
        let documents = self.documents.clone();
        let subscribers = self.subscribers.clone();
        Box::pin(async move {
            if batch.len() > MAX_ATOMIC_WRITES {
                return Err(DomainError::Validation(format!(
                    "batch of {} exceeds the {MAX_ATOMIC_WRITES} write limit",
                    batch.len()
                )));
            }
            let mut created = Vec::new();
            {
                let mut documents = documents.write().await;
                for document in &batch {
                    if documents
                        .insert(document.mail_id.clone(), document.clone())
                        .is_none()
                    {
                        created.push(document.mail_id.clone());
                    }
                }
            }
            for mail_id in created {
                Self::publish(&subscribers, &mail_id, OutboxChangeKind::Created).await;
            }
            Ok(batch.len())
        })
    }

    fn delete_batch(&self, mail_ids: &[String]) -> BoxFuture<'_, DomainResult<usize>> {
        let mail_ids = mail_ids.to_vec();
        let documents = self.documents.clone();
        Box::pin(async move {
            if mail_ids.len() > MAX_ATOMIC_WRITES {
                return Err(DomainError::Validation(format!(
                    "batch of {} exceeds the {MAX_ATOMIC_WRITES} write limit",
                    mail_ids.len()
                )));
            }
            let mut documents = documents.write().await;
            Ok(mail_ids
                .iter()
                .filter(|mail_id| documents.remove(*mail_id).is_some())
                .count())
        })
    }
}

impl OutboxChangeFeed for InMemoryMailOutbox {
    fn subscribe(&self) -> BoxFuture<'_, DomainResult<UnboundedReceiver<OutboxChange>>> {
        let subscribers = self.subscribers.clone();
        Box::pin(async move {
            let (sender, receiver) = mpsc::unbounded_channel();
            subscribers.write().await.push(sender);
            Ok(receiver)
        })
    }
}

#[derive(Default)]
pub struct InMemoryNotificationRepository {
    store: Arc<RwLock<HashMap<String, NotificationRecord>>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationRepository for InMemoryNotificationRepository {
    fn create(
        &self,
        notification: &NotificationRecord,
    ) -> BoxFuture<'_, DomainResult<NotificationRecord>> {
        let notification = notification.clone();
        let store = self.store.clone();
        Box::pin(async move {
            let mut store = store.write().await;
            if store.contains_key(&notification.notification_id) {
                return Err(DomainError::Conflict);
            }
            store.insert(notification.notification_id.clone(), notification.clone());
            Ok(notification)
        })
    }

    fn get(
        &self,
        notification_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<NotificationRecord>>> {
        let notification_id = notification_id.to_string();
        let store = self.store.clone();
        Box::pin(async move { Ok(store.read().await.get(&notification_id).cloned()) })
    }

    fn find_unprocessed(
        &self,
        member_id: &str,
        notification_type: NotificationType,
    ) -> BoxFuture<'_, DomainResult<Option<NotificationRecord>>> {
        let member_id = member_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            Ok(store
                .read()
                .await
                .values()
                .filter(|item| {
                    item.member_id == member_id
                        && item.notification_type == notification_type
                        && !item.processed
                })
                .min_by_key(|item| item.created_at_ms)
                .cloned())
        })
    }

    fn list_unprocessed(
        &self,
        notification_type: NotificationType,
        limit: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<NotificationRecord>>> {
        let store = self.store.clone();
        Box::pin(async move {
            let mut items: Vec<_> = store
                .read()
                .await
                .values()
                .filter(|item| item.notification_type == notification_type && !item.processed)
                .cloned()
                .collect();
            items.sort_by(|left, right| {
                left.created_at_ms
                    .cmp(&right.created_at_ms)
                    .then_with(|| left.notification_id.cmp(&right.notification_id))
            });
            if limit > 0 {
                items.truncate(limit);
            }
            Ok(items)
        })
    }

    fn list(
        &self,
        query: &NotificationListQuery,
    ) -> BoxFuture<'_, DomainResult<Vec<NotificationRecord>>> {
        let query = query.clone();
        let store = self.store.clone();
        Box::pin(async move {
            let mut items: Vec<_> = store
                .read()
                .await
                .values()
                .filter(|item| item.member_id == query.member_id)
                .filter(|item| query.include_read || !item.is_read)
                .cloned()
                .collect();
            items.sort_by(|left, right| {
                right
                    .created_at_ms
                    .cmp(&left.created_at_ms)
                    .then_with(|| right.notification_id.cmp(&left.notification_id))
            });
            if query.limit > 0 {
                items.truncate(query.limit);
            }
            Ok(items)
        })
    }

    fn mark_read(
        &self,
        notification_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<NotificationRecord>> {
        let notification_id = notification_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            let mut store = store.write().await;
            let item = store
                .get_mut(&notification_id)
                .ok_or(DomainError::NotFound)?;
            if !item.is_read {
                item.is_read = true;
                item.read_at_ms = Some(read_at_ms);
            }
            Ok(item.clone())
        })
    }

    fn mark_all_read(
        &self,
        member_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>> {
        let member_id = member_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            let mut store = store.write().await;
            let mut changed = 0;
            for item in store
                .values_mut()
                .filter(|item| item.member_id == member_id && !item.is_read)
            {
                item.is_read = true;
                item.read_at_ms = Some(read_at_ms);
                changed += 1;
            }
            Ok(changed)
        })
    }

    fn mark_processed(
        &self,
        notification_id: &str,
        processed_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<NotificationRecord>> {
        let notification_id = notification_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            let mut store = store.write().await;
            let item = store
                .get_mut(&notification_id)
                .ok_or(DomainError::NotFound)?;
            if !item.processed {
                item.processed = true;
                item.processed_at_ms = Some(processed_at_ms);
            }
            Ok(item.clone())
        })
    }

    fn unread_count(&self, member_id: &str) -> BoxFuture<'_, DomainResult<usize>> {
        let member_id = member_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            Ok(store
                .read()
                .await
                .values()
                .filter(|item| item.member_id == member_id && !item.is_read)
                .count())
        })
    }
}

#[derive(Clone, Debug)]
struct IdentityEntry {
    email: String,
    credential: String,
    signed_in: bool,
}

/// Identity provider kept in process. Creating an identity signs it in, the
/// way hosted auth SDKs do, so callers must sign out explicitly.
#[derive(Default)]
pub struct InMemoryIdentityProvider {
    identities: Arc<RwLock<HashMap<String, IdentityEntry>>>,
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn credential_of(&self, identity_id: &str) -> Option<String> {
        self.identities
            .read()
            .await
            .get(identity_id)
            .map(|entry| entry.credential.clone())
    }

    pub async fn is_signed_in(&self, identity_id: &str) -> bool {
        self.identities
            .read()
            .await
            .get(identity_id)
            .is_some_and(|entry| entry.signed_in)
    }

    pub async fn identity_count(&self) -> usize {
        self.identities.read().await.len()
    }
}

impl IdentityProvider for InMemoryIdentityProvider {
    fn create_identity(
        &self,
        email: &str,
        credential: &str,
    ) -> BoxFuture<'_, Result<String, IdentityError>> {
        let email = email.trim().to_ascii_lowercase();
        let credential = credential.to_string();
        let identities = self.identities.clone();
        Box::pin(async move {
            if !email.contains('@') {
                return Err(IdentityError::InvalidEmail);
            }
            if credential.chars().count() < 6 {
                return Err(IdentityError::WeakCredential);
            }
            let mut identities = identities.write().await;
            if identities.values().any(|entry| entry.email == email) {
                return Err(IdentityError::EmailAlreadyInUse);
            }
            let identity_id = uuid_v7_without_dashes();
            identities.insert(
                identity_id.clone(),
                IdentityEntry {
                    email,
                    credential,
                    signed_in: true,
                },
            );
            Ok(identity_id)
        })
    }

    fn update_credential(
        &self,
        identity_id: &str,
        credential: &str,
    ) -> BoxFuture<'_, Result<(), IdentityError>> {
        let identity_id = identity_id.to_string();
        let credential = credential.to_string();
        let identities = self.identities.clone();
        Box::pin(async move {
            let mut identities = identities.write().await;
            let entry = identities
                .get_mut(&identity_id)
                .ok_or(IdentityError::NotFound)?;
            entry.credential = credential;
            Ok(())
        })
    }

    fn delete_identity(&self, identity_id: &str) -> BoxFuture<'_, Result<(), IdentityError>> {
        let identity_id = identity_id.to_string();
        let identities = self.identities.clone();
        Box::pin(async move {
            identities
                .write()
                .await
                .remove(&identity_id)
                .map(|_| ())
                .ok_or(IdentityError::NotFound)
        })
    }

    fn sign_out(&self, identity_id: &str) -> BoxFuture<'_, Result<(), IdentityError>> {
        let identity_id = identity_id.to_string();
        let identities = self.identities.clone();
        Box::pin(async move {
            let mut identities = identities.write().await;
            let entry = identities
                .get_mut(&identity_id)
                .ok_or(IdentityError::NotFound)?;
            entry.signed_in = false;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_domain::mail::MailMessage;

    fn document(mail_id: &str) -> MailDocument {
        let mut document = MailDocument::new(
            vec!["a@example.com".into()],
            MailMessage {
                subject: Some("T".into()),
                html: Some("<p>x</p>".into()),
                text: None,
            },
        );
        document.mail_id = mail_id.to_string();
        document
    }

    #[tokio::test]
    async fn in_memory_outbox_publishes_creation_and_attachment_writes() {
        let outbox = InMemoryMailOutbox::new("mails");
        let mut changes = outbox.subscribe().await.expect("subscribe");

        outbox.create(&document("m-1")).await.expect("create");
        let mut legacy = document("m-2");
        legacy.attachments = None;
        outbox.insert_raw(legacy).await;
        assert!(outbox.set_empty_attachments("m-2").await.expect("repair"));
        assert!(!outbox.set_empty_attachments("m-2").await.expect("repair again"));

        let first = changes.recv().await.expect("first change");
        let second = changes.recv().await.expect("second change");
        assert_eq!(first.kind, OutboxChangeKind::Created);
        assert_eq!(second.mail_id, "m-2");
        assert_eq!(second.kind, OutboxChangeKind::AttachmentsWritten);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn in_memory_outbox_transition_is_write_once() {
        let outbox = InMemoryMailOutbox::new("mails");
        outbox.create(&document("m-1")).await.expect("create");

        let success = DeliveryState::success("msg-1", "250 OK");
        let applied = outbox.transition("m-1", &success).await.expect("apply");
        assert!(matches!(applied, DeliveryTransition::Applied(_)));

        let late = outbox
            .transition("m-1", &DeliveryState::error("X", "late"))
            .await
            .expect("late write");
        assert_eq!(
            late,
            DeliveryTransition::AlreadyTerminal(applied.document().clone())
        );
    }

    #[tokio::test]
    async fn in_memory_outbox_rejects_oversized_batches() {
        let outbox = InMemoryMailOutbox::new("mails");
        let batch: Vec<_> = (0..=MAX_ATOMIC_WRITES)
            .map(|index| document(&format!("m-{index}")))
            .collect();
        assert!(outbox.write_batch(&batch).await.is_err());
        assert_eq!(outbox.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn notification_mark_read_keeps_first_timestamp() {
        let repo = InMemoryNotificationRepository::new();
        let record = NotificationRecord::new("m-1", NotificationType::SystemNotification, "t", "b");
        repo.create(&record).await.expect("create");

        let first = repo.mark_read(&record.notification_id, 10).await.expect("read");
        let second = repo.mark_read(&record.notification_id, 20).await.expect("read again");
        assert_eq!(first.read_at_ms, Some(10));
        assert_eq!(second.read_at_ms, Some(10));
        assert_eq!(repo.unread_count("m-1").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn member_repository_filters_by_company() {
        let repo = InMemoryMemberRepository::new();
        let identity = InMemoryIdentityProvider::new();
        let id = identity
            .create_identity("a@example.com", "Abcdefgh12")
            .await
            .expect("identity");
        assert!(identity.is_signed_in(&id).await);
        assert_eq!(
            identity.create_identity("A@example.com", "Abcdefgh12").await,
            Err(IdentityError::EmailAlreadyInUse)
        );

        let member = MemberRecord {
            member_id: id.clone(),
            email: "a@example.com".into(),
            given_name: "Hana".into(),
            family_name: "Sato".into(),
            given_name_reading: None,
            family_name_reading: None,
            role: crm_domain::roles::Role::User,
            status: crm_domain::members::MemberStatus::Invited,
            email_verified: false,
            temporary_credential: Some("Abcdefgh12".into()),
            invitation_resend_count: 0,
            invitation_resent_at_ms: None,
            password_changed_at_ms: None,
            belong_to: vec!["c-1".into()],
            invited_by: None,
            created_at_ms: 1,
            updated_at_ms: 1,
        };
        repo.create(&member).await.expect("create");
        assert!(matches!(repo.create(&member).await, Err(DomainError::Conflict)));
        assert_eq!(repo.list_by_company("c-1").await.expect("list").len(), 1);
        assert!(repo.list_by_company("c-2").await.expect("list").is_empty());
    }
}
