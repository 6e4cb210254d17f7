use crate::DomainResult;
use crate::notifications::{NotificationRecord, NotificationType};
use crate::ports::BoxFuture;

#[derive(Clone, Debug)]
pub struct NotificationListQuery {
    pub member_id: String,
    pub include_read: bool,
    pub limit: usize,
}

#[allow(clippy::needless_pass_by_value)]
pub trait NotificationRepository: Send + Sync {
    fn create(
        &self,
        notification: &NotificationRecord,
    ) -> BoxFuture<'_, DomainResult<NotificationRecord>>;

    fn get(&self, notification_id: &str)
    -> BoxFuture<'_, DomainResult<Option<NotificationRecord>>>;

    fn find_unprocessed(
        &self,
        member_id: &str,
        notification_type: NotificationType,
    ) -> BoxFuture<'_, DomainResult<Option<NotificationRecord>>>;

    /// Oldest first.
    fn list_unprocessed(
        &self,
        notification_type: NotificationType,
        limit: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<NotificationRecord>>>;

    /// Newest first.
    fn list(
        &self,
        query: &NotificationListQuery,
    ) -> BoxFuture<'_, DomainResult<Vec<NotificationRecord>>>;

    /// Sets `is_read`/`read_at` only when the record is still unread and
    /// returns the stored record either way.
    fn mark_read(
        &self,
        notification_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<NotificationRecord>>;

    fn mark_all_read(&self, member_id: &str, read_at_ms: i64)
    -> BoxFuture<'_, DomainResult<usize>>;

    fn mark_processed(
        &self,
        notification_id: &str,
        processed_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<NotificationRecord>>;

    fn unread_count(&self, member_id: &str) -> BoxFuture<'_, DomainResult<usize>>;
}
