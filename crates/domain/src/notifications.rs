//! In-app notifications and the projector that turns domain events into them.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::notifications::{NotificationListQuery, NotificationRepository};
use crate::roles::Role;
use crate::util::{format_ms_date, now_ms, uuid_v7_without_dashes};

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    WelcomeEmail,
    TemporaryPassword,
    RoleChanged,
    MemberAdded,
    CompanyCreated,
    WalletCreated,
    SystemNotification,
    InquiryReceived,
    TokenFlagged,
    OwnershipChallenge,
    DeliveryFailed,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WelcomeEmail => "welcome_email",
            Self::TemporaryPassword => "temporary_password",
            Self::RoleChanged => "role_changed",
            Self::MemberAdded => "member_added",
            Self::CompanyCreated => "company_created",
            Self::WalletCreated => "wallet_created",
            Self::SystemNotification => "system_notification",
            Self::InquiryReceived => "inquiry_received",
            Self::TokenFlagged => "token_flagged",
            Self::OwnershipChallenge => "ownership_challenge",
            Self::DeliveryFailed => "delivery_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }

    pub fn priority(&self) -> u8 {
        match self {
            Self::TokenFlagged | Self::OwnershipChallenge => 3,
            Self::InquiryReceived | Self::TemporaryPassword | Self::DeliveryFailed => 2,
            Self::MemberAdded | Self::RoleChanged | Self::CompanyCreated | Self::WalletCreated => 1,
            Self::WelcomeEmail | Self::SystemNotification => 0,
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Self::InquiryReceived => "📩",
            Self::TokenFlagged => "🚨",
            Self::OwnershipChallenge => "⚔️",
            Self::MemberAdded => "👥",
            Self::RoleChanged => "🎭",
            Self::CompanyCreated => "🏢",
            Self::WalletCreated => "💳",
            Self::SystemNotification => "⚙️",
            Self::TemporaryPassword => "🔑",
            Self::DeliveryFailed => "⚠️",
            Self::WelcomeEmail => "📢",
        }
    }
}

impl FromStr for NotificationType {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "welcome_email" => Ok(Self::WelcomeEmail),
            "temporary_password" => Ok(Self::TemporaryPassword),
            "role_changed" => Ok(Self::RoleChanged),
            "member_added" => Ok(Self::MemberAdded),
            "company_created" => Ok(Self::CompanyCreated),
            "wallet_created" => Ok(Self::WalletCreated),
            "system_notification" => Ok(Self::SystemNotification),
            "inquiry_received" => Ok(Self::InquiryReceived),
            "token_flagged" => Ok(Self::TokenFlagged),
            "ownership_challenge" => Ok(Self::OwnershipChallenge),
            "delivery_failed" => Ok(Self::DeliveryFailed),
            _ => Err("unknown notification type"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationRecord {
    pub notification_id: String,
    pub member_id: String,
    pub notification_type: NotificationType,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub read_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub correlation_id: Option<String>,
    /// Whether background follow-up work for this notification is done.
    pub processed: bool,
    pub processed_at_ms: Option<i64>,
}

impl NotificationRecord {
    pub fn new(
        member_id: impl Into<String>,
        notification_type: NotificationType,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let created_at_ms = now_ms();
        Self {
            notification_id: uuid_v7_without_dashes(),
            member_id: member_id.into(),
            notification_type,
            title: title.into(),
            body: body.into(),
            is_read: false,
            read_at_ms: None,
            created_at_ms,
            correlation_id: None,
            processed: true,
            processed_at_ms: Some(created_at_ms),
        }
    }

    pub fn priority(&self) -> u8 {
        self.notification_type.priority()
    }

    pub fn icon(&self) -> &'static str {
        self.notification_type.icon()
    }

    pub fn is_urgent(&self) -> bool {
        self.priority() >= 3
    }

    pub fn time_ago(&self, now_ms: i64) -> String {
        let elapsed = (now_ms - self.created_at_ms).max(0);
        if elapsed < MINUTE_MS {
            "just now".to_string()
        } else if elapsed < HOUR_MS {
            format!("{} min ago", elapsed / MINUTE_MS)
        } else if elapsed < DAY_MS {
            format!("{} hours ago", elapsed / HOUR_MS)
        } else if elapsed < 7 * DAY_MS {
            format!("{} days ago", elapsed / DAY_MS)
        } else {
            format_ms_date(self.created_at_ms)
        }
    }

    /// `read_at` is set exactly when the record is read.
    pub fn read_state_consistent(&self) -> bool {
        self.is_read == self.read_at_ms.is_some()
    }

    fn pending(mut self) -> Self {
        self.processed = false;
        self.processed_at_ms = None;
        self
    }

    fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[derive(Clone)]
pub struct NotificationProjector {
    repo: Arc<dyn NotificationRepository>,
}

impl NotificationProjector {
    pub fn new(repo: Arc<dyn NotificationRepository>) -> Self {
        Self { repo }
    }

    /// Welcome notification for a freshly invited member. When an
    /// unprocessed welcome already exists for the member the existing record
    /// is returned and nothing is written.
    ///
    /// The record starts unprocessed so the welcome sweep follows it up.
    /// `queued_mail_id` correlates it with the invitation mail that is
    /// already in the outbox, if any; without one the sweep enqueues a mail.
    pub async fn project_welcome(
        &self,
        member_id: &str,
        credential: &str,
        queued_mail_id: Option<&str>,
    ) -> DomainResult<NotificationRecord> {
        if let Some(existing) = self
            .repo
            .find_unprocessed(member_id, NotificationType::WelcomeEmail)
            .await?
        {
            tracing::debug!(
                member_id,
                notification_id = %existing.notification_id,
                "unprocessed welcome notification exists; skipping"
            );
            return Ok(existing);
        }

        let mut notification = NotificationRecord::new(
            member_id,
            NotificationType::WelcomeEmail,
            "Welcome aboard",
            format!(
                "Your account has been created. Sign in with the temporary password {credential} and set a new one."
            ),
        )
        .pending();
        if let Some(mail_id) = queued_mail_id {
            notification = notification.with_correlation(mail_id);
        }
        self.repo.create(&notification).await
    }

    /// Marks the member's unprocessed welcome notifications processed so a
    /// following [`Self::project_welcome`] writes a fresh record. Returns how
    /// many were retired.
    pub async fn retire_pending_welcome(&self, member_id: &str) -> DomainResult<usize> {
        validate_id("member_id", member_id)?;
        let mut retired = 0;
        while let Some(existing) = self
            .repo
            .find_unprocessed(member_id, NotificationType::WelcomeEmail)
            .await?
        {
            let updated = self
                .repo
                .mark_processed(&existing.notification_id, now_ms())
                .await?;
            if !updated.processed {
                return Err(DomainError::Conflict);
            }
            retired += 1;
        }
        if retired > 0 {
            tracing::debug!(member_id, retired, "retired pending welcome notifications");
        }
        Ok(retired)
    }

    pub async fn project_temporary_password_reminder(
        &self,
        member_id: &str,
    ) -> DomainResult<NotificationRecord> {
        self.create(NotificationRecord::new(
            member_id,
            NotificationType::TemporaryPassword,
            "Change your temporary password",
            "You are signed in with a temporary password. Set a new password from your account settings.",
        ))
        .await
    }

    pub async fn project_role_changed(
        &self,
        member_id: &str,
        new_role: Role,
    ) -> DomainResult<NotificationRecord> {
        self.create(NotificationRecord::new(
            member_id,
            NotificationType::RoleChanged,
            "Your role changed",
            format!("Your role is now {}.", new_role.display_name()),
        ))
        .await
    }

    pub async fn project_member_added(
        &self,
        inviter_id: &str,
        member_id: &str,
        member_email: &str,
    ) -> DomainResult<NotificationRecord> {
        self.create(
            NotificationRecord::new(
                inviter_id,
                NotificationType::MemberAdded,
                "Member invited",
                format!("An invitation was sent to {member_email}."),
            )
            .with_correlation(member_id),
        )
        .await
    }

    pub async fn project_delivery_failure(
        &self,
        member_id: &str,
        mail_id: &str,
        recipients: &[String],
        code: &str,
    ) -> DomainResult<NotificationRecord> {
        self.create(
            NotificationRecord::new(
                member_id,
                NotificationType::DeliveryFailed,
                "Mail delivery failed",
                format!(
                    "Mail to {} could not be delivered ({code}). Resend the invitation to try again.",
                    recipients.join(", ")
                ),
            )
            .with_correlation(mail_id),
        )
        .await
    }

    pub async fn project_inquiry_received(
        &self,
        member_id: &str,
        inquiry_id: &str,
        summary: &str,
    ) -> DomainResult<NotificationRecord> {
        self.create(
            NotificationRecord::new(
                member_id,
                NotificationType::InquiryReceived,
                "New inquiry",
                summary,
            )
            .with_correlation(inquiry_id),
        )
        .await
    }

    pub async fn project_system(
        &self,
        member_id: &str,
        title: &str,
        body: &str,
    ) -> DomainResult<NotificationRecord> {
        self.create(NotificationRecord::new(
            member_id,
            NotificationType::SystemNotification,
            title,
            body,
        ))
        .await
    }

    /// One-way; a notification that is already read is returned unchanged.
    pub async fn mark_read(&self, notification_id: &str) -> DomainResult<NotificationRecord> {
        validate_id("notification_id", notification_id)?;
        self.repo.mark_read(notification_id, now_ms()).await
    }

    pub async fn mark_all_read(&self, member_id: &str) -> DomainResult<usize> {
        validate_id("member_id", member_id)?;
        self.repo.mark_all_read(member_id, now_ms()).await
    }

    pub async fn mark_processed(&self, notification_id: &str) -> DomainResult<NotificationRecord> {
        validate_id("notification_id", notification_id)?;
        self.repo.mark_processed(notification_id, now_ms()).await
    }

    pub async fn list(
        &self,
        member_id: &str,
        include_read: bool,
    ) -> DomainResult<Vec<NotificationRecord>> {
        validate_id("member_id", member_id)?;
        self.repo
            .list(&NotificationListQuery {
                member_id: member_id.to_string(),
                include_read,
                limit: DEFAULT_LIST_LIMIT,
            })
            .await
    }

    pub async fn unread_count(&self, member_id: &str) -> DomainResult<usize> {
        validate_id("member_id", member_id)?;
        self.repo.unread_count(member_id).await
    }

    async fn create(&self, notification: NotificationRecord) -> DomainResult<NotificationRecord> {
        validate_id("member_id", &notification.member_id)?;
        self.repo.create(&notification).await
    }
}

fn validate_id(field: &str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::Validation(format!("{field} is required")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(created_at_ms: i64) -> NotificationRecord {
        let mut record =
            NotificationRecord::new("m-1", NotificationType::SystemNotification, "t", "b");
        record.created_at_ms = created_at_ms;
        record
    }

    #[test]
    fn priority_and_urgency_follow_type() {
        assert_eq!(NotificationType::TokenFlagged.priority(), 3);
        assert_eq!(NotificationType::TemporaryPassword.priority(), 2);
        assert_eq!(NotificationType::RoleChanged.priority(), 1);
        assert_eq!(NotificationType::SystemNotification.priority(), 0);

        let mut record = at(0);
        assert!(!record.is_urgent());
        record.notification_type = NotificationType::OwnershipChallenge;
        assert!(record.is_urgent());
        assert_eq!(record.icon(), "⚔️");
    }

    #[test]
    fn time_ago_buckets() {
        let created = 1_700_000_000_000;
        let record = at(created);
        assert_eq!(record.time_ago(created + 30 * 1000), "just now");
        assert_eq!(record.time_ago(created + 5 * MINUTE_MS), "5 min ago");
        assert_eq!(record.time_ago(created + 3 * HOUR_MS), "3 hours ago");
        assert_eq!(record.time_ago(created + 2 * DAY_MS), "2 days ago");
        assert_eq!(record.time_ago(created + 10 * DAY_MS), "2023-11-14");
    }

    #[test]
    fn new_records_are_unread_and_consistent() {
        let record = at(1);
        assert!(!record.is_read);
        assert!(record.read_state_consistent());
        assert!(record.processed);
        assert!(!record.clone().pending().processed);
    }

    #[test]
    fn type_names_parse_back() {
        assert_eq!(
            NotificationType::parse("welcome_email"),
            Some(NotificationType::WelcomeEmail)
        );
        assert_eq!(NotificationType::parse("unknown"), None);
    }
}
