use std::sync::Arc;

use crate::DomainResult;
use crate::members::MemberStatus;
use crate::notifications::{NotificationProjector, NotificationType};
use crate::outbox::{MailRequest, OutboxWriter};
use crate::ports::members::MemberRepository;
use crate::ports::notifications::NotificationRepository;
use crate::templates::{
    MailTemplate, PARAM_COMPANY_NAME, PARAM_LOGIN_URL, PARAM_MEMBER_ID, PARAM_MEMBER_NAME,
    PARAM_TEMPORARY_PASSWORD, TemplateParams,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub mailed: usize,
    pub already_queued: usize,
    pub skipped_without_credential: usize,
    pub failed: usize,
}

/// Follows up unprocessed welcome notifications: queues the welcome mail
/// when the invitation mail never reached the outbox, then marks the
/// notification processed.
#[derive(Clone)]
pub struct WelcomeSweep {
    notifications: Arc<dyn NotificationRepository>,
    members: Arc<dyn MemberRepository>,
    projector: NotificationProjector,
    outbox: OutboxWriter,
    login_url: String,
    company_name: String,
    batch_size: usize,
}

impl WelcomeSweep {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        members: Arc<dyn MemberRepository>,
        outbox: OutboxWriter,
        login_url: impl Into<String>,
        company_name: impl Into<String>,
    ) -> Self {
        Self {
            projector: NotificationProjector::new(notifications.clone()),
            notifications,
            members,
            outbox,
            login_url: login_url.into(),
            company_name: company_name.into(),
            batch_size: 100,
        }
    }

    pub async fn run_once(&self) -> DomainResult<SweepReport> {
        let pending = self
            .notifications
            .list_unprocessed(NotificationType::WelcomeEmail, self.batch_size)
            .await?;
        let mut report = SweepReport {
            scanned: pending.len(),
            ..SweepReport::default()
        };

        for notification in pending {
            if notification.correlation_id.is_some() {
                self.projector
                    .mark_processed(&notification.notification_id)
                    .await?;
                report.already_queued += 1;
                continue;
            }

            let member = self.members.get(&notification.member_id).await?;
            let credential = member.as_ref().and_then(|member| {
                (member.status == MemberStatus::Invited)
                    .then(|| member.temporary_credential.clone())
                    .flatten()
            });
            let (Some(member), Some(credential)) = (member, credential) else {
                self.projector
                    .mark_processed(&notification.notification_id)
                    .await?;
                report.skipped_without_credential += 1;
                continue;
            };

            let mut params = TemplateParams::new();
            params.insert(PARAM_MEMBER_NAME.into(), member.display_name());
            params.insert(PARAM_MEMBER_ID.into(), member.member_id.clone());
            params.insert(PARAM_TEMPORARY_PASSWORD.into(), credential);
            params.insert(PARAM_LOGIN_URL.into(), self.login_url.clone());
            params.insert(PARAM_COMPANY_NAME.into(), self.company_name.clone());
            let request =
                MailRequest::new(vec![member.email.clone()], MailTemplate::Welcome, params);

            match self.outbox.enqueue_request(request).await {
                Ok(mail_id) => {
                    self.projector
                        .mark_processed(&notification.notification_id)
                        .await?;
                    tracing::info!(
                        member_id = %member.member_id,
                        mail_id = %mail_id,
                        "welcome mail queued by sweep"
                    );
                    report.mailed += 1;
                }
                Err(err) => {
                    // Left unprocessed for the next pass.
                    tracing::warn!(
                        member_id = %member.member_id,
                        error = %err,
                        "welcome sweep enqueue failed"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
