use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crm_domain::DomainResult;
use crm_domain::delivery::{DeliveryWorker, ProcessOutcome};
use crm_domain::error::DomainError;
use crm_domain::identity::InviterContext;
use crm_domain::mail::{
    DeliveryState, DeliveryStateKind, MALFORMED_DOCUMENT, MailDocument, MailMessage, RELAY_TIMEOUT,
};
use crm_domain::members::{
    InvitationSettings, MemberError, MemberService, MemberStatus, MemberWarning, NewMemberFields,
};
use crm_domain::notifications::{NotificationProjector, NotificationType};
use crm_domain::outbox::OutboxWriter;
use crm_domain::ports::BoxFuture;
use crm_domain::ports::members::MemberRepository;
use crm_domain::ports::outbox::{
    DeliveryTransition, MailListQuery, MailOutboxRepository, OutboxChangeFeed,
};
use crm_domain::ports::relay::{MailRelay, RelayAccept, RelayMessage, RelayRejection};
use crm_domain::roles::Role;
use crm_domain::sweep::WelcomeSweep;
use crm_infra::repositories::{
    InMemoryIdentityProvider, InMemoryMailOutbox, InMemoryMemberRepository,
    InMemoryNotificationRepository,
};

const COMPANY: &str = "company-1";

enum RelayBehavior {
    Accept,
    Reject(&'static str),
    Hang,
}

struct StubRelay {
    behavior: RelayBehavior,
    calls: AtomicUsize,
}

impl StubRelay {
    fn new(behavior: RelayBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MailRelay for StubRelay {
    fn send(&self, message: &RelayMessage) -> BoxFuture<'_, Result<RelayAccept, RelayRejection>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let recipient = message.to.join(",");
        Box::pin(async move {
            match self.behavior {
                RelayBehavior::Accept => Ok(RelayAccept {
                    message_id: format!("<stub-{call}@example.com>"),
                    response: format!("250 queued for {recipient}"),
                }),
                RelayBehavior::Reject(code) => {
                    Err(RelayRejection::new(code, "mailbox unavailable"))
                }
                RelayBehavior::Hang => std::future::pending().await,
            }
        })
    }
}

struct Harness {
    members: Arc<InMemoryMemberRepository>,
    identity: Arc<InMemoryIdentityProvider>,
    notifications: Arc<InMemoryNotificationRepository>,
    outbox: Arc<InMemoryMailOutbox>,
    service: MemberService,
    projector: NotificationProjector,
}

impl Harness {
    fn new() -> Self {
        let members = Arc::new(InMemoryMemberRepository::new());
        let identity = Arc::new(InMemoryIdentityProvider::new());
        let notifications = Arc::new(InMemoryNotificationRepository::new());
        let outbox = Arc::new(InMemoryMailOutbox::new("mails"));
        let projector = NotificationProjector::new(notifications.clone());
        let service = MemberService::new(
            members.clone(),
            identity.clone(),
            OutboxWriter::new(outbox.clone()),
            projector.clone(),
            InvitationSettings {
                login_url: "https://crm.example.com/login".into(),
                company_name: "Narratives".into(),
            },
        );
        Self {
            members,
            identity,
            notifications,
            outbox,
            service,
            projector,
        }
    }

    fn worker(&self, relay: Arc<StubRelay>) -> DeliveryWorker {
        DeliveryWorker::new(self.outbox.clone(), relay)
            .with_failure_notifications(self.projector.clone())
    }

    async fn outbox_documents(&self) -> Vec<MailDocument> {
        self.outbox
            .list(&MailListQuery::default())
            .await
            .expect("list outbox")
    }
}

fn admin() -> InviterContext {
    InviterContext::new("admin-1", Role::Admin)
}

fn fields(email: &str) -> NewMemberFields {
    NewMemberFields {
        email: email.to_string(),
        given_name: "Hanako".into(),
        family_name: "Sato".into(),
        given_name_reading: None,
        family_name_reading: None,
        role: Role::ProductionManager,
    }
}

#[tokio::test]
async fn invite_creates_member_mail_and_notifications() {
    let harness = Harness::new();

    let outcome = harness
        .service
        .invite_member(&admin(), fields(" Hanako@Example.com "), COMPANY)
        .await
        .expect("invite");

    let member = &outcome.member;
    assert_eq!(member.email, "hanako@example.com");
    assert_eq!(member.status, MemberStatus::Invited);
    assert_eq!(member.belong_to, vec![COMPANY.to_string()]);
    assert!(member.check_invariants().is_ok());
    assert!(outcome.warnings.is_empty());

    let credential = member.temporary_credential.clone().expect("credential");
    assert_eq!(
        harness.identity.credential_of(&member.member_id).await,
        Some(credential.clone())
    );
    assert!(!harness.identity.is_signed_in(&member.member_id).await);

    let documents = harness.outbox_documents().await;
    assert_eq!(documents.len(), 1);
    let mail = &documents[0];
    assert_eq!(Some(mail.mail_id.as_str()), outcome.mail_id.as_deref());
    assert_eq!(mail.to, vec!["hanako@example.com".to_string()]);
    assert_eq!(mail.attachments, Some(Vec::new()));
    assert_eq!(mail.delivery, DeliveryState::Unset);
    assert_eq!(
        mail.template.as_ref().map(|template| template.name.as_str()),
        Some("member-invitation")
    );
    assert!(
        mail.message
            .text
            .as_deref()
            .is_some_and(|text| text.contains(&credential))
    );

    let welcome = harness
        .projector
        .list(&member.member_id, true)
        .await
        .expect("list")
        .into_iter()
        .find(|notification| notification.notification_type == NotificationType::WelcomeEmail)
        .expect("welcome notification");
    assert!(!welcome.processed);
    assert_eq!(welcome.correlation_id, outcome.mail_id);

    let inviter_notices = harness.projector.list("admin-1", true).await.expect("list");
    assert!(
        inviter_notices
            .iter()
            .any(|notification| notification.notification_type == NotificationType::MemberAdded)
    );
}

#[tokio::test]
async fn unauthorized_inviter_creates_nothing() {
    let harness = Harness::new();
    let err = harness
        .service
        .invite_member(
            &InviterContext::new("user-1", Role::User),
            fields("someone@example.com"),
            COMPANY,
        )
        .await
        .expect_err("user role cannot invite");

    assert!(matches!(err, MemberError::Unauthorized(_)));
    assert!(
        harness
            .members
            .find_by_email("someone@example.com")
            .await
            .expect("lookup")
            .is_none()
    );
    assert_eq!(harness.identity.identity_count().await, 0);
    assert!(harness.outbox_documents().await.is_empty());
}

#[tokio::test]
async fn duplicate_email_is_rejected_before_identity_creation() {
    let harness = Harness::new();
    harness
        .service
        .invite_member(&admin(), fields("dup@example.com"), COMPANY)
        .await
        .expect("first invite");

    let err = harness
        .service
        .invite_member(&admin(), fields("DUP@example.com"), COMPANY)
        .await
        .expect_err("duplicate");
    assert!(matches!(err, MemberError::EmailAlreadyInUse));
    assert_eq!(harness.identity.identity_count().await, 1);
}

#[tokio::test]
async fn invalid_email_is_reported() {
    let harness = Harness::new();
    let err = harness
        .service
        .invite_member(&admin(), fields("not-an-email"), COMPANY)
        .await
        .expect_err("invalid email");
    assert!(matches!(err, MemberError::InvalidEmail));
}

#[tokio::test]
async fn delivered_invitation_reaches_success_once() {
    let harness = Harness::new();
    let outcome = harness
        .service
        .invite_member(&admin(), fields("deliver@example.com"), COMPANY)
        .await
        .expect("invite");
    let mail_id = outcome.mail_id.expect("mail queued");

    let relay = StubRelay::new(RelayBehavior::Accept);
    let worker = harness.worker(relay.clone());

    let first = worker.process(&mail_id).await.expect("process");
    let ProcessOutcome::Completed(DeliveryState::Success { message_id, .. }) = &first else {
        panic!("expected success, got {first:?}");
    };
    assert!(!message_id.is_empty());

    let second = worker.process(&mail_id).await.expect("process again");
    assert!(matches!(second, ProcessOutcome::AlreadyTerminal(DeliveryState::Success { .. })));
    assert_eq!(relay.calls(), 1);
}

#[tokio::test]
async fn document_without_subject_fails_as_malformed_without_relay_call() {
    let harness = Harness::new();
    let mut document = MailDocument::new(
        vec!["a@example.com".into()],
        MailMessage {
            subject: None,
            html: Some("<p>body</p>".into()),
            text: None,
        },
    );
    document.attachments = Some(Vec::new());
    harness.outbox.create(&document).await.expect("create");

    let relay = StubRelay::new(RelayBehavior::Accept);
    let outcome = harness
        .worker(relay.clone())
        .process(&document.mail_id)
        .await
        .expect("process");

    match outcome {
        ProcessOutcome::Completed(DeliveryState::Error { code, message, .. }) => {
            assert_eq!(code, MALFORMED_DOCUMENT);
            assert!(message.contains("message.subject"));
        }
        other => panic!("expected malformed error, got {other:?}"),
    }
    assert_eq!(relay.calls(), 0);
}

#[tokio::test]
async fn document_without_attachments_waits_for_repair() {
    let harness = Harness::new();
    let mut document = MailDocument::new(
        vec!["a@example.com".into()],
        MailMessage {
            subject: Some("Hi".into()),
            html: None,
            text: Some("Hi".into()),
        },
    );
    document.attachments = None;
    harness.outbox.insert_raw(document.clone()).await;

    let relay = StubRelay::new(RelayBehavior::Accept);
    let worker = harness.worker(relay.clone());
    let outcome = worker.process(&document.mail_id).await.expect("process");
    assert_eq!(outcome, ProcessOutcome::NotDispatchReady);
    assert_eq!(relay.calls(), 0);

    let stored = harness
        .outbox
        .get(&document.mail_id)
        .await
        .expect("get")
        .expect("document");
    assert_eq!(stored.delivery, DeliveryState::Unset);
}

#[tokio::test(start_paused = true)]
async fn relay_that_never_answers_times_out() {
    let harness = Harness::new();
    let outcome = harness
        .service
        .invite_member(&admin(), fields("slow@example.com"), COMPANY)
        .await
        .expect("invite");
    let mail_id = outcome.mail_id.expect("mail queued");

    let worker = harness
        .worker(StubRelay::new(RelayBehavior::Hang))
        .with_relay_timeout(Duration::from_secs(5));
    let outcome = worker.process(&mail_id).await.expect("process");

    match outcome {
        ProcessOutcome::Completed(DeliveryState::Error { code, .. }) => {
            assert_eq!(code, RELAY_TIMEOUT);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_invitation_notifies_the_inviter() {
    let harness = Harness::new();
    let outcome = harness
        .service
        .invite_member(&admin(), fields("bounce@example.com"), COMPANY)
        .await
        .expect("invite");
    let mail_id = outcome.mail_id.expect("mail queued");

    let result = harness
        .worker(StubRelay::new(RelayBehavior::Reject("550")))
        .process(&mail_id)
        .await
        .expect("process");
    assert!(matches!(
        result,
        ProcessOutcome::Completed(DeliveryState::Error { ref code, .. }) if code == "550"
    ));

    let failures: Vec<_> = harness
        .projector
        .list("admin-1", true)
        .await
        .expect("list")
        .into_iter()
        .filter(|notification| notification.notification_type == NotificationType::DeliveryFailed)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].correlation_id.as_deref(), Some(mail_id.as_str()));
    assert!(failures[0].body.contains("bounce@example.com"));
}

#[tokio::test]
async fn resend_rotates_credential_for_invited_member() {
    let harness = Harness::new();
    let invited = harness
        .service
        .invite_member(&admin(), fields("again@example.com"), COMPANY)
        .await
        .expect("invite")
        .member;
    let first_credential = invited.temporary_credential.clone().expect("credential");

    let resent = harness
        .service
        .resend_invitation(&admin(), &invited.member_id)
        .await
        .expect("resend");

    let second_credential = resent.member.temporary_credential.clone().expect("credential");
    assert_ne!(first_credential, second_credential);
    assert_eq!(resent.member.invitation_resend_count, 1);
    assert!(resent.member.invitation_resent_at_ms.is_some());
    assert_eq!(
        harness.identity.credential_of(&invited.member_id).await,
        Some(second_credential)
    );

    let documents = harness.outbox_documents().await;
    assert_eq!(documents.len(), 2);
    assert!(documents.iter().any(|document| {
        document
            .template
            .as_ref()
            .is_some_and(|template| template.name == "member-invitation-resend")
    }));
}

#[tokio::test]
async fn resend_to_active_member_keeps_credential() {
    let harness = Harness::new();
    let invited = harness
        .service
        .invite_member(&admin(), fields("active@example.com"), COMPANY)
        .await
        .expect("invite")
        .member;
    let active = harness
        .service
        .complete_password_change(&invited.member_id)
        .await
        .expect("activate");
    assert_eq!(active.status, MemberStatus::Active);
    assert!(active.temporary_credential.is_none());
    assert!(active.check_invariants().is_ok());

    let identity_credential = harness.identity.credential_of(&invited.member_id).await;
    let mails_before = harness.outbox_documents().await.len();

    let err = harness
        .service
        .resend_invitation(&admin(), &invited.member_id)
        .await
        .expect_err("active member");
    assert!(matches!(err, MemberError::InvalidState { .. }));

    let stored = harness.service.get(&invited.member_id).await.expect("get");
    assert_eq!(stored, active);
    assert_eq!(
        harness.identity.credential_of(&invited.member_id).await,
        identity_credential
    );
    assert_eq!(harness.outbox_documents().await.len(), mails_before);
}

#[tokio::test]
async fn welcome_projection_is_deduplicated() {
    let harness = Harness::new();
    let first = harness
        .projector
        .project_welcome("member-1", "Abcdef1234", None)
        .await
        .expect("first");
    let second = harness
        .projector
        .project_welcome("member-1", "Zyxwvu9876", None)
        .await
        .expect("second");
    assert_eq!(first.notification_id, second.notification_id);

    let all = harness.projector.list("member-1", true).await.expect("list");
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn welcome_sweep_queues_mail_for_uncorrelated_notifications() {
    let harness = Harness::new();
    let member = harness
        .service
        .invite_member(&admin(), fields("sweep@example.com"), COMPANY)
        .await
        .expect("invite")
        .member;

    // Drop the invitation's own welcome so the sweep sees an uncorrelated one.
    let existing = harness
        .projector
        .list(&member.member_id, true)
        .await
        .expect("list")
        .into_iter()
        .find(|notification| notification.notification_type == NotificationType::WelcomeEmail)
        .expect("welcome");
    harness
        .projector
        .mark_processed(&existing.notification_id)
        .await
        .expect("processed");
    let credential = member.temporary_credential.clone().expect("credential");
    harness
        .projector
        .project_welcome(&member.member_id, &credential, None)
        .await
        .expect("project");

    let sweep = WelcomeSweep::new(
        harness.notifications.clone(),
        harness.members.clone(),
        OutboxWriter::new(harness.outbox.clone()),
        "https://crm.example.com/login",
        "Narratives",
    );
    let report = sweep.run_once().await.expect("sweep");
    assert_eq!(report.scanned, 1);
    assert_eq!(report.mailed, 1);

    let welcome_mails = harness
        .outbox_documents()
        .await
        .into_iter()
        .filter(|document| {
            document
                .template
                .as_ref()
                .is_some_and(|template| template.name == "welcome")
        })
        .count();
    assert_eq!(welcome_mails, 1);

    let again = sweep.run_once().await.expect("second sweep");
    assert_eq!(again.scanned, 0);
}

#[tokio::test]
async fn welcome_sweep_skips_members_without_credential() {
    let harness = Harness::new();
    harness
        .projector
        .project_welcome("ghost-member", "Abcdef1234", None)
        .await
        .expect("project");

    let sweep = WelcomeSweep::new(
        harness.notifications.clone(),
        harness.members.clone(),
        OutboxWriter::new(harness.outbox.clone()),
        "https://crm.example.com/login",
        "Narratives",
    );
    let report = sweep.run_once().await.expect("sweep");
    assert_eq!(report.skipped_without_credential, 1);
    assert!(harness.outbox_documents().await.is_empty());
}

#[tokio::test]
async fn marking_read_twice_keeps_first_timestamp() {
    let harness = Harness::new();
    let notification = harness
        .projector
        .project_system("member-9", "Maintenance", "Tonight at 22:00")
        .await
        .expect("project");

    let first = harness
        .projector
        .mark_read(&notification.notification_id)
        .await
        .expect("read");
    assert!(first.is_read);
    assert!(first.read_state_consistent());

    let second = harness
        .projector
        .mark_read(&notification.notification_id)
        .await
        .expect("read again");
    assert_eq!(second.read_at_ms, first.read_at_ms);
    assert_eq!(harness.projector.unread_count("member-9").await.expect("count"), 0);
}

#[tokio::test]
async fn serve_delivers_documents_from_the_change_feed() {
    let harness = Harness::new();
    let relay = StubRelay::new(RelayBehavior::Accept);
    let worker = Arc::new(harness.worker(relay.clone()));
    let changes = harness.outbox.subscribe().await.expect("subscribe");
    let serving = tokio::spawn(worker.serve(changes));

    let outcome = harness
        .service
        .invite_member(&admin(), fields("feed@example.com"), COMPANY)
        .await
        .expect("invite");
    let mail_id = outcome.mail_id.expect("mail queued");

    let mut state = DeliveryStateKind::Unset;
    for _ in 0..100 {
        state = harness
            .outbox
            .get(&mail_id)
            .await
            .expect("get")
            .expect("document")
            .delivery
            .kind();
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, DeliveryStateKind::Success);
    assert_eq!(relay.calls(), 1);
    serving.abort();
}

/// Outbox whose writes always fail, for exercising the best-effort path.
struct UnavailableOutbox;

impl MailOutboxRepository for UnavailableOutbox {
    fn collection(&self) -> &str {
        "mails"
    }

    fn create(&self, _document: &MailDocument) -> BoxFuture<'_, DomainResult<MailDocument>> {
        Box::pin(async { Err(DomainError::Unavailable("outbox offline".into())) })
    }

    fn get(&self, _mail_id: &str) -> BoxFuture<'_, DomainResult<Option<MailDocument>>> {
        Box::pin(async { Ok(None) })
    }

    fn list(&self, _query: &MailListQuery) -> BoxFuture<'_, DomainResult<Vec<MailDocument>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn count(&self) -> BoxFuture<'_, DomainResult<u64>> {
        Box::pin(async { Ok(0) })
    }

    fn transition(
        &self,
        _mail_id: &str,
        _next: &DeliveryState,
    ) -> BoxFuture<'_, DomainResult<DeliveryTransition>> {
        Box::pin(async { Err(DomainError::NotFound) })
    }

    fn set_empty_attachments(&self, _mail_id: &str) -> BoxFuture<'_, DomainResult<bool>> {
        Box::pin(async { Err(DomainError::NotFound) })
    }

    fn write_batch(&self, _documents: &[MailDocument]) -> BoxFuture<'_, DomainResult<usize>> {
        Box::pin(async { Err(DomainError::Unavailable("outbox offline".into())) })
    }

    fn delete_batch(&self, _mail_ids: &[String]) -> BoxFuture<'_, DomainResult<usize>> {
        Box::pin(async { Err(DomainError::Unavailable("outbox offline".into())) })
    }
}

#[tokio::test]
async fn invite_survives_outbox_outage_and_sweep_catches_up() {
    let harness = Harness::new();
    let service = MemberService::new(
        harness.members.clone(),
        harness.identity.clone(),
        OutboxWriter::new(Arc::new(UnavailableOutbox)),
        harness.projector.clone(),
        InvitationSettings {
            login_url: "https://crm.example.com/login".into(),
            company_name: "Narratives".into(),
        },
    );

    let outcome = service
        .invite_member(&admin(), fields("outage@example.com"), COMPANY)
        .await
        .expect("invite still succeeds");
    assert!(outcome.mail_id.is_none());
    assert!(
        outcome
            .warnings
            .iter()
            .any(|warning| matches!(warning, MemberWarning::MailNotQueued(_)))
    );
    assert_eq!(outcome.member.status, MemberStatus::Invited);

    let welcome = harness
        .projector
        .list(&outcome.member.member_id, true)
        .await
        .expect("list")
        .into_iter()
        .find(|notification| notification.notification_type == NotificationType::WelcomeEmail)
        .expect("welcome");
    assert!(welcome.correlation_id.is_none());

    // The sweep runs against the healthy outbox once it is back.
    let sweep = WelcomeSweep::new(
        harness.notifications.clone(),
        harness.members.clone(),
        OutboxWriter::new(harness.outbox.clone()),
        "https://crm.example.com/login",
        "Narratives",
    );
    let report = sweep.run_once().await.expect("sweep");
    assert_eq!(report.mailed, 1);
    let documents = harness.outbox_documents().await;
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].to, vec!["outage@example.com".to_string()]);
}

fn root() -> InviterContext {
    InviterContext::new("root-1", Role::Root)
}

async fn wait_for_terminal(outbox: &InMemoryMailOutbox, mail_id: &str) -> DeliveryStateKind {
    let mut state = DeliveryStateKind::Unset;
    for _ in 0..100 {
        state = outbox
            .get(mail_id)
            .await
            .expect("get")
            .expect("document")
            .delivery
            .kind();
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    state
}

#[tokio::test]
async fn serve_resumes_mail_queued_while_no_worker_listened() {
    let harness = Harness::new();
    let queued = harness
        .service
        .invite_member(&admin(), fields("backlog@example.com"), COMPANY)
        .await
        .expect("invite")
        .mail_id
        .expect("mail queued");

    // Left behind by an invocation that died after claiming the document.
    let mut stranded = MailDocument::new(
        vec!["stranded@example.com".into()],
        MailMessage {
            subject: Some("Stranded".into()),
            html: None,
            text: Some("body".into()),
        },
    );
    stranded.delivery = DeliveryState::Processing { started_at_ms: 1 };
    let stranded_id = stranded.mail_id.clone();
    harness.outbox.insert_raw(stranded).await;

    let relay = StubRelay::new(RelayBehavior::Accept);
    let worker = Arc::new(harness.worker(relay.clone()));
    assert_eq!(
        worker.backlog().await.expect("backlog"),
        vec![queued.clone(), stranded_id.clone()]
    );

    let changes = harness.outbox.subscribe().await.expect("subscribe");
    let serving = tokio::spawn(worker.serve(changes));

    assert_eq!(
        wait_for_terminal(&harness.outbox, &queued).await,
        DeliveryStateKind::Success
    );
    assert_eq!(
        wait_for_terminal(&harness.outbox, &stranded_id).await,
        DeliveryStateKind::Success
    );
    assert_eq!(relay.calls(), 2);
    serving.abort();
}

#[tokio::test]
async fn backlog_skips_documents_waiting_for_repair() {
    let harness = Harness::new();
    let mut legacy = MailDocument::new(
        vec!["legacy@example.com".into()],
        MailMessage {
            subject: Some("Legacy".into()),
            html: None,
            text: Some("body".into()),
        },
    );
    legacy.attachments = None;
    harness.outbox.insert_raw(legacy).await;

    let worker = harness.worker(StubRelay::new(RelayBehavior::Accept));
    assert!(worker.backlog().await.expect("backlog").is_empty());
}

#[tokio::test]
async fn inviter_cannot_grant_a_role_at_or_above_their_own() {
    let harness = Harness::new();
    for role in [Role::Root, Role::Admin] {
        let mut requested = fields("climber@example.com");
        requested.role = role;
        let err = harness
            .service
            .invite_member(&admin(), requested, COMPANY)
            .await
            .expect_err("admin cannot grant this role");
        assert!(matches!(err, MemberError::Unauthorized(_)));
    }
    assert_eq!(harness.identity.identity_count().await, 0);
    assert!(harness.outbox_documents().await.is_empty());

    let mut requested = fields("brand-admin@example.com");
    requested.role = Role::Admin;
    let invited = harness
        .service
        .invite_member(&root(), requested, COMPANY)
        .await
        .expect("root grants admin")
        .member;
    assert_eq!(invited.role, Role::Admin);
}

#[tokio::test]
async fn resend_replaces_the_pending_welcome() {
    let harness = Harness::new();
    let invited = harness
        .service
        .invite_member(&admin(), fields("welcome-again@example.com"), COMPANY)
        .await
        .expect("invite")
        .member;
    let old_credential = invited.temporary_credential.clone().expect("credential");

    let resent = harness
        .service
        .resend_invitation(&admin(), &invited.member_id)
        .await
        .expect("resend");
    assert!(resent.warnings.is_empty());
    let new_credential = resent.member.temporary_credential.clone().expect("credential");

    let welcomes: Vec<_> = harness
        .projector
        .list(&invited.member_id, true)
        .await
        .expect("list")
        .into_iter()
        .filter(|notification| notification.notification_type == NotificationType::WelcomeEmail)
        .collect();
    assert_eq!(welcomes.len(), 2);

    let pending: Vec<_> = welcomes.iter().filter(|welcome| !welcome.processed).collect();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].body.contains(&new_credential));
    assert!(!pending[0].body.contains(&old_credential));
    assert_eq!(pending[0].correlation_id, resent.mail_id);

    let retired = welcomes
        .iter()
        .find(|welcome| welcome.processed)
        .expect("retired welcome");
    assert!(retired.body.contains(&old_credential));
    assert!(retired.processed_at_ms.is_some());
}

#[tokio::test]
async fn change_role_respects_rank_and_notifies_the_member() {
    let harness = Harness::new();
    let member = harness
        .service
        .invite_member(&admin(), fields("promote@example.com"), COMPANY)
        .await
        .expect("invite")
        .member;

    let err = harness
        .service
        .change_role(&admin(), &member.member_id, Role::Root)
        .await
        .expect_err("admin cannot grant root");
    assert!(matches!(err, MemberError::Unauthorized(_)));
    let err = harness
        .service
        .change_role(
            &InviterContext::new("pm-1", Role::ProductionManager),
            &member.member_id,
            Role::User,
        )
        .await
        .expect_err("production manager cannot change roles");
    assert!(matches!(err, MemberError::Unauthorized(_)));

    let demoted = harness
        .service
        .change_role(&admin(), &member.member_id, Role::User)
        .await
        .expect("admin demotes");
    assert_eq!(demoted.role, Role::User);
    assert!(demoted.check_invariants().is_ok());

    let promoted = harness
        .service
        .change_role(&root(), &member.member_id, Role::Admin)
        .await
        .expect("root promotes");
    assert_eq!(promoted.role, Role::Admin);
    assert!(promoted.check_invariants().is_ok());
    assert_eq!(harness.service.get(&member.member_id).await.expect("get"), promoted);

    let role_notices = harness
        .projector
        .list(&member.member_id, true)
        .await
        .expect("list")
        .into_iter()
        .filter(|notification| notification.notification_type == NotificationType::RoleChanged)
        .count();
    assert_eq!(role_notices, 2);

    // Same role again writes nothing.
    harness
        .service
        .change_role(&root(), &member.member_id, Role::Admin)
        .await
        .expect("no-op");
    let role_notices = harness
        .projector
        .list(&member.member_id, true)
        .await
        .expect("list")
        .into_iter()
        .filter(|notification| notification.notification_type == NotificationType::RoleChanged)
        .count();
    assert_eq!(role_notices, 2);
}

#[tokio::test]
async fn suspended_member_cannot_change_password() {
    let harness = Harness::new();
    let member = harness
        .service
        .invite_member(&admin(), fields("suspend@example.com"), COMPANY)
        .await
        .expect("invite")
        .member;

    let err = harness
        .service
        .suspend_member(&admin(), &member.member_id)
        .await
        .expect_err("admin lacks user_manage");
    assert!(matches!(err, MemberError::Unauthorized(_)));

    let suspended = harness
        .service
        .suspend_member(&root(), &member.member_id)
        .await
        .expect("suspend");
    assert_eq!(suspended.status, MemberStatus::Suspended);
    assert_eq!(suspended.role, Role::Suspended);
    assert!(suspended.check_invariants().is_ok());

    let err = harness
        .service
        .complete_password_change(&member.member_id)
        .await
        .expect_err("suspended");
    assert!(matches!(err, MemberError::InvalidState { .. }));
    let stored = harness.service.get(&member.member_id).await.expect("get");
    assert_eq!(stored, suspended);
}

#[tokio::test]
async fn delete_member_revokes_the_identity() {
    let harness = Harness::new();
    let member = harness
        .service
        .invite_member(&admin(), fields("leaving@example.com"), COMPANY)
        .await
        .expect("invite")
        .member;
    assert!(member.check_invariants().is_ok());
    assert_eq!(harness.identity.identity_count().await, 1);

    let err = harness
        .service
        .delete_member(&admin(), &member.member_id)
        .await
        .expect_err("admin lacks user_manage");
    assert!(matches!(err, MemberError::Unauthorized(_)));
    assert_eq!(harness.identity.identity_count().await, 1);

    harness
        .service
        .delete_member(&root(), &member.member_id)
        .await
        .expect("delete");
    assert_eq!(harness.identity.identity_count().await, 0);
    assert!(harness.identity.credential_of(&member.member_id).await.is_none());
    assert!(matches!(
        harness.service.get(&member.member_id).await,
        Err(MemberError::NotFound)
    ));
}

#[tokio::test]
async fn add_membership_is_idempotent() {
    let harness = Harness::new();
    let member = harness
        .service
        .invite_member(&admin(), fields("multi@example.com"), COMPANY)
        .await
        .expect("invite")
        .member;

    let first = harness
        .service
        .add_membership(&admin(), &member.member_id, "company-2")
        .await
        .expect("add");
    let second = harness
        .service
        .add_membership(&admin(), &member.member_id, "company-2")
        .await
        .expect("add again");
    assert_eq!(first.belong_to, vec![COMPANY.to_string(), "company-2".to_string()]);
    assert_eq!(second, first);
    assert!(second.check_invariants().is_ok());
    assert_eq!(
        harness
            .service
            .list_by_company("company-2")
            .await
            .expect("list")
            .len(),
        1
    );
}

#[tokio::test]
async fn mark_all_read_keeps_read_state_consistent() {
    let harness = Harness::new();
    let early = harness
        .projector
        .project_system("member-7", "Earlier", "Already seen")
        .await
        .expect("project");
    let first_read = harness
        .projector
        .mark_read(&early.notification_id)
        .await
        .expect("read");
    for title in ["One", "Two", "Three"] {
        harness
            .projector
            .project_system("member-7", title, "body")
            .await
            .expect("project");
    }
    harness
        .projector
        .project_system("member-8", "Elsewhere", "body")
        .await
        .expect("project");

    let changed = harness
        .projector
        .mark_all_read("member-7")
        .await
        .expect("mark all");
    assert_eq!(changed, 3);
    assert_eq!(harness.projector.unread_count("member-7").await.expect("count"), 0);
    assert_eq!(harness.projector.unread_count("member-8").await.expect("count"), 1);

    let records = harness.projector.list("member-7", true).await.expect("list");
    assert_eq!(records.len(), 4);
    for record in &records {
        assert!(record.is_read);
        assert!(record.read_state_consistent());
    }
    let early_after = records
        .iter()
        .find(|record| record.notification_id == early.notification_id)
        .expect("early record");
    assert_eq!(early_after.read_at_ms, first_read.read_at_ms);

    for record in harness.projector.list("member-8", true).await.expect("list") {
        assert!(!record.is_read);
        assert!(record.read_state_consistent());
    }

    assert_eq!(
        harness
            .projector
            .mark_all_read("member-7")
            .await
            .expect("again"),
        0
    );
}
