//! Business members: the record, its lifecycle invariant and the service that
//! invites, re-invites and administers them.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

use crate::credentials::{is_strong_credential, issue_temporary_credential};
use crate::error::DomainError;
use crate::identity::InviterContext;
use crate::notifications::NotificationProjector;
use crate::outbox::{EnqueueOutcome, MailRequest, OutboxWriter};
use crate::ports::identity::{IdentityError, IdentityProvider};
use crate::ports::members::MemberRepository;
use crate::roles::Role;
use crate::templates::{
    MailTemplate, PARAM_COMPANY_NAME, PARAM_INVITED_BY, PARAM_LOGIN_URL, PARAM_MEMBER_ID,
    PARAM_MEMBER_NAME, PARAM_RESEND_COUNT, PARAM_ROLE, PARAM_TEMPORARY_PASSWORD, TemplateParams,
};
use crate::util::now_ms;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Invited,
    Active,
    Suspended,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invited => "invited",
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }
}

impl FromStr for MemberStatus {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "invited" => Ok(Self::Invited),
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            _ => Err("unknown member status"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberRecord {
    pub member_id: String,
    pub email: String,
    pub given_name: String,
    pub family_name: String,
    pub given_name_reading: Option<String>,
    pub family_name_reading: Option<String>,
    pub role: Role,
    pub status: MemberStatus,
    pub email_verified: bool,
    pub temporary_credential: Option<String>,
    pub invitation_resend_count: u32,
    pub invitation_resent_at_ms: Option<i64>,
    pub password_changed_at_ms: Option<i64>,
    pub belong_to: Vec<String>,
    pub invited_by: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl MemberRecord {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.family_name, self.given_name)
            .trim()
            .to_string()
    }

    /// Invited members hold a credential; active members have cleared it and
    /// verified their email.
    pub fn check_invariants(&self) -> Result<(), String> {
        match self.status {
            MemberStatus::Invited if self.temporary_credential.is_none() => {
                Err(format!("invited member {} has no credential", self.member_id))
            }
            MemberStatus::Active if self.temporary_credential.is_some() => Err(format!(
                "active member {} still holds a credential",
                self.member_id
            )),
            MemberStatus::Active if !self.email_verified => Err(format!(
                "active member {} has an unverified email",
                self.member_id
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct NewMemberFields {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 100))]
    pub given_name: String,
    #[validate(length(min = 1, max = 100))]
    pub family_name: String,
    pub given_name_reading: Option<String>,
    pub family_name_reading: Option<String>,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum MemberError {
    #[error("actor lacks permission: {0}")]
    Unauthorized(&'static str),
    #[error("invalid email address")]
    InvalidEmail,
    #[error("invalid member fields: {0}")]
    InvalidFields(String),
    #[error("email already in use")]
    EmailAlreadyInUse,
    #[error("issued credential failed the strength policy")]
    WeakCredential,
    #[error("member not found")]
    NotFound,
    #[error("member is {status}; {reason}")]
    InvalidState {
        status: &'static str,
        reason: &'static str,
    },
    /// The identity exists but the member record does not. Needs an operator
    /// to either retry the record write or delete the identity.
    #[error("identity {identity_id} created but member record write failed: {source}")]
    PartialInvite {
        identity_id: String,
        #[source]
        source: DomainError,
    },
    #[error("identity provider failed: {0}")]
    Identity(IdentityError),
    #[error(transparent)]
    Store(#[from] DomainError),
}

impl From<IdentityError> for MemberError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::EmailAlreadyInUse => Self::EmailAlreadyInUse,
            IdentityError::InvalidEmail => Self::InvalidEmail,
            IdentityError::WeakCredential => Self::WeakCredential,
            IdentityError::NotFound => Self::NotFound,
            other => Self::Identity(other),
        }
    }
}

/// Degraded side effects of an otherwise successful operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberWarning {
    MailNotQueued(String),
    NotificationNotCreated(String),
    SignOutFailed(String),
}

#[derive(Clone, Debug)]
pub struct InviteOutcome {
    pub member: MemberRecord,
    pub mail_id: Option<String>,
    pub warnings: Vec<MemberWarning>,
}

#[derive(Clone, Debug)]
pub struct ResendOutcome {
    pub member: MemberRecord,
    pub mail_id: Option<String>,
    pub warnings: Vec<MemberWarning>,
}

#[derive(Clone, Debug)]
pub struct InvitationSettings {
    pub login_url: String,
    pub company_name: String,
}

#[derive(Clone)]
pub struct MemberService {
    members: Arc<dyn MemberRepository>,
    identity: Arc<dyn IdentityProvider>,
    outbox: OutboxWriter,
    projector: NotificationProjector,
    settings: InvitationSettings,
}

impl MemberService {
    pub fn new(
        members: Arc<dyn MemberRepository>,
        identity: Arc<dyn IdentityProvider>,
        outbox: OutboxWriter,
        projector: NotificationProjector,
        settings: InvitationSettings,
    ) -> Self {
        Self {
            members,
            identity,
            outbox,
            projector,
            settings,
        }
    }

    pub async fn get(&self, member_id: &str) -> Result<MemberRecord, MemberError> {
        self.members
            .get(member_id)
            .await?
            .ok_or(MemberError::NotFound)
    }

    pub async fn list_by_company(
        &self,
        company_id: &str,
    ) -> Result<Vec<MemberRecord>, MemberError> {
        Ok(self.members.list_by_company(company_id).await?)
    }

    /// Creates the identity and an `invited` member record, then queues the
    /// invitation mail and notifications. Failures after the record is stored
    /// come back as warnings on the outcome.
    pub async fn invite_member(
        &self,
        inviter: &InviterContext,
        fields: NewMemberFields,
        company_id: &str,
    ) -> Result<InviteOutcome, MemberError> {
        if !inviter.role.can_invite() {
            return Err(MemberError::Unauthorized("member_invite"));
        }
        // Inviters below the user managers may only hand out roles under their own.
        if !inviter.role.can_manage_members() && !inviter.role.outranks(fields.role) {
            return Err(MemberError::Unauthorized("user_manage"));
        }
        let fields = normalize_fields(fields);
        if let Err(err) = fields.validate() {
            if err.field_errors().contains_key("email") {
                return Err(MemberError::InvalidEmail);
            }
            return Err(MemberError::InvalidFields(err.to_string()));
        }
        if company_id.trim().is_empty() {
            return Err(MemberError::InvalidFields("company_id is required".into()));
        }
        if self.members.find_by_email(&fields.email).await?.is_some() {
            return Err(MemberError::EmailAlreadyInUse);
        }

        let credential = issue_temporary_credential();
        if !is_strong_credential(&credential) {
            return Err(MemberError::WeakCredential);
        }

        let identity_id = self
            .identity
            .create_identity(&fields.email, &credential)
            .await?;

        let now = now_ms();
        let record = MemberRecord {
            member_id: identity_id.clone(),
            email: fields.email,
            given_name: fields.given_name,
            family_name: fields.family_name,
            given_name_reading: fields.given_name_reading,
            family_name_reading: fields.family_name_reading,
            role: fields.role,
            status: MemberStatus::Invited,
            email_verified: false,
            temporary_credential: Some(credential.clone()),
            invitation_resend_count: 0,
            invitation_resent_at_ms: None,
            password_changed_at_ms: None,
            belong_to: vec![company_id.to_string()],
            invited_by: Some(inviter.member_id.clone()),
            created_at_ms: now,
            updated_at_ms: now,
        };
        let member = match self.members.create(&record).await {
            Ok(member) => member,
            Err(source) => {
                tracing::error!(
                    identity_id = %identity_id,
                    error = %source,
                    "identity created but member record was not stored; operator action required"
                );
                return Err(MemberError::PartialInvite {
                    identity_id,
                    source,
                });
            }
        };

        let mut warnings = Vec::new();
        let enqueue = self
            .outbox
            .enqueue_best_effort(self.invitation_mail(
                &member,
                &credential,
                MailTemplate::MemberInvitation,
                &inviter.member_id,
            ))
            .await;
        if let Some(reason) = enqueue.failure() {
            warnings.push(MemberWarning::MailNotQueued(reason.to_string()));
        }

        self.project_invitation_notices(&member, &credential, &enqueue, &mut warnings)
            .await;
        if let Err(err) = self
            .projector
            .project_member_added(&inviter.member_id, &member.member_id, &member.email)
            .await
        {
            warnings.push(MemberWarning::NotificationNotCreated(err.to_string()));
        }

        if let Err(err) = self.identity.sign_out(&member.member_id).await {
            tracing::warn!(
                member_id = %member.member_id,
                error = %err,
                "sign-out after invite failed"
            );
            warnings.push(MemberWarning::SignOutFailed(err.to_string()));
        }

        tracing::info!(
            member_id = %member.member_id,
            inviter_id = %inviter.member_id,
            role = member.role.as_str(),
            warnings = warnings.len(),
            "member invited"
        );
        Ok(InviteOutcome {
            mail_id: enqueue.mail_id().map(str::to_string),
            member,
            warnings,
        })
    }

    /// Rotates the credential of an `invited` member and queues a fresh
    /// invitation mail. The previous credential stops working.
    pub async fn resend_invitation(
        &self,
        inviter: &InviterContext,
        member_id: &str,
    ) -> Result<ResendOutcome, MemberError> {
        if !inviter.role.can_invite() {
            return Err(MemberError::Unauthorized("member_invite"));
        }
        let mut member = self.get(member_id).await?;
        if member.status != MemberStatus::Invited {
            return Err(MemberError::InvalidState {
                status: member.status.as_str(),
                reason: "only invited members can be re-invited",
            });
        }

        let credential = issue_temporary_credential();
        if !is_strong_credential(&credential) {
            return Err(MemberError::WeakCredential);
        }
        self.identity
            .update_credential(&member.member_id, &credential)
            .await?;

        let now = now_ms();
        member.temporary_credential = Some(credential.clone());
        member.invitation_resend_count += 1;
        member.invitation_resent_at_ms = Some(now);
        member.updated_at_ms = now;
        let member = self.members.update(&member).await?;

        let mut warnings = Vec::new();
        let enqueue = self
            .outbox
            .enqueue_best_effort(self.invitation_mail(
                &member,
                &credential,
                MailTemplate::MemberInvitationResend,
                &inviter.member_id,
            ))
            .await;
        if let Some(reason) = enqueue.failure() {
            warnings.push(MemberWarning::MailNotQueued(reason.to_string()));
        }
        // The pending welcome still shows the credential rotated out above.
        if let Err(err) = self.projector.retire_pending_welcome(&member.member_id).await {
            warnings.push(MemberWarning::NotificationNotCreated(err.to_string()));
        }
        self.project_invitation_notices(&member, &credential, &enqueue, &mut warnings)
            .await;

        tracing::info!(
            member_id = %member.member_id,
            resend_count = member.invitation_resend_count,
            "invitation resent"
        );
        Ok(ResendOutcome {
            mail_id: enqueue.mail_id().map(str::to_string),
            member,
            warnings,
        })
    }

    /// The member replaced their temporary credential. Activates an invited
    /// member and clears the credential.
    pub async fn complete_password_change(
        &self,
        member_id: &str,
    ) -> Result<MemberRecord, MemberError> {
        let mut member = self.get(member_id).await?;
        if member.status == MemberStatus::Suspended {
            return Err(MemberError::InvalidState {
                status: member.status.as_str(),
                reason: "suspended members cannot change their password",
            });
        }
        let now = now_ms();
        member.temporary_credential = None;
        member.password_changed_at_ms = Some(now);
        member.email_verified = true;
        member.status = MemberStatus::Active;
        member.updated_at_ms = now;
        Ok(self.members.update(&member).await?)
    }

    pub async fn change_role(
        &self,
        actor: &InviterContext,
        member_id: &str,
        new_role: Role,
    ) -> Result<MemberRecord, MemberError> {
        let mut member = self.get(member_id).await?;
        let allowed = actor.role.can_manage_members()
            || (actor.role.can_invite()
                && actor.role.outranks(member.role)
                && actor.role.outranks(new_role));
        if !allowed {
            return Err(MemberError::Unauthorized("user_manage"));
        }
        if member.role == new_role {
            return Ok(member);
        }
        member.role = new_role;
        member.updated_at_ms = now_ms();
        let member = self.members.update(&member).await?;
        if let Err(err) = self
            .projector
            .project_role_changed(&member.member_id, new_role)
            .await
        {
            tracing::warn!(
                member_id = %member.member_id,
                error = %err,
                "role change notification failed"
            );
        }
        Ok(member)
    }

    pub async fn suspend_member(
        &self,
        actor: &InviterContext,
        member_id: &str,
    ) -> Result<MemberRecord, MemberError> {
        if !actor.role.can_manage_members() {
            return Err(MemberError::Unauthorized("user_manage"));
        }
        let mut member = self.get(member_id).await?;
        member.status = MemberStatus::Suspended;
        member.role = Role::Suspended;
        member.updated_at_ms = now_ms();
        Ok(self.members.update(&member).await?)
    }

    pub async fn add_membership(
        &self,
        actor: &InviterContext,
        member_id: &str,
        company_id: &str,
    ) -> Result<MemberRecord, MemberError> {
        if !actor.role.can_invite() {
            return Err(MemberError::Unauthorized("member_invite"));
        }
        let mut member = self.get(member_id).await?;
        if !member.belong_to.iter().any(|existing| existing == company_id) {
            member.belong_to.push(company_id.to_string());
            member.updated_at_ms = now_ms();
            member = self.members.update(&member).await?;
        }
        Ok(member)
    }

    /// Removes the record and revokes the external identity.
    pub async fn delete_member(
        &self,
        actor: &InviterContext,
        member_id: &str,
    ) -> Result<(), MemberError> {
        if !actor.role.can_manage_members() {
            return Err(MemberError::Unauthorized("user_manage"));
        }
        let member = self.get(member_id).await?;
        self.members.delete(&member.member_id).await?;
        match self.identity.delete_identity(&member.member_id).await {
            Ok(()) | Err(IdentityError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        tracing::info!(member_id, actor_id = %actor.member_id, "member deleted");
        Ok(())
    }

    fn invitation_mail(
        &self,
        member: &MemberRecord,
        credential: &str,
        template: MailTemplate,
        inviter_id: &str,
    ) -> MailRequest {
        let mut params = TemplateParams::new();
        params.insert(PARAM_MEMBER_NAME.into(), member.display_name());
        params.insert(PARAM_MEMBER_ID.into(), member.member_id.clone());
        params.insert(PARAM_TEMPORARY_PASSWORD.into(), credential.to_string());
        params.insert(PARAM_ROLE.into(), member.role.display_name().to_string());
        params.insert(PARAM_LOGIN_URL.into(), self.settings.login_url.clone());
        params.insert(PARAM_COMPANY_NAME.into(), self.settings.company_name.clone());
        params.insert(PARAM_INVITED_BY.into(), inviter_id.to_string());
        if template == MailTemplate::MemberInvitationResend {
            params.insert(
                PARAM_RESEND_COUNT.into(),
                member.invitation_resend_count.to_string(),
            );
        }
        MailRequest::new(vec![member.email.clone()], template, params)
    }

    async fn project_invitation_notices(
        &self,
        member: &MemberRecord,
        credential: &str,
        enqueue: &EnqueueOutcome,
        warnings: &mut Vec<MemberWarning>,
    ) {
        if let Err(err) = self
            .projector
            .project_welcome(&member.member_id, credential, enqueue.mail_id())
            .await
        {
            warnings.push(MemberWarning::NotificationNotCreated(err.to_string()));
        }
        if let Err(err) = self
            .projector
            .project_temporary_password_reminder(&member.member_id)
            .await
        {
            warnings.push(MemberWarning::NotificationNotCreated(err.to_string()));
        }
    }
}

fn normalize_fields(mut fields: NewMemberFields) -> NewMemberFields {
    fields.email = fields.email.trim().to_ascii_lowercase();
    fields.given_name = fields.given_name.trim().to_string();
    fields.family_name = fields.family_name.trim().to_string();
    fields.given_name_reading = fields
        .given_name_reading
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    fields.family_name_reading = fields
        .family_name_reading
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    fields
}
