use std::sync::Arc;

use crm_domain::DomainResult;
use crm_domain::error::DomainError;
use crm_domain::mail::{
    DeliveryState, DeliveryStateKind, MailAttachment, MailDocument, MailMessage, TemplateMetadata,
};
use crm_domain::members::{MemberRecord, MemberStatus};
use crm_domain::notifications::{NotificationRecord, NotificationType};
use crm_domain::ports::BoxFuture;
use crm_domain::ports::identity::{IdentityError, IdentityProvider};
use crm_domain::ports::members::MemberRepository;
use crm_domain::ports::notifications::{NotificationListQuery, NotificationRepository};
use crm_domain::ports::outbox::{
    DeliveryTransition, MAX_ATOMIC_WRITES, MailListQuery, MailOutboxRepository, OutboxChange,
    OutboxChangeFeed, OutboxChangeKind,
};
use crm_domain::roles::Role;
use crm_domain::util::uuid_v7_without_dashes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use surrealdb::engine::remote::ws::Client;
use surrealdb::types::Action;
use surrealdb::{Notification, Surreal};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::mpsc::{self, UnboundedReceiver};

const MEMBER_TABLE: &str = "crm_member";
const NOTIFICATION_TABLE: &str = "crm_notification";
const IDENTITY_TABLE: &str = "crm_identity";

// Result ordering applies to the projection, so every field list carries the
// creation instant as integer nanoseconds next to the string form the rows
// decode. String timestamps from other producers sort correctly too.
const MEMBER_FIELDS: &str = "member_id, email, given_name, family_name, given_name_reading, \
    family_name_reading, role, status, email_verified, temporary_credential, \
    invitation_resend_count, \
    IF invitation_resent_at = NONE { NONE } ELSE { <string>invitation_resent_at } AS invitation_resent_at, \
    IF password_changed_at = NONE { NONE } ELSE { <string>password_changed_at } AS password_changed_at, \
    belong_to, invited_by, <string>created_at AS created_at, <string>updated_at AS updated_at, \
    time::nano(<datetime>created_at) AS created_order";

const NOTIFICATION_FIELDS: &str = "notification_id, member_id, notification_type, title, body, \
    is_read, IF read_at = NONE { NONE } ELSE { <string>read_at } AS read_at, \
    <string>created_at AS created_at, correlation_id, processed, \
    IF processed_at = NONE { NONE } ELSE { <string>processed_at } AS processed_at, \
    time::nano(<datetime>created_at) AS created_order";

const MAIL_FIELDS: &str = "mail_id, recipients, cc, bcc, reply_to, sender, message, attachments, \
    template, delivery, <string>created_at AS created_at, \
    IF migrated_at = NONE { NONE } ELSE { <string>migrated_at } AS migrated_at, original_id, \
    time::nano(<datetime>created_at) AS created_order";

const UNSET_CONDITION: &str = "(delivery = NONE OR delivery = NULL OR delivery.state = 'UNSET')";

const NOT_TERMINAL: &str =
    "(delivery = NONE OR delivery = NULL OR delivery.state NOT IN ['SUCCESS', 'ERROR'])";

fn parse_rfc3339(value: &str) -> DomainResult<i64> {
    let dt = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| DomainError::Validation(format!("invalid timestamp: {err}")))?;
    Ok((dt.unix_timestamp_nanos() / 1_000_000) as i64)
}

fn to_rfc3339(epoch_ms: i64) -> DomainResult<String> {
    let dt = OffsetDateTime::from_unix_timestamp_nanos(epoch_ms as i128 * 1_000_000)
        .map_err(|err| DomainError::Validation(format!("invalid ms timestamp: {err}")))?;
    Ok(dt
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string()))
}

fn map_surreal_error(err: surrealdb::Error) -> DomainError {
    let error_message = err.to_string().to_lowercase();
    if error_message.contains("already exists")
        || error_message.contains("duplicate")
        || error_message.contains("unique")
        || error_message.contains("conflict")
    {
        return DomainError::Conflict;
    }
    if error_message.contains("connection") || error_message.contains("websocket") {
        return DomainError::Unavailable(error_message);
    }
    DomainError::Validation(format!("surreal query failed: {error_message}"))
}

fn invalid_result(err: surrealdb::Error) -> DomainError {
    DomainError::Validation(format!("invalid query result: {err}"))
}

fn decode_rows<Row, T>(
    rows: Vec<Value>,
    label: &str,
    convert: impl Fn(Row) -> DomainResult<T>,
) -> DomainResult<Vec<T>>
where
    Row: for<'de> Deserialize<'de>,
{
    rows.into_iter()
        .map(|row| {
            serde_json::from_value::<Row>(row)
                .map_err(|err| DomainError::Validation(format!("invalid {label} row: {err}")))
                .and_then(&convert)
        })
        .collect()
}

/// Table names are interpolated into SurrealQL, so only plain identifiers
/// are accepted.
fn validate_table_name(name: &str) -> DomainResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
        && !name.starts_with(|ch: char| ch.is_ascii_digit());
    if !valid {
        return Err(DomainError::Validation(format!(
            "invalid collection name '{name}'"
        )));
    }
    Ok(())
}

/// Defines the unique indexes the repositories rely on for conflict
/// detection. Safe to run on every start.
pub async fn ensure_schema(
    client: &Surreal<Client>,
    outbox_collections: &[&str],
) -> DomainResult<()> {
    let mut statements = format!(
        "DEFINE INDEX IF NOT EXISTS member_id_unique ON TABLE {MEMBER_TABLE} FIELDS member_id UNIQUE; \
         DEFINE INDEX IF NOT EXISTS member_email_unique ON TABLE {MEMBER_TABLE} FIELDS email UNIQUE; \
         DEFINE INDEX IF NOT EXISTS notification_id_unique ON TABLE {NOTIFICATION_TABLE} FIELDS notification_id UNIQUE; \
         DEFINE INDEX IF NOT EXISTS identity_id_unique ON TABLE {IDENTITY_TABLE} FIELDS identity_id UNIQUE; \
         DEFINE INDEX IF NOT EXISTS identity_email_unique ON TABLE {IDENTITY_TABLE} FIELDS email UNIQUE;"
    );
    for collection in outbox_collections {
        validate_table_name(collection)?;
        statements.push_str(&outbox_schema(collection));
    }
    client
        .query(statements)
        .await
        .map_err(map_surreal_error)?
        .check()
        .map_err(map_surreal_error)?;
    Ok(())
}

/// Mail rows arrive as whole documents through `CONTENT`, so the timestamp
/// fields are coerced to datetimes at the field level. Rows other producers
/// wrote with string timestamps are converted on their next write.
fn outbox_schema(collection: &str) -> String {
    format!(
        " DEFINE INDEX IF NOT EXISTS {collection}_mail_id_unique ON TABLE {collection} \
         FIELDS mail_id UNIQUE; \
         DEFINE FIELD IF NOT EXISTS created_at ON TABLE {collection} \
         VALUE IF $value = NONE {{ NONE }} ELSE {{ <datetime>$value }}; \
         DEFINE FIELD IF NOT EXISTS migrated_at ON TABLE {collection} \
         VALUE IF $value = NONE {{ NONE }} ELSE {{ <datetime>$value }};"
    )
}

#[derive(Debug, Serialize, Deserialize)]
struct SurrealMemberRow {
    member_id: String,
    email: String,
    given_name: String,
    family_name: String,
    given_name_reading: Option<String>,
    family_name_reading: Option<String>,
    role: String,
    status: String,
    email_verified: bool,
    temporary_credential: Option<String>,
    invitation_resend_count: u32,
    invitation_resent_at: Option<String>,
    password_changed_at: Option<String>,
    #[serde(default)]
    belong_to: Vec<String>,
    invited_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SurrealMemberRow {
    fn from_record(member: &MemberRecord) -> DomainResult<Self> {
        Ok(Self {
            member_id: member.member_id.clone(),
            email: member.email.clone(),
            given_name: member.given_name.clone(),
            family_name: member.family_name.clone(),
            given_name_reading: member.given_name_reading.clone(),
            family_name_reading: member.family_name_reading.clone(),
            role: member.role.as_str().to_string(),
            status: member.status.as_str().to_string(),
            email_verified: member.email_verified,
            temporary_credential: member.temporary_credential.clone(),
            invitation_resend_count: member.invitation_resend_count,
            invitation_resent_at: member.invitation_resent_at_ms.map(to_rfc3339).transpose()?,
            password_changed_at: member.password_changed_at_ms.map(to_rfc3339).transpose()?,
            belong_to: member.belong_to.clone(),
            invited_by: member.invited_by.clone(),
            created_at: to_rfc3339(member.created_at_ms)?,
            updated_at: to_rfc3339(member.updated_at_ms)?,
        })
    }

    fn into_record(self) -> DomainResult<MemberRecord> {
        Ok(MemberRecord {
            role: Role::parse(&self.role)
                .ok_or_else(|| DomainError::Validation(format!("invalid role '{}'", self.role)))?,
            status: MemberStatus::parse(&self.status).ok_or_else(|| {
                DomainError::Validation(format!("invalid member status '{}'", self.status))
            })?,
            invitation_resent_at_ms: self
                .invitation_resent_at
                .as_deref()
                .map(parse_rfc3339)
                .transpose()?,
            password_changed_at_ms: self
                .password_changed_at
                .as_deref()
                .map(parse_rfc3339)
                .transpose()?,
            created_at_ms: parse_rfc3339(&self.created_at)?,
            updated_at_ms: parse_rfc3339(&self.updated_at)?,
            member_id: self.member_id,
            email: self.email,
            given_name: self.given_name,
            family_name: self.family_name,
            given_name_reading: self.given_name_reading,
            family_name_reading: self.family_name_reading,
            email_verified: self.email_verified,
            temporary_credential: self.temporary_credential,
            invitation_resend_count: self.invitation_resend_count,
            belong_to: self.belong_to,
            invited_by: self.invited_by,
        })
    }
}

pub struct SurrealMemberRepository {
    client: Arc<Surreal<Client>>,
}

impl SurrealMemberRepository {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    async fn select_where(
        client: &Surreal<Client>,
        clause: &str,
        key: &'static str,
        value: String,
    ) -> DomainResult<Vec<MemberRecord>> {
        let mut response = client
            .query(format!(
                "SELECT {MEMBER_FIELDS} FROM {MEMBER_TABLE} WHERE {clause} \
                 ORDER BY created_order ASC"
            ))
            .bind((key, value))
            .await
            .map_err(map_surreal_error)?;
        let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
        decode_rows(rows, "member", SurrealMemberRow::into_record)
    }

    async fn write(
        client: &Surreal<Client>,
        statement: &str,
        filter: &str,
        row: SurrealMemberRow,
    ) -> DomainResult<()> {
        let query = format!(
            "{statement} SET \
                member_id = $member_id, email = $email, given_name = $given_name, \
                family_name = $family_name, given_name_reading = $given_name_reading, \
                family_name_reading = $family_name_reading, role = $role, status = $status, \
                email_verified = $email_verified, temporary_credential = $temporary_credential, \
                invitation_resend_count = $invitation_resend_count, \
                invitation_resent_at = IF $invitation_resent_at = NONE {{ NONE }} ELSE {{ <datetime>$invitation_resent_at }}, \
                password_changed_at = IF $password_changed_at = NONE {{ NONE }} ELSE {{ <datetime>$password_changed_at }}, \
                belong_to = $belong_to, invited_by = $invited_by, \
                created_at = <datetime>$created_at, updated_at = <datetime>$updated_at \
             {filter} RETURN NONE;"
        );
        client
            .query(query)
            .bind(("member_id", row.member_id))
            .bind(("email", row.email))
            .bind(("given_name", row.given_name))
            .bind(("family_name", row.family_name))
            .bind(("given_name_reading", row.given_name_reading))
            .bind(("family_name_reading", row.family_name_reading))
            .bind(("role", row.role))
            .bind(("status", row.status))
            .bind(("email_verified", row.email_verified))
            .bind(("temporary_credential", row.temporary_credential))
            .bind(("invitation_resend_count", row.invitation_resend_count as i64))
            .bind(("invitation_resent_at", row.invitation_resent_at))
            .bind(("password_changed_at", row.password_changed_at))
            .bind(("belong_to", row.belong_to))
            .bind(("invited_by", row.invited_by))
            .bind(("created_at", row.created_at))
            .bind(("updated_at", row.updated_at))
            .await
            .map_err(map_surreal_error)?
            .check()
            .map_err(map_surreal_error)?;
        Ok(())
    }
}

impl MemberRepository for SurrealMemberRepository {
    fn create(&self, member: &MemberRecord) -> BoxFuture<'_, DomainResult<MemberRecord>> {
        let row = match SurrealMemberRow::from_record(member) {
            Ok(row) => row,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        let member = member.clone();
        let client = self.client.clone();
        Box::pin(async move {
            Self::write(&client, &format!("CREATE {MEMBER_TABLE}"), "", row).await?;
            Ok(member)
        })
    }

    fn get(&self, member_id: &str) -> BoxFuture<'_, DomainResult<Option<MemberRecord>>> {
        let member_id = member_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut members =
                Self::select_where(&client, "member_id = $member_id", "member_id", member_id)
                    .await?;
            Ok(members.pop())
        })
    }

    fn find_by_email(&self, email: &str) -> BoxFuture<'_, DomainResult<Option<MemberRecord>>> {
        let email = email.to_ascii_lowercase();
        let client = self.client.clone();
        Box::pin(async move {
            let mut members = Self::select_where(&client, "email = $email", "email", email).await?;
            Ok(members.pop())
        })
    }

    fn list_by_company(&self, company_id: &str) -> BoxFuture<'_, DomainResult<Vec<MemberRecord>>> {
        let company_id = company_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            Self::select_where(
                &client,
                "belong_to CONTAINS $company_id",
                "company_id",
                company_id,
            )
            .await
        })
    }

    fn update(&self, member: &MemberRecord) -> BoxFuture<'_, DomainResult<MemberRecord>> {
        let row = match SurrealMemberRow::from_record(member) {
            Ok(row) => row,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        let member = member.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let existing = Self::select_where(
                &client,
                "member_id = $member_id",
                "member_id",
                member.member_id.clone(),
            )
            .await?;
            if existing.is_empty() {
                return Err(DomainError::NotFound);
            }
            Self::write(
                &client,
                &format!("UPDATE {MEMBER_TABLE}"),
                "WHERE member_id = $member_id",
                row,
            )
            .await?;
            Ok(member)
        })
    }

    fn delete(&self, member_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let member_id = member_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "DELETE {MEMBER_TABLE} WHERE member_id = $member_id RETURN BEFORE"
                ))
                .bind(("member_id", member_id))
                .await
                .map_err(map_surreal_error)?;
            if response.take::<Vec<Value>>(0).map_err(invalid_result)?.is_empty() {
                return Err(DomainError::NotFound);
            }
            Ok(())
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SurrealMailRow {
    mail_id: String,
    #[serde(default)]
    recipients: Vec<String>,
    #[serde(default)]
    cc: Option<Vec<String>>,
    #[serde(default)]
    bcc: Option<Vec<String>>,
    reply_to: Option<String>,
    sender: Option<String>,
    #[serde(default)]
    message: Option<MailMessage>,
    attachments: Option<Vec<MailAttachment>>,
    template: Option<TemplateMetadata>,
    #[serde(default)]
    delivery: Option<DeliveryState>,
    created_at: String,
    migrated_at: Option<String>,
    original_id: Option<String>,
}

impl SurrealMailRow {
    fn from_document(document: &MailDocument) -> DomainResult<Self> {
        Ok(Self {
            mail_id: document.mail_id.clone(),
            recipients: document.to.clone(),
            cc: Some(document.cc.clone()),
            bcc: Some(document.bcc.clone()),
            reply_to: document.reply_to.clone(),
            sender: document.from.clone(),
            message: Some(document.message.clone()),
            attachments: document.attachments.clone(),
            template: document.template.clone(),
            delivery: Some(document.delivery.clone()),
            created_at: to_rfc3339(document.created_at_ms)?,
            migrated_at: document.migrated_at_ms.map(to_rfc3339).transpose()?,
            original_id: document.original_id.clone(),
        })
    }

    fn into_document(self) -> DomainResult<MailDocument> {
        Ok(MailDocument {
            created_at_ms: parse_rfc3339(&self.created_at)?,
            migrated_at_ms: self.migrated_at.as_deref().map(parse_rfc3339).transpose()?,
            mail_id: self.mail_id,
            to: self.recipients,
            cc: self.cc.unwrap_or_default(),
            bcc: self.bcc.unwrap_or_default(),
            reply_to: self.reply_to,
            from: self.sender,
            message: self.message.unwrap_or_default(),
            attachments: self.attachments,
            template: self.template,
            delivery: self.delivery.unwrap_or_default(),
            original_id: self.original_id,
        })
    }

    fn to_value(&self) -> DomainResult<Value> {
        serde_json::to_value(self)
            .map_err(|err| DomainError::Validation(format!("failed to encode mail row: {err}")))
    }
}

/// One outbox collection stored as a SurrealDB table. Timestamps are stored
/// as datetimes (see `outbox_schema`) and read back as RFC 3339 strings, so
/// documents written by other producers decode the same way.
pub struct SurrealMailOutboxRepository {
    client: Arc<Surreal<Client>>,
    table: String,
}

impl SurrealMailOutboxRepository {
    pub fn with_client(
        client: Arc<Surreal<Client>>,
        table: impl Into<String>,
    ) -> DomainResult<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { client, table })
    }

    async fn fetch(
        client: &Surreal<Client>,
        table: &str,
        mail_id: String,
    ) -> DomainResult<Option<MailDocument>> {
        let mut response = client
            .query(format!(
                "SELECT {MAIL_FIELDS} FROM {table} WHERE mail_id = $mail_id LIMIT 1"
            ))
            .bind(("mail_id", mail_id))
            .await
            .map_err(map_surreal_error)?;
        let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
        let mut documents = decode_rows(rows, "mail", SurrealMailRow::into_document)?;
        Ok(documents.pop())
    }

    fn ensure_batch_size(len: usize) -> DomainResult<()> {
        if len > MAX_ATOMIC_WRITES {
            return Err(DomainError::Validation(format!(
                "batch of {len} exceeds the {MAX_ATOMIC_WRITES} write limit"
            )));
        }
        Ok(())
    }
}

impl MailOutboxRepository for SurrealMailOutboxRepository {
    fn collection(&self) -> &str {
        &self.table
    }

    fn create(&self, document: &MailDocument) -> BoxFuture<'_, DomainResult<MailDocument>> {
        let row = match SurrealMailRow::from_document(document).and_then(|row| row.to_value()) {
            Ok(row) => row,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        let document = document.clone();
        let client = self.client.clone();
        let table = self.table.clone();
        Box::pin(async move {
            client
                .query(format!("CREATE {table} CONTENT $row RETURN NONE"))
                .bind(("row", row))
                .await
                .map_err(map_surreal_error)?
                .check()
                .map_err(map_surreal_error)?;
            Ok(document)
        })
    }

    fn get(&self, mail_id: &str) -> BoxFuture<'_, DomainResult<Option<MailDocument>>> {
        let mail_id = mail_id.to_string();
        let client = self.client.clone();
        let table = self.table.clone();
        Box::pin(async move { Self::fetch(&client, &table, mail_id).await })
    }

    fn list(&self, query: &MailListQuery) -> BoxFuture<'_, DomainResult<Vec<MailDocument>>> {
        let query = query.clone();
        let client = self.client.clone();
        let table = self.table.clone();
        Box::pin(async move {
            let mut conditions = Vec::new();
            if let Some(state) = query.state {
                if state == DeliveryStateKind::Unset {
                    conditions.push(UNSET_CONDITION.to_string());
                } else {
                    conditions.push("delivery.state = $state".to_string());
                }
            }
            if query.missing_attachments {
                conditions.push("(attachments = NONE OR attachments = NULL)".to_string());
            }
            let mut statement = format!("SELECT {MAIL_FIELDS} FROM {table}");
            if !conditions.is_empty() {
                statement.push_str(" WHERE ");
                statement.push_str(&conditions.join(" AND "));
            }
            statement.push_str(" ORDER BY created_order ASC, mail_id ASC");
            if query.limit > 0 {
                statement.push_str(&format!(" LIMIT {}", query.limit));
            }
            let state = query
                .state
                .map(|state| state.as_str().to_ascii_uppercase())
                .unwrap_or_default();
            let mut response = client
                .query(statement)
                .bind(("state", state))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            decode_rows(rows, "mail", SurrealMailRow::into_document)
        })
    }

    fn count(&self) -> BoxFuture<'_, DomainResult<u64>> {
        let client = self.client.clone();
        let table = self.table.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!("SELECT count() AS total FROM {table} GROUP ALL"))
                .await
                .map_err(map_surreal_error)?;
            let rows = response.take::<Vec<Value>>(0).map_err(invalid_result)?;
            Ok(rows
                .first()
                .and_then(|row| row.get("total"))
                .and_then(Value::as_u64)
                .unwrap_or_default())
        })
    }

    fn transition(
        &self,
        mail_id: &str,
        next: &DeliveryState,
    ) -> BoxFuture<'_, DomainResult<DeliveryTransition>> {
        let mail_id = mail_id.to_string();
        let next = next.clone();
        let client = self.client.clone();
        let table = self.table.clone();
        Box::pin(async move {
            if next == DeliveryState::Unset {
                return Err(DomainError::Validation(
                    "delivery state cannot return to unset".into(),
                ));
            }
            let delivery = serde_json::to_value(&next).map_err(|err| {
                DomainError::Validation(format!("failed to encode delivery state: {err}"))
            })?;
            let mut response = client
                .query(format!(
                    "UPDATE {table} SET delivery = $delivery \
                     WHERE mail_id = $mail_id AND {NOT_TERMINAL} RETURN mail_id"
                ))
                .bind(("delivery", delivery))
                .bind(("mail_id", mail_id.clone()))
                .await
                .map_err(map_surreal_error)?;
            let updated = !response.take::<Vec<Value>>(0).map_err(invalid_result)?.is_empty();

            let document = Self::fetch(&client, &table, mail_id)
                .await?
                .ok_or(DomainError::NotFound)?;
            if updated {
                return Ok(DeliveryTransition::Applied(document));
            }
            if document.delivery.is_terminal() {
                return Ok(DeliveryTransition::AlreadyTerminal(document));
            }
            Err(DomainError::Validation(format!(
                "delivery state cannot move from {} to {}",
                document.delivery.kind().as_str(),
                next.kind().as_str()
            )))
        })
    }

    fn set_empty_attachments(&self, mail_id: &str) -> BoxFuture<'_, DomainResult<bool>> {
        let mail_id = mail_id.to_string();
        let client = self.client.clone();
        let table = self.table.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "UPDATE {table} SET attachments = [] \
                     WHERE mail_id = $mail_id AND (attachments = NONE OR attachments = NULL) \
                     RETURN mail_id"
                ))
                .bind(("mail_id", mail_id.clone()))
                .await
                .map_err(map_surreal_error)?;
            if !response.take::<Vec<Value>>(0).map_err(invalid_result)?.is_empty() {
                return Ok(true);
            }
            match Self::fetch(&client, &table, mail_id).await? {
                Some(_) => Ok(false),
                None => Err(DomainError::NotFound),
            }
        })
    }

    fn write_batch(&self, documents: &[MailDocument]) -> BoxFuture<'_, DomainResult<usize>> {
        let rows = Self::ensure_batch_size(documents.len()).and_then(|_| {
            documents
                .iter()
                .map(|document| SurrealMailRow::from_document(document)?.to_value())
                .collect::<DomainResult<Vec<_>>>()
        });
        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        let written = rows.len();
        let client = self.client.clone();
        let table = self.table.clone();
        Box::pin(async move {
            client
                .query(format!(
                    "BEGIN TRANSACTION; \
                     FOR $row IN $rows {{ \
                        DELETE {table} WHERE mail_id = $row.mail_id; \
                        CREATE {table} CONTENT $row RETURN NONE; \
                     }}; \
                     COMMIT TRANSACTION;"
                ))
                .bind(("rows", rows))
                .await
                .map_err(map_surreal_error)?
                .check()
                .map_err(map_surreal_error)?;
            Ok(written)
        })
    }

    fn delete_batch(&self, mail_ids: &[String]) -> BoxFuture<'_, DomainResult<usize>> {
        if let Err(err) = Self::ensure_batch_size(mail_ids.len()) {
            return Box::pin(async move { Err(err) });
        }
        let mail_ids = mail_ids.to_vec();
        let client = self.client.clone();
        let table = self.table.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "BEGIN TRANSACTION; \
                     DELETE {table} WHERE mail_id IN $mail_ids RETURN BEFORE; \
                     COMMIT TRANSACTION;"
                ))
                .bind(("mail_ids", mail_ids))
                .await
                .map_err(map_surreal_error)?;
            Ok(response.take::<Vec<Value>>(0).map_err(invalid_result)?.len())
        })
    }
}

impl OutboxChangeFeed for SurrealMailOutboxRepository {
    fn subscribe(&self) -> BoxFuture<'_, DomainResult<UnboundedReceiver<OutboxChange>>> {
        let client = self.client.clone();
        let table = self.table.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!("LIVE SELECT mail_id, attachments, delivery FROM {table}"))
                .await
                .map_err(map_surreal_error)?;
            let mut stream = response
                .stream::<Notification<Value>>(0)
                .map_err(map_surreal_error)?;
            let (sender, receiver) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    let notification = match item {
                        Ok(notification) => notification,
                        Err(err) => {
                            tracing::warn!(
                                table = %table,
                                error = %err,
                                "live query notification failed"
                            );
                            continue;
                        }
                    };
                    let Some(change) = change_from_live(notification.action, &notification.data)
                    else {
                        continue;
                    };
                    if sender.send(change).is_err() {
                        break;
                    }
                }
                tracing::info!(table = %table, "live query stream ended");
            });
            Ok(receiver)
        })
    }
}

/// Creations always count. Updates count only while the document is still
/// unset and carries an attachments list, which is what a repair write
/// looks like; the worker's own state writes are filtered out.
fn change_from_live(action: Action, data: &Value) -> Option<OutboxChange> {
    let mail_id = data.get("mail_id")?.as_str()?.to_string();
    match action {
        Action::Create => Some(OutboxChange {
            mail_id,
            kind: OutboxChangeKind::Created,
        }),
        Action::Update => {
            let unset = data
                .get("delivery")
                .and_then(|delivery| delivery.get("state"))
                .and_then(Value::as_str)
                .is_none_or(|state| state == "UNSET");
            let has_attachments = data.get("attachments").is_some_and(Value::is_array);
            (unset && has_attachments).then_some(OutboxChange {
                mail_id,
                kind: OutboxChangeKind::AttachmentsWritten,
            })
        }
        _ => None,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SurrealNotificationRow {
    notification_id: String,
    member_id: String,
    notification_type: String,
    title: String,
    body: String,
    is_read: bool,
    read_at: Option<String>,
    created_at: String,
    correlation_id: Option<String>,
    #[serde(default)]
    processed: bool,
    processed_at: Option<String>,
}

impl SurrealNotificationRow {
    fn into_record(self) -> DomainResult<NotificationRecord> {
        Ok(NotificationRecord {
            notification_type: NotificationType::parse(&self.notification_type).ok_or_else(
                || {
                    DomainError::Validation(format!(
                        "invalid notification type '{}'",
                        self.notification_type
                    ))
                },
            )?,
            read_at_ms: self.read_at.as_deref().map(parse_rfc3339).transpose()?,
            created_at_ms: parse_rfc3339(&self.created_at)?,
            processed_at_ms: self.processed_at.as_deref().map(parse_rfc3339).transpose()?,
            notification_id: self.notification_id,
            member_id: self.member_id,
            title: self.title,
            body: self.body,
            is_read: self.is_read,
            correlation_id: self.correlation_id,
            processed: self.processed,
        })
    }
}

pub struct SurrealNotificationRepository {
    client: Arc<Surreal<Client>>,
}

impl SurrealNotificationRepository {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    async fn select(
        client: &Surreal<Client>,
        clause: &str,
        binds: Vec<(&'static str, Value)>,
    ) -> DomainResult<Vec<NotificationRecord>> {
        let mut pending = client.query(format!(
            "SELECT {NOTIFICATION_FIELDS} FROM {NOTIFICATION_TABLE} {clause}"
        ));
        for bind in binds {
            pending = pending.bind(bind);
        }
        let mut response = pending.await.map_err(map_surreal_error)?;
        decode_rows(
            response.take::<Vec<Value>>(0).map_err(invalid_result)?,
            "notification",
            SurrealNotificationRow::into_record,
        )
    }

    async fn update_returning(
        client: &Surreal<Client>,
        set: &str,
        notification_id: String,
        at: String,
    ) -> DomainResult<NotificationRecord> {
        client
            .query(format!(
                "UPDATE {NOTIFICATION_TABLE} SET {set} WHERE notification_id = $notification_id RETURN NONE"
            ))
            .bind(("notification_id", notification_id.clone()))
            .bind(("at", at))
            .await
            .map_err(map_surreal_error)?
            .check()
            .map_err(map_surreal_error)?;
        let mut records = Self::select(
            client,
            "WHERE notification_id = $notification_id LIMIT 1",
            vec![("notification_id", Value::String(notification_id))],
        )
        .await?;
        records.pop().ok_or(DomainError::NotFound)
    }
}

impl NotificationRepository for SurrealNotificationRepository {
    fn create(
        &self,
        notification: &NotificationRecord,
    ) -> BoxFuture<'_, DomainResult<NotificationRecord>> {
        let notification = notification.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let created_at = to_rfc3339(notification.created_at_ms)?;
            let read_at = notification.read_at_ms.map(to_rfc3339).transpose()?;
            let processed_at = notification.processed_at_ms.map(to_rfc3339).transpose()?;
            client
                .query(format!(
                    "CREATE {NOTIFICATION_TABLE} SET \
                        notification_id = $notification_id, member_id = $member_id, \
                        notification_type = $notification_type, title = $title, body = $body, \
                        is_read = $is_read, \
                        read_at = IF $read_at = NONE {{ NONE }} ELSE {{ <datetime>$read_at }}, \
                        created_at = <datetime>$created_at, correlation_id = $correlation_id, \
                        processed = $processed, \
                        processed_at = IF $processed_at = NONE {{ NONE }} ELSE {{ <datetime>$processed_at }} \
                     RETURN NONE;"
                ))
                .bind(("notification_id", notification.notification_id.clone()))
                .bind(("member_id", notification.member_id.clone()))
                .bind((
                    "notification_type",
                    notification.notification_type.as_str().to_string(),
                ))
                .bind(("title", notification.title.clone()))
                .bind(("body", notification.body.clone()))
                .bind(("is_read", notification.is_read))
                .bind(("read_at", read_at))
                .bind(("created_at", created_at))
                .bind(("correlation_id", notification.correlation_id.clone()))
                .bind(("processed", notification.processed))
                .bind(("processed_at", processed_at))
                .await
                .map_err(map_surreal_error)?
                .check()
                .map_err(map_surreal_error)?;
            Ok(notification)
        })
    }

    fn get(
        &self,
        notification_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<NotificationRecord>>> {
        let notification_id = notification_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut records = Self::select(
                &client,
                "WHERE notification_id = $notification_id LIMIT 1",
                vec![("notification_id", Value::String(notification_id))],
            )
            .await?;
            Ok(records.pop())
        })
    }

    fn find_unprocessed(
        &self,
        member_id: &str,
        notification_type: NotificationType,
    ) -> BoxFuture<'_, DomainResult<Option<NotificationRecord>>> {
        let member_id = member_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut records = Self::select(
                &client,
                "WHERE member_id = $member_id AND notification_type = $notification_type \
                 AND processed = false ORDER BY created_order ASC LIMIT 1",
                vec![
                    ("member_id", Value::String(member_id)),
                    (
                        "notification_type",
                        Value::String(notification_type.as_str().to_string()),
                    ),
                ],
            )
            .await?;
            Ok(records.pop())
        })
    }

    fn list_unprocessed(
        &self,
        notification_type: NotificationType,
        limit: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<NotificationRecord>>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut clause = "WHERE notification_type = $notification_type AND processed = false \
                              ORDER BY created_order ASC"
                .to_string();
            if limit > 0 {
                clause.push_str(&format!(" LIMIT {limit}"));
            }
            Self::select(
                &client,
                &clause,
                vec![(
                    "notification_type",
                    Value::String(notification_type.as_str().to_string()),
                )],
            )
            .await
        })
    }

    fn list(
        &self,
        query: &NotificationListQuery,
    ) -> BoxFuture<'_, DomainResult<Vec<NotificationRecord>>> {
        let query = query.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let mut clause = "WHERE member_id = $member_id".to_string();
            if !query.include_read {
                clause.push_str(" AND is_read = false");
            }
            clause.push_str(" ORDER BY created_order DESC, notification_id DESC");
            if query.limit > 0 {
                clause.push_str(&format!(" LIMIT {}", query.limit));
            }
            Self::select(
                &client,
                &clause,
                vec![("member_id", Value::String(query.member_id))],
            )
            .await
        })
    }

    fn mark_read(
        &self,
        notification_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<NotificationRecord>> {
        let notification_id = notification_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            Self::update_returning(
                &client,
                "read_at = IF is_read = true { read_at } ELSE { <datetime>$at }, is_read = true",
                notification_id,
                to_rfc3339(read_at_ms)?,
            )
            .await
        })
    }

    fn mark_all_read(
        &self,
        member_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>> {
        let member_id = member_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "UPDATE {NOTIFICATION_TABLE} SET is_read = true, read_at = <datetime>$at \
                     WHERE member_id = $member_id AND is_read = false RETURN notification_id"
                ))
                .bind(("member_id", member_id))
                .bind(("at", to_rfc3339(read_at_ms)?))
                .await
                .map_err(map_surreal_error)?;
            Ok(response.take::<Vec<Value>>(0).map_err(invalid_result)?.len())
        })
    }

    fn mark_processed(
        &self,
        notification_id: &str,
        processed_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<NotificationRecord>> {
        let notification_id = notification_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            Self::update_returning(
                &client,
                "processed_at = IF processed = true { processed_at } ELSE { <datetime>$at }, processed = true",
                notification_id,
                to_rfc3339(processed_at_ms)?,
            )
            .await
        })
    }

    fn unread_count(&self, member_id: &str) -> BoxFuture<'_, DomainResult<usize>> {
        let member_id = member_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "SELECT count() AS total FROM {NOTIFICATION_TABLE} \
                     WHERE member_id = $member_id AND is_read = false GROUP ALL"
                ))
                .bind(("member_id", member_id))
                .await
                .map_err(map_surreal_error)?;
            let rows = response.take::<Vec<Value>>(0).map_err(invalid_result)?;
            Ok(rows
                .first()
                .and_then(|row| row.get("total"))
                .and_then(Value::as_u64)
                .unwrap_or_default() as usize)
        })
    }
}

/// Identity records kept next to the member table. Credentials are stored
/// only as SHA-256 digests over a random per-credential salt.
///
/// This is a stand-in for the hosted identity service: a plain salted
/// SHA-256 is too fast to protect real passwords, so keep it to development
/// and test deployments.
pub struct SurrealIdentityProvider {
    client: Arc<Surreal<Client>>,
}

impl SurrealIdentityProvider {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    /// Fresh salt and the digest of `credential` under it.
    fn digest(credential: &str) -> (String, String) {
        let salt = hex::encode(rand::random::<[u8; 16]>());
        let digest = Self::salted_digest(&salt, credential);
        (salt, digest)
    }

    fn salted_digest(salt: &str, credential: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(credential.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn map_error(err: surrealdb::Error) -> IdentityError {
        match map_surreal_error(err) {
            DomainError::Conflict => IdentityError::EmailAlreadyInUse,
            other => IdentityError::Unavailable(other.to_string()),
        }
    }

    async fn update(
        client: &Surreal<Client>,
        set: &str,
        identity_id: String,
        credential: Option<(String, String)>,
    ) -> Result<(), IdentityError> {
        let (credential_salt, credential_sha256) = credential.unzip();
        let mut response = client
            .query(format!(
                "UPDATE {IDENTITY_TABLE} SET {set} WHERE identity_id = $identity_id RETURN identity_id"
            ))
            .bind(("identity_id", identity_id))
            .bind(("credential_salt", credential_salt))
            .bind(("credential_sha256", credential_sha256))
            .await
            .map_err(Self::map_error)?;
        let rows = response
            .take::<Vec<Value>>(0)
            .map_err(|err| IdentityError::Unavailable(invalid_result(err).to_string()))?;
        if rows.is_empty() {
            return Err(IdentityError::NotFound);
        }
        Ok(())
    }
}

impl IdentityProvider for SurrealIdentityProvider {
    fn create_identity(
        &self,
        email: &str,
        credential: &str,
    ) -> BoxFuture<'_, Result<String, IdentityError>> {
        let email = email.trim().to_ascii_lowercase();
        let (credential_salt, credential_sha256) = Self::digest(credential);
        let client = self.client.clone();
        Box::pin(async move {
            if !email.contains('@') {
                return Err(IdentityError::InvalidEmail);
            }
            let identity_id = uuid_v7_without_dashes();
            client
                .query(format!(
                    "CREATE {IDENTITY_TABLE} SET identity_id = $identity_id, email = $email, \
                        credential_salt = $credential_salt, \
                        credential_sha256 = $credential_sha256, signed_in = true, \
                        created_at = time::now() RETURN NONE;"
                ))
                .bind(("identity_id", identity_id.clone()))
                .bind(("email", email))
                .bind(("credential_salt", credential_salt))
                .bind(("credential_sha256", credential_sha256))
                .await
                .map_err(Self::map_error)?
                .check()
                .map_err(Self::map_error)?;
            Ok(identity_id)
        })
    }

    fn update_credential(
        &self,
        identity_id: &str,
        credential: &str,
    ) -> BoxFuture<'_, Result<(), IdentityError>> {
        let identity_id = identity_id.to_string();
        let digest = Self::digest(credential);
        let client = self.client.clone();
        Box::pin(async move {
            Self::update(
                &client,
                "credential_salt = $credential_salt, credential_sha256 = $credential_sha256",
                identity_id,
                Some(digest),
            )
            .await
        })
    }

    fn delete_identity(&self, identity_id: &str) -> BoxFuture<'_, Result<(), IdentityError>> {
        let identity_id = identity_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "DELETE {IDENTITY_TABLE} WHERE identity_id = $identity_id RETURN BEFORE"
                ))
                .bind(("identity_id", identity_id))
                .await
                .map_err(Self::map_error)?;
            let rows = response
                .take::<Vec<Value>>(0)
                .map_err(|err| IdentityError::Unavailable(invalid_result(err).to_string()))?;
            if rows.is_empty() {
                return Err(IdentityError::NotFound);
            }
            Ok(())
        })
    }

    fn sign_out(&self, identity_id: &str) -> BoxFuture<'_, Result<(), IdentityError>> {
        let identity_id = identity_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            Self::update(
                &client,
                "signed_in = false, signed_out_at = time::now()",
                identity_id,
                None,
            )
            .await
        })
    }
}
