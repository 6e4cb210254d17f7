//! Built-in mail templates. Parameters are plain strings; values are HTML
//! escaped before landing in the HTML body and missing parameters render
//! as empty text rather than failing the enqueue.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::mail::{MailMessage, TemplateMetadata};

pub type TemplateParams = BTreeMap<String, String>;

pub const PARAM_MEMBER_NAME: &str = "member_name";
pub const PARAM_TEMPORARY_PASSWORD: &str = "temporary_password";
pub const PARAM_ROLE: &str = "role";
pub const PARAM_LOGIN_URL: &str = "login_url";
pub const PARAM_COMPANY_NAME: &str = "company_name";
pub const PARAM_RESEND_COUNT: &str = "resend_count";
pub const PARAM_VERIFICATION_CODE: &str = "verification_code";
pub const PARAM_INVITED_BY: &str = "invited_by";
pub const PARAM_MEMBER_ID: &str = "member_id";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MailTemplate {
    Welcome,
    LoginVerification,
    MemberInvitation,
    MemberInvitationResend,
}

impl MailTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::LoginVerification => "login-verification",
            Self::MemberInvitation => "member-invitation",
            Self::MemberInvitationResend => "member-invitation-resend",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }

    pub fn render(&self, params: &TemplateParams) -> MailMessage {
        let get = |key: &str| params.get(key).map(String::as_str).unwrap_or_default();
        let name = get(PARAM_MEMBER_NAME);
        let company = get(PARAM_COMPANY_NAME);
        let login_url = get(PARAM_LOGIN_URL);
        let password = get(PARAM_TEMPORARY_PASSWORD);

        let (subject, lines) = match self {
            Self::Welcome => (
                format!("Welcome to {company}, {name}"),
                vec![
                    format!("Hello {name},"),
                    format!("Your {company} account is ready."),
                    format!("Temporary password: {password}"),
                    format!("Sign in at {login_url} and choose a new password."),
                ],
            ),
            Self::LoginVerification => (
                format!("{company} sign-in verification"),
                vec![
                    format!("Hello {name},"),
                    format!("Your verification code is {}.", get(PARAM_VERIFICATION_CODE)),
                    format!("Continue signing in at {login_url}."),
                ],
            ),
            Self::MemberInvitation => (
                format!("{name}, you have been invited to {company}"),
                vec![
                    format!("Hello {name},"),
                    format!("You have been invited to {company} as {}.", get(PARAM_ROLE)),
                    format!("Temporary password: {password}"),
                    format!("Sign in at {login_url} and change your password on first login."),
                ],
            ),
            Self::MemberInvitationResend => (
                format!("{name}, your invitation to {company} (resent)"),
                vec![
                    format!("Hello {name},"),
                    format!(
                        "Here is a fresh invitation to {company} as {}. Earlier temporary passwords no longer work.",
                        get(PARAM_ROLE)
                    ),
                    format!("Temporary password: {password}"),
                    format!("Sign in at {login_url} and change your password on first login."),
                    format!("Resend number {}.", get(PARAM_RESEND_COUNT)),
                ],
            ),
        };

        let html = lines
            .iter()
            .map(|line| format!("<p>{}</p>", escape_html(line)))
            .collect::<String>();
        MailMessage {
            subject: Some(subject),
            html: Some(html),
            text: Some(lines.join("\n")),
        }
    }

    /// Metadata stored next to the rendered message. Credentials are
    /// redacted so the outbox never keeps a second copy.
    pub fn metadata(&self, params: &TemplateParams) -> TemplateMetadata {
        let data = params
            .iter()
            .map(|(key, value)| {
                if key == PARAM_TEMPORARY_PASSWORD {
                    (key.clone(), "[redacted]".to_string())
                } else {
                    (key.clone(), value.clone())
                }
            })
            .collect();
        TemplateMetadata {
            name: self.as_str().to_string(),
            data,
        }
    }
}

impl FromStr for MailTemplate {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "welcome" => Ok(Self::Welcome),
            "login-verification" => Ok(Self::LoginVerification),
            "member-invitation" => Ok(Self::MemberInvitation),
            "member-invitation-resend" => Ok(Self::MemberInvitationResend),
            _ => Err("unknown mail template"),
        }
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params(pairs: &[(&str, &str)]) -> TemplateParams {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn invitation_carries_credential_and_role() {
        let message = MailTemplate::MemberInvitation.render(&params(&[
            (PARAM_MEMBER_NAME, "Sato Hana"),
            (PARAM_TEMPORARY_PASSWORD, "Abcdefgh12"),
            (PARAM_ROLE, "admin"),
            (PARAM_COMPANY_NAME, "Narratives"),
        ]));
        assert_eq!(
            message.subject.as_deref(),
            Some("Sato Hana, you have been invited to Narratives")
        );
        let text = message.text.unwrap_or_default();
        assert!(text.contains("Abcdefgh12"));
        assert!(text.contains("as admin"));
    }

    #[test]
    fn html_body_escapes_parameters() {
        let message =
            MailTemplate::Welcome.render(&params(&[(PARAM_MEMBER_NAME, "<script>x</script>")]));
        let html = message.html.unwrap_or_default();
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn metadata_redacts_credential() {
        let metadata = MailTemplate::MemberInvitationResend
            .metadata(&params(&[(PARAM_TEMPORARY_PASSWORD, "Abcdefgh12")]));
        assert_eq!(metadata.name, "member-invitation-resend");
        assert_eq!(metadata.data[PARAM_TEMPORARY_PASSWORD], "[redacted]");
    }

    #[test]
    fn template_ids_round_trip_through_names() {
        for template in [
            MailTemplate::Welcome,
            MailTemplate::LoginVerification,
            MailTemplate::MemberInvitation,
            MailTemplate::MemberInvitationResend,
        ] {
            assert_eq!(MailTemplate::parse(template.as_str()), Some(template));
        }
    }

    proptest! {
        #[test]
        fn rendering_always_yields_subject_and_body(name in ".{0,40}", code in "[0-9]{0,8}") {
            let message = MailTemplate::LoginVerification.render(&params(&[
                (PARAM_MEMBER_NAME, name.as_str()),
                (PARAM_VERIFICATION_CODE, code.as_str()),
            ]));
            prop_assert!(message.subject.is_some());
            prop_assert!(message.html.is_some());
            prop_assert!(message.text.is_some());
        }
    }
}
