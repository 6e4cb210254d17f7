use crm_domain::mail::MailAttachment;
use crm_domain::ports::BoxFuture;
use crm_domain::ports::relay::{MailRelay, RelayAccept, RelayMessage, RelayRejection};
use crm_domain::util::uuid_v7_without_dashes;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MessageBuilder, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::AppConfig;

pub const INVALID_ADDRESS: &str = "InvalidAddress";
pub const INVALID_MESSAGE: &str = "InvalidMessage";
pub const SMTP_PERMANENT: &str = "SmtpPermanent";
pub const SMTP_TRANSIENT: &str = "SmtpTransient";
pub const SMTP_CONNECTION: &str = "SmtpConnection";

#[derive(Clone, Debug)]
pub struct SmtpRelayConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub starttls: bool,
    pub default_from: String,
    /// Domain used for generated Message-ID headers.
    pub message_id_domain: String,
}

impl SmtpRelayConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let non_empty = |value: &str| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        };
        let message_id_domain = config
            .mail_from
            .rsplit_once('@')
            .map(|(_, domain)| domain.trim_end_matches('>').trim().to_string())
            .filter(|domain| !domain.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            username: non_empty(&config.smtp_username),
            password: non_empty(&config.smtp_password),
            starttls: config.smtp_starttls,
            default_from: config.mail_from.clone(),
            message_id_domain,
        }
    }
}

/// Hands messages to an SMTP server through lettre's async transport.
pub struct SmtpRelay {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    default_from: String,
    message_id_domain: String,
}

impl SmtpRelay {
    pub fn new(config: SmtpRelayConfig) -> anyhow::Result<Self> {
        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let mut builder = builder.port(config.port);
        if let Some(username) = config.username {
            let password = config.password.unwrap_or_default();
            builder = builder.credentials(Credentials::new(username, password));
        }
        tracing::info!(
            host = %config.host,
            port = config.port,
            starttls = config.starttls,
            "smtp relay configured"
        );
        Ok(Self {
            transport: builder.build(),
            default_from: config.default_from,
            message_id_domain: config.message_id_domain,
        })
    }

    fn build_message(
        &self,
        message: &RelayMessage,
        message_id: &str,
    ) -> Result<Message, RelayRejection> {
        let from = message.from.as_deref().unwrap_or(&self.default_from);
        let mut builder = Message::builder()
            .from(parse_mailbox(from)?)
            .subject(message.subject.clone())
            .message_id(Some(message_id.to_string()));
        builder = add_recipients(builder, &message.to, MessageBuilder::to)?;
        builder = add_recipients(builder, &message.cc, MessageBuilder::cc)?;
        builder = add_recipients(builder, &message.bcc, MessageBuilder::bcc)?;
        if let Some(reply_to) = message.reply_to.as_deref() {
            builder = builder.reply_to(parse_mailbox(reply_to)?);
        }

        let body = body_part(message);
        let built = if message.attachments.is_empty() {
            builder.multipart(body)
        } else {
            let mut mixed = MultiPart::mixed().multipart(body);
            for attachment in &message.attachments {
                mixed = mixed.singlepart(attachment_part(attachment)?);
            }
            builder.multipart(mixed)
        };
        built.map_err(|err| RelayRejection::new(INVALID_MESSAGE, err.to_string()))
    }
}

fn parse_mailbox(value: &str) -> Result<Mailbox, RelayRejection> {
    value
        .parse::<Mailbox>()
        .map_err(|err| RelayRejection::new(INVALID_ADDRESS, format!("{value}: {err}")))
}

fn add_recipients(
    mut builder: MessageBuilder,
    recipients: &[String],
    add: fn(MessageBuilder, Mailbox) -> MessageBuilder,
) -> Result<MessageBuilder, RelayRejection> {
    for recipient in recipients {
        builder = add(builder, parse_mailbox(recipient)?);
    }
    Ok(builder)
}

fn body_part(message: &RelayMessage) -> MultiPart {
    let text = message.text.clone().unwrap_or_default();
    match message.html.clone() {
        Some(html) => MultiPart::alternative_plain_html(text, html),
        None => MultiPart::alternative().singlepart(SinglePart::plain(text)),
    }
}

fn attachment_part(attachment: &MailAttachment) -> Result<SinglePart, RelayRejection> {
    let content_type = ContentType::parse(&attachment.content_type).map_err(|err| {
        RelayRejection::new(
            INVALID_MESSAGE,
            format!("attachment {}: {err}", attachment.filename),
        )
    })?;
    Ok(Attachment::new(attachment.filename.clone())
        .body(attachment.content.clone().into_bytes(), content_type))
}

fn rejection_from_smtp(err: lettre::transport::smtp::Error) -> RelayRejection {
    let code = if err.is_permanent() {
        SMTP_PERMANENT
    } else if err.is_transient() {
        SMTP_TRANSIENT
    } else {
        SMTP_CONNECTION
    };
    RelayRejection::new(code, err.to_string())
}

impl MailRelay for SmtpRelay {
    fn send(&self, message: &RelayMessage) -> BoxFuture<'_, Result<RelayAccept, RelayRejection>> {
        let message_id = format!("<{}@{}>", uuid_v7_without_dashes(), self.message_id_domain);
        let built = self.build_message(message, &message_id);
        Box::pin(async move {
            let email = built?;
            let response = self
                .transport
                .send(email)
                .await
                .map_err(rejection_from_smtp)?;
            let text = response.message().collect::<Vec<_>>().join(" ");
            Ok(RelayAccept {
                message_id,
                response: format!("{} {}", response.code(), text).trim().to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn relay() -> SmtpRelay {
        SmtpRelay::new(SmtpRelayConfig::from_app_config(&test_config())).expect("relay")
    }

    fn message() -> RelayMessage {
        RelayMessage {
            from: None,
            to: vec!["member@example.com".into()],
            cc: vec!["cc@example.com".into()],
            bcc: Vec::new(),
            reply_to: Some("support@example.com".into()),
            subject: "Welcome".into(),
            html: Some("<p>Hello</p>".into()),
            text: Some("Hello".into()),
            attachments: vec![MailAttachment {
                filename: "notes.txt".into(),
                content_type: "text/plain".into(),
                content: "notes".into(),
            }],
        }
    }

    #[test]
    fn config_derives_message_id_domain_from_sender() {
        let config = SmtpRelayConfig::from_app_config(&test_config());
        assert_eq!(config.message_id_domain, "example.com");
        assert!(config.username.is_none());
    }

    #[tokio::test]
    async fn builds_multipart_message_with_default_sender() {
        let relay = relay();
        let built = relay
            .build_message(&message(), "<id@example.com>")
            .expect("message");
        let formatted = String::from_utf8(built.formatted()).expect("utf8");
        assert!(formatted.contains("Subject: Welcome"));
        assert!(formatted.contains("noreply@example.com"));
        assert!(formatted.contains("notes.txt"));
    }

    #[tokio::test]
    async fn rejects_unparseable_recipient() {
        let relay = relay();
        let mut message = message();
        message.to = vec!["not an address".into()];
        let err = relay
            .build_message(&message, "<id@example.com>")
            .expect_err("invalid");
        assert_eq!(err.code, INVALID_ADDRESS);
    }
}
