//! SMTP reply sender.
//!
//! Replies carry the analysis sections as an HTML body (with a plain-text
//! alternative) and the full transcript plus source metadata as a text
//! attachment, keeping the body focused.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox as LettreMailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{ReplySender, ServiceError};

/// Connection settings for the outbound relay
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    /// From address; usually the same as username
    pub sender: String,
}

/// A fully composed reply, transport-agnostic
#[derive(Debug, Clone)]
pub struct ReplyMessage {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub plain_body: String,
    /// `(filename, content)` text attachments
    pub attachments: Vec<(String, String)>,
}

/// lettre-backed implementation of ReplySender
pub struct SmtpReplySender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: String,
}

impl SmtpReplySender {
    pub fn new(config: SmtpConfig) -> Result<Self, ServiceError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| ServiceError::Fatal(format!("SMTP relay setup failed: {}", e)))?
            .credentials(Credentials::new(config.username, config.password))
            .build();

        Ok(Self {
            transport,
            sender: config.sender,
        })
    }
}

#[async_trait]
impl ReplySender for SmtpReplySender {
    async fn send(&self, reply: ReplyMessage) -> Result<(), ServiceError> {
        let message = build_message(&self.sender, &reply)
            .map_err(|e| ServiceError::Fatal(format!("failed to compose reply: {}", e)))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| ServiceError::Transient(format!("SMTP send failed: {}", e)))?;

        Ok(())
    }
}

fn build_message(sender: &str, reply: &ReplyMessage) -> anyhow::Result<Message> {
    let from: LettreMailbox = sender.parse()?;
    let to: LettreMailbox = reply.to.parse()?;

    let mut body = MultiPart::mixed().multipart(MultiPart::alternative_plain_html(
        reply.plain_body.clone(),
        reply.html_body.clone(),
    ));

    for (filename, content) in &reply.attachments {
        body = body.singlepart(
            Attachment::new(filename.clone())
                .body(content.clone(), ContentType::TEXT_PLAIN),
        );
    }

    Ok(Message::builder()
        .from(from)
        .to(to)
        .subject(&reply.subject)
        .multipart(body)?)
}
