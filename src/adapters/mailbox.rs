//! IMAP mailbox adapter.
//!
//! The `imap` crate is blocking, so every session runs inside
//! `spawn_blocking`. A fresh session per poll keeps the adapter stateless;
//! mail servers drop idle connections anyway at the intervals we poll at.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use mailparse::MailHeaderMap;

use super::{Mailbox, MailboxError};
use crate::core::fetcher::{AUDIO_EXTENSIONS, VIDEO_EXTENSIONS};

/// Ceiling on any single IMAP socket operation; a stalled mail server must
/// fail the poll, not freeze the ingestor
const IMAP_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Attachments above this size are skipped; large recordings arrive as links
const MAX_ATTACHMENT_BYTES: usize = 50 * 1024 * 1024;

/// A media file attached to an inbound message, already decoded
#[derive(Debug, Clone)]
pub struct AudioAttachment {
    pub filename: String,
    pub data: Vec<u8>,
}

/// One unread message pulled from the mailbox
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// RFC 822 Message-ID (falls back to the IMAP sequence number)
    pub message_id: String,

    /// IMAP sequence number, needed to flag the message later
    pub sequence: u32,

    /// Sender address
    pub from: String,

    /// Subject line, empty if absent
    pub subject: String,

    /// Concatenated text/plain parts
    pub text_body: String,

    /// Concatenated text/html parts
    pub html_body: String,

    /// Audio/video attachments small enough to ingest directly
    pub attachments: Vec<AudioAttachment>,
}

/// Connection settings for the monitored mailbox
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub folder: String,
}

/// IMAP implementation of the Mailbox trait
pub struct ImapMailbox {
    config: ImapConfig,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn unread(&self) -> Result<Vec<InboundMessage>, MailboxError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || fetch_unread(&config))
            .await
            .map_err(|e| MailboxError::Transient(format!("mailbox task panicked: {}", e)))?
    }

    async fn mark_processed(&self, sequence: u32) -> Result<(), MailboxError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || mark_seen(&config, sequence))
            .await
            .map_err(|e| MailboxError::Transient(format!("mailbox task panicked: {}", e)))?
    }
}

fn open_session(
    config: &ImapConfig,
    io_timeout: Duration,
) -> Result<imap::Session<native_tls::TlsStream<TcpStream>>, MailboxError> {
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| MailboxError::Transient(format!("cannot resolve {}: {}", config.host, e)))?
        .next()
        .ok_or_else(|| MailboxError::Transient(format!("no address for {}", config.host)))?;

    let tcp = TcpStream::connect_timeout(&addr, io_timeout)
        .map_err(|e| MailboxError::Transient(format!("IMAP connect failed: {}", e)))?;
    tcp.set_read_timeout(Some(io_timeout))
        .map_err(|e| MailboxError::Transient(format!("socket setup failed: {}", e)))?;
    tcp.set_write_timeout(Some(io_timeout))
        .map_err(|e| MailboxError::Transient(format!("socket setup failed: {}", e)))?;

    let tls = native_tls::TlsConnector::new()
        .map_err(|e| MailboxError::Transient(format!("TLS setup failed: {}", e)))?;
    let stream = tls
        .connect(config.host.as_str(), tcp)
        .map_err(|e| MailboxError::Transient(format!("TLS handshake failed: {}", e)))?;

    let mut client = imap::Client::new(stream);
    client
        .read_greeting()
        .map_err(|e| MailboxError::Transient(format!("IMAP greeting failed: {}", e)))?;

    client
        .login(&config.username, &config.password)
        .map_err(|(e, _)| MailboxError::AuthFailure(e.to_string()))
}

fn fetch_unread(config: &ImapConfig) -> Result<Vec<InboundMessage>, MailboxError> {
    let mut session = open_session(config, IMAP_IO_TIMEOUT)?;

    session
        .select(&config.folder)
        .map_err(|e| MailboxError::Transient(format!("select {} failed: {}", config.folder, e)))?;

    let unseen = session
        .search("UNSEEN")
        .map_err(|e| MailboxError::Transient(format!("search failed: {}", e)))?;

    let mut messages = Vec::new();

    for sequence in unseen {
        let fetches = session
            .fetch(sequence.to_string(), "RFC822")
            .map_err(|e| MailboxError::Transient(format!("fetch {} failed: {}", sequence, e)))?;

        for fetch in fetches.iter() {
            let Some(raw) = fetch.body() else { continue };
            match parse_message(sequence, raw) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    // A malformed message must not stop the poll
                    tracing::warn!(sequence, error = %e, "Skipping unparseable message");
                }
            }
        }
    }

    let _ = session.logout();
    Ok(messages)
}

fn mark_seen(config: &ImapConfig, sequence: u32) -> Result<(), MailboxError> {
    let mut session = open_session(config, IMAP_IO_TIMEOUT)?;

    session
        .select(&config.folder)
        .map_err(|e| MailboxError::Transient(format!("select {} failed: {}", config.folder, e)))?;

    session
        .store(sequence.to_string(), "+FLAGS (\\Seen)")
        .map_err(|e| MailboxError::Transient(format!("store failed: {}", e)))?;

    let _ = session.logout();
    Ok(())
}

fn parse_message(sequence: u32, raw: &[u8]) -> anyhow::Result<InboundMessage> {
    let parsed = mailparse::parse_mail(raw)?;
    let headers = parsed.get_headers();

    let message_id = headers
        .get_first_value("Message-ID")
        .unwrap_or_else(|| format!("seq-{}", sequence));
    let from = headers.get_first_value("From").unwrap_or_default();
    let subject = headers.get_first_value("Subject").unwrap_or_default();

    let mut text_body = String::new();
    let mut html_body = String::new();
    let mut attachments = Vec::new();
    collect_parts(&parsed, &mut text_body, &mut html_body, &mut attachments)?;

    Ok(InboundMessage {
        message_id,
        sequence,
        from,
        subject,
        text_body,
        html_body,
        attachments,
    })
}

fn collect_parts(
    part: &mailparse::ParsedMail<'_>,
    text: &mut String,
    html: &mut String,
    attachments: &mut Vec<AudioAttachment>,
) -> anyhow::Result<()> {
    if part.subparts.is_empty() {
        if let Some(filename) = part_filename(part) {
            if is_media_filename(&filename) {
                let data = part.get_body_raw()?;
                if data.len() <= MAX_ATTACHMENT_BYTES {
                    attachments.push(AudioAttachment { filename, data });
                } else {
                    tracing::warn!(
                        filename = %filename,
                        bytes = data.len(),
                        "Skipping attachment over the size ceiling"
                    );
                }
                return Ok(());
            }
        }

        let mimetype = part.ctype.mimetype.to_ascii_lowercase();
        if mimetype == "text/plain" {
            text.push_str(&part.get_body()?);
            text.push('\n');
        } else if mimetype == "text/html" {
            html.push_str(&part.get_body()?);
            html.push('\n');
        }
        return Ok(());
    }

    for sub in &part.subparts {
        collect_parts(sub, text, html, attachments)?;
    }
    Ok(())
}

/// Filename from the Content-Disposition, falling back to the type's name
/// parameter
fn part_filename(part: &mailparse::ParsedMail<'_>) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

fn is_media_filename(name: &str) -> bool {
    match name.rsplit('.').next() {
        Some(ext) => {
            let ext = ext.to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&ext.as_str()) || VIDEO_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_message() {
        let raw = b"Message-ID: <abc@example.com>\r\n\
From: analyst@example.com\r\n\
Subject: Webinar replay\r\n\
Content-Type: text/plain\r\n\
\r\n\
Recording here: https://dropbox.com/s/x/call.mp3?dl=0\r\n";

        let message = parse_message(7, raw).unwrap();
        assert_eq!(message.message_id, "<abc@example.com>");
        assert_eq!(message.sequence, 7);
        assert!(message.text_body.contains("dropbox.com"));
        assert!(message.html_body.is_empty());
    }

    #[test]
    fn test_missing_message_id_falls_back_to_sequence() {
        let raw = b"From: a@b.c\r\nContent-Type: text/plain\r\n\r\nhello\r\n";
        let message = parse_message(3, raw).unwrap();
        assert_eq!(message.message_id, "seq-3");
    }

    #[test]
    fn test_audio_attachment_is_extracted() {
        let raw = b"Message-ID: <m@x>\r\n\
From: a@b.c\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
\r\n\
recording attached\r\n\
--b1\r\n\
Content-Type: audio/mpeg; name=\"call.mp3\"\r\n\
Content-Disposition: attachment; filename=\"call.mp3\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
ZmFrZSBhdWRpbw==\r\n\
--b1--\r\n";

        let message = parse_message(1, raw).unwrap();
        assert!(message.text_body.contains("recording attached"));
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].filename, "call.mp3");
        assert_eq!(message.attachments[0].data, b"fake audio");
    }

    #[test]
    fn test_non_media_attachment_is_ignored() {
        let raw = b"From: a@b.c\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
\r\n\
not media\r\n\
--b1--\r\n";

        let message = parse_message(2, raw).unwrap();
        assert!(message.attachments.is_empty());
    }

    #[test]
    fn test_silent_server_times_out_instead_of_hanging() {
        // Accepts the connection and never sends the IMAP greeting
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let _socket = listener.accept();
            std::thread::sleep(Duration::from_secs(10));
        });

        let config = ImapConfig {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            username: "analyst".to_string(),
            password: "secret".to_string(),
            folder: "INBOX".to_string(),
        };

        let started = std::time::Instant::now();
        let err = open_session(&config, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, MailboxError::Transient(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
