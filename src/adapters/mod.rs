//! Adapter interfaces for external systems.
//!
//! The pipeline treats speech-to-text, language analysis, the mailbox and
//! the SMTP relay as fallible network collaborators behind trait seams, so
//! tests can substitute in-process fakes.

pub mod ffmpeg;
pub mod mailbox;
pub mod openai;
pub mod smtp;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub use mailbox::{AudioAttachment, ImapMailbox, InboundMessage};
pub use openai::{ChatClient, WhisperClient};
pub use smtp::{ReplyMessage, SmtpReplySender};

/// Error from an external service call.
///
/// Transient errors are eligible for retry under the shared RetryPolicy;
/// fatal errors surface immediately.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("transient service failure: {0}")]
    Transient(String),

    #[error("service failure: {0}")]
    Fatal(String),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a reqwest error: timeouts and connection problems are
    /// transient, everything else is fatal.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }

    /// Classify an HTTP status: 5xx and 429 are transient
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::Transient(format!("HTTP {}: {}", status, body))
        } else {
            Self::Fatal(format!("HTTP {}: {}", status, body))
        }
    }
}

/// Speech-to-text service
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe a single audio file to text
    async fn transcribe(&self, audio: &Path) -> Result<String, ServiceError>;
}

/// Language-analysis service (chat completion)
#[async_trait]
pub trait Analyst: Send + Sync {
    /// Run one prompt, return the raw completion text
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ServiceError>;
}

/// Errors from mailbox I/O
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("transient mailbox failure: {0}")]
    Transient(String),

    #[error("mailbox authentication failed: {0}")]
    AuthFailure(String),
}

/// Read side of the monitored mailbox
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// List unread messages
    async fn unread(&self) -> Result<Vec<InboundMessage>, MailboxError>;

    /// Mark a message as processed (seen) by its sequence number
    async fn mark_processed(&self, sequence: u32) -> Result<(), MailboxError>;
}

/// Outbound side: result replies to senders
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send(&self, reply: ReplyMessage) -> Result<(), ServiceError>;
}
