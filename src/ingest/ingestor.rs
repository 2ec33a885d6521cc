//! Mailbox polling and job submission.
//!
//! The ingestor polls the monitored mailbox, extracts media links from each
//! unread message, submits one job per previously-unseen link, and replies
//! to the sender when the job finishes. One bad message never stops a poll;
//! failures are isolated per message.

use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::{NamedTempFile, TempPath};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{AudioAttachment, InboundMessage, Mailbox, ReplyMessage, ReplySender};
use crate::core::manager::JobManager;
use crate::core::resolver::{unwrap_security_url, LinkResolver};
use crate::domain::{ContentLocator, JobOptions, JobSnapshot, JobState};
use crate::ingest::extract::{extract_links, is_media_candidate};
use crate::ingest::ledger::{attachment_fingerprint, link_fingerprint, IngestLedger, LedgerEntry};

/// A submitted job still owed a reply
#[derive(Debug, Clone)]
struct PendingReply {
    job: Uuid,
    to: String,
    source: String,
}

/// Counters from one poll cycle
#[derive(Debug, Default, Clone, Copy)]
pub struct PollOutcome {
    pub messages: usize,
    pub submitted: usize,
    pub replies_sent: usize,
}

/// Watches a mailbox and feeds the job manager
pub struct EmailIngestor {
    mailbox: Arc<dyn Mailbox>,
    replies: Arc<dyn ReplySender>,
    manager: Arc<JobManager>,
    resolver: LinkResolver,
    ledger: IngestLedger,
    seen: Mutex<HashSet<String>>,
    pending: Mutex<Vec<PendingReply>>,
    /// Attachment files spooled to disk, held until their jobs finish
    spooled: Mutex<Vec<(Uuid, TempPath)>>,
}

impl EmailIngestor {
    /// Build an ingestor, replaying the ledger into the skip-set
    pub async fn new(
        mailbox: Arc<dyn Mailbox>,
        replies: Arc<dyn ReplySender>,
        manager: Arc<JobManager>,
        ledger: IngestLedger,
    ) -> Result<Self> {
        let seen = ledger
            .replay()
            .await
            .context("Failed to replay ingestion ledger")?;
        info!(known_links = seen.len(), "Ingestion ledger replayed");

        Ok(Self {
            mailbox,
            replies,
            manager,
            resolver: LinkResolver::new(),
            ledger,
            seen: Mutex::new(seen),
            pending: Mutex::new(Vec::new()),
            spooled: Mutex::new(Vec::new()),
        })
    }

    /// Poll until the stop channel flips to true
    pub async fn run(&self, interval: Duration, mut stop: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Mailbox watcher started");

        loop {
            match self.poll_once().await {
                Ok(outcome) if outcome.messages > 0 || outcome.replies_sent > 0 => {
                    info!(
                        messages = outcome.messages,
                        submitted = outcome.submitted,
                        replies = outcome.replies_sent,
                        "Poll cycle finished"
                    );
                }
                Ok(_) => debug!("Poll cycle finished, nothing new"),
                Err(e) => error!(error = %e, "Poll cycle failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Mailbox watcher stopped");
    }

    /// One poll cycle: ingest unread messages, then flush finished replies
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let messages = self
            .mailbox
            .unread()
            .await
            .context("Failed to list unread messages")?;

        let mut outcome = PollOutcome {
            messages: messages.len(),
            ..Default::default()
        };

        for message in messages {
            match self.ingest_message(&message).await {
                Ok(submitted) => {
                    outcome.submitted += submitted;
                    if let Err(e) = self.mailbox.mark_processed(message.sequence).await {
                        warn!(
                            message_id = %message.message_id,
                            error = %e,
                            "Failed to mark message seen; it will be re-checked next poll"
                        );
                    }
                }
                Err(e) => {
                    // Leave unread so the next cycle retries it
                    error!(message_id = %message.message_id, error = %e, "Failed to ingest message");
                }
            }
        }

        outcome.replies_sent = self.flush_replies().await;
        self.sweep_spool();
        Ok(outcome)
    }

    /// Extract, dedupe and submit every media link and attachment in one
    /// message
    async fn ingest_message(&self, message: &InboundMessage) -> Result<usize> {
        let links = extract_links(&message.text_body, &message.html_body);
        if links.is_empty() && message.attachments.is_empty() {
            debug!(message_id = %message.message_id, "No links or attachments in message");
            return Ok(0);
        }

        let reply_to = reply_address(&message.from);
        let mut submitted = 0;

        for link in links {
            // Canonical form decides both the candidate filter and dedupe
            let canonical = match unwrap_security_url(&link) {
                Ok(canonical) => canonical,
                Err(e) => {
                    warn!(url = %link, error = %e, "Skipping link that failed to unwrap");
                    continue;
                }
            };

            if !is_media_candidate(&canonical) {
                continue;
            }

            let fingerprint = link_fingerprint(&canonical);
            {
                let seen = self.seen.lock().map_err(|_| poisoned())?;
                if seen.contains(&fingerprint) {
                    info!(url = %canonical, fingerprint = %fingerprint, "Link already processed, skipping");
                    continue;
                }
            }

            let locator = self
                .resolver
                .classify(&canonical)
                .with_context(|| format!("Failed to classify {}", canonical))?;

            let options = JobOptions {
                notify_email: reply_to.clone(),
                ..Default::default()
            };

            let source = locator.source_name();
            let job = self.manager.submit(locator, options);
            info!(job = %job, url = %canonical, "Submitted job from email");

            // Only record after the submit took; a crash in between re-submits,
            // which is the safe direction
            self.ledger
                .record(LedgerEntry {
                    message_id: message.message_id.clone(),
                    fingerprint: fingerprint.clone(),
                    processed_at: chrono::Utc::now(),
                })
                .await
                .context("Failed to record ledger entry")?;

            self.seen.lock().map_err(|_| poisoned())?.insert(fingerprint);

            if let Some(to) = &reply_to {
                self.pending.lock().map_err(|_| poisoned())?.push(PendingReply {
                    job,
                    to: to.clone(),
                    source,
                });
            }

            submitted += 1;
        }

        for attachment in &message.attachments {
            submitted += self
                .ingest_attachment(message, attachment, reply_to.as_deref())
                .await?;
        }

        Ok(submitted)
    }

    /// Spool one attached recording to disk and submit it as a local job.
    /// The spool file lives until the job reaches a terminal state.
    async fn ingest_attachment(
        &self,
        message: &InboundMessage,
        attachment: &AudioAttachment,
        reply_to: Option<&str>,
    ) -> Result<usize> {
        let fingerprint = attachment_fingerprint(&attachment.data);
        {
            let seen = self.seen.lock().map_err(|_| poisoned())?;
            if seen.contains(&fingerprint) {
                info!(
                    filename = %attachment.filename,
                    fingerprint = %fingerprint,
                    "Attachment already processed, skipping"
                );
                return Ok(0);
            }
        }

        let suffix = match attachment.filename.rsplit('.').next() {
            Some(ext) if !ext.is_empty() => format!(".{}", ext.to_ascii_lowercase()),
            _ => ".mp3".to_string(),
        };
        let mut file = NamedTempFile::with_suffix(suffix)
            .with_context(|| format!("Failed to spool attachment {}", attachment.filename))?;
        file.write_all(&attachment.data)
            .with_context(|| format!("Failed to spool attachment {}", attachment.filename))?;
        let spool = file.into_temp_path();

        let locator = ContentLocator::LocalPath {
            path: spool.to_path_buf(),
        };
        let options = JobOptions {
            notify_email: reply_to.map(str::to_string),
            ..Default::default()
        };

        let job = self.manager.submit(locator, options);
        info!(job = %job, filename = %attachment.filename, "Submitted job from attachment");

        self.ledger
            .record(LedgerEntry {
                message_id: message.message_id.clone(),
                fingerprint: fingerprint.clone(),
                processed_at: chrono::Utc::now(),
            })
            .await
            .context("Failed to record ledger entry")?;

        self.seen.lock().map_err(|_| poisoned())?.insert(fingerprint);
        self.spooled.lock().map_err(|_| poisoned())?.push((job, spool));

        if let Some(to) = reply_to {
            self.pending.lock().map_err(|_| poisoned())?.push(PendingReply {
                job,
                to: to.to_string(),
                source: attachment.filename.clone(),
            });
        }

        Ok(1)
    }

    /// Drop spool files whose jobs have finished; TempPath deletes on drop
    fn sweep_spool(&self) {
        if let Ok(mut spooled) = self.spooled.lock() {
            spooled.retain(|(job, _)| {
                self.manager
                    .status(*job)
                    .map_or(false, |snapshot| !snapshot.is_terminal())
            });
        }
    }

    /// Send replies for every pending job that has reached a terminal state.
    /// Transient send failures keep the reply pending for the next cycle.
    async fn flush_replies(&self) -> usize {
        let pending: Vec<PendingReply> = match self.pending.lock() {
            Ok(pending) => pending.clone(),
            Err(_) => return 0,
        };

        let mut sent = 0;
        let mut still_pending = Vec::new();

        for reply in pending {
            let Some(snapshot) = self.manager.status(reply.job) else {
                warn!(job = %reply.job, "Pending reply for unknown job, dropping");
                continue;
            };

            if !snapshot.is_terminal() {
                still_pending.push(reply);
                continue;
            }

            // Cancellation is an operator action; the sender gets no reply
            if snapshot.state == JobState::Cancelled {
                continue;
            }

            let message = build_result_reply(&reply.to, &reply.source, &snapshot);
            match self.replies.send(message).await {
                Ok(()) => {
                    info!(job = %reply.job, to = %reply.to, "Result reply sent");
                    sent += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!(job = %reply.job, error = %e, "Reply send failed, will retry");
                    still_pending.push(reply);
                }
                Err(e) => {
                    error!(job = %reply.job, error = %e, "Reply send failed permanently");
                }
            }
        }

        if let Ok(mut pending) = self.pending.lock() {
            *pending = still_pending;
        }

        sent
    }
}

fn poisoned() -> anyhow::Error {
    anyhow::anyhow!("ingestor state lock poisoned")
}

/// Pull the bare address out of a From header like `Name <a@b.c>`
fn reply_address(from: &str) -> Option<String> {
    let trimmed = from.trim();
    if trimmed.is_empty() {
        return None;
    }

    let address = match (trimmed.find('<'), trimmed.find('>')) {
        (Some(open), Some(close)) if open < close => &trimmed[open + 1..close],
        _ => trimmed,
    };

    let address = address.trim();
    if address.contains('@') {
        Some(address.to_string())
    } else {
        None
    }
}

/// Compose the result reply for a terminal job; also used by `run --email`.
/// The body carries the analysis only; the transcript travels as an
/// attachment with its source and generation timestamp.
pub fn build_result_reply(to: &str, source: &str, snapshot: &JobSnapshot) -> ReplyMessage {
    match (&snapshot.output, &snapshot.error) {
        (Some(output), _) => {
            let html_body = render_html_body(&output.analysis);
            let plain_body = output.analysis.text.clone();
            let generated_at = snapshot.finished_at.unwrap_or(snapshot.created_at);
            let attachment = format!(
                "Source: {}\nGenerated: {}\n\n{}",
                source,
                generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
                output.transcript.text
            );
            ReplyMessage {
                to: to.to_string(),
                subject: format!("Summary of {}", source),
                html_body,
                plain_body,
                attachments: vec![("transcript.txt".to_string(), attachment)],
            }
        }
        (None, failure) => {
            let reason = failure
                .as_ref()
                .map(|f| format!("{} (during {})", f.message, f.stage.label()))
                .unwrap_or_else(|| "unknown error".to_string());
            let plain_body = format!(
                "Processing of {} failed: {}\n\nThe link was not summarized.",
                source, reason
            );
            ReplyMessage {
                to: to.to_string(),
                subject: format!("Could not process {}", source),
                html_body: format!("<p>{}</p>", html_escape(&plain_body)),
                plain_body,
                attachments: Vec::new(),
            }
        }
    }
}

/// Analysis sections as a small HTML document; the transcript stays in the
/// attachment to keep the body readable
fn render_html_body(analysis: &crate::domain::Analysis) -> String {
    match &analysis.sections {
        Some(sections) => {
            let mut html = String::new();
            for (i, section) in sections.iter().enumerate() {
                html.push_str(&format!(
                    "<h2>{}. {}</h2>\n<p>{}</p>\n",
                    i + 1,
                    html_escape(&section.heading),
                    html_escape(&section.body).replace('\n', "<br>\n")
                ));
            }
            html
        }
        None => format!(
            "<p><em>Automatic section formatting failed; raw analysis below.</em></p>\n<p>{}</p>",
            html_escape(&analysis.text).replace('\n', "<br>\n")
        ),
    }
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
