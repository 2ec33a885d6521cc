//! Command-line interface for finscribe.
//!
//! `run` pushes a single locator through the pipeline and prints the report;
//! `watch-mail` starts the mailbox watcher and keeps submitting jobs until
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;

use crate::adapters::{ChatClient, ImapMailbox, SmtpReplySender, WhisperClient};
use crate::adapters::mailbox::ImapConfig;
use crate::adapters::smtp::SmtpConfig;
use crate::config::{self, Config};
use crate::core::{
    AnalysisEngine, AudioSegmenter, ChunkLimits, ContentFetcher, JobManager, LinkResolver,
    MediaPipeline, RetryPolicy, TranscriptionCoordinator,
};
use crate::domain::{JobOptions, JobSnapshot, JobState, SummaryDetail};
use crate::ingest::{EmailIngestor, IngestLedger};

/// finscribe - audio transcription and analysis pipeline
#[derive(Parser, Debug)]
#[command(name = "finscribe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process one recording (local file, direct URL or sharing link)
    Run {
        /// Local path or URL of the recording
        input: String,

        /// Analysis depth
        #[arg(short, long, value_enum, default_value = "medium")]
        detail: DetailLevel,

        /// Also email the finished report to this address
        #[arg(short, long)]
        email: Option<String>,

        /// Write the combined report to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Watch the configured mailbox and process links from incoming email
    WatchMail {
        /// Run a single poll cycle and exit
        #[arg(long)]
        once: bool,

        /// Poll interval in seconds (overrides config)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Analysis depth for the CLI (maps to SummaryDetail)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DetailLevel {
    Short,
    Medium,
    Detailed,
}

impl From<DetailLevel> for SummaryDetail {
    fn from(level: DetailLevel) -> Self {
        match level {
            DetailLevel::Short => SummaryDetail::Short,
            DetailLevel::Medium => SummaryDetail::Medium,
            DetailLevel::Detailed => SummaryDetail::Detailed,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                input,
                detail,
                email,
                output,
            } => run_one(&input, detail.into(), email, output).await,
            Commands::WatchMail { once, interval } => watch_mail(once, interval).await,
            Commands::Config => show_config(),
        }
    }
}

/// Assemble the production pipeline and worker pool from config
fn build_manager(config: &Config) -> Arc<JobManager> {
    let whisper = Arc::new(WhisperClient::new(
        &config.api_base_url,
        &config.api_key,
        &config.whisper_model,
    ));
    let chat = Arc::new(ChatClient::new(
        &config.api_base_url,
        &config.api_key,
        &config.chat_model,
    ));

    let pipeline = MediaPipeline {
        resolver: LinkResolver::new(),
        fetcher: ContentFetcher::new(RetryPolicy::for_downloads()),
        segmenter: AudioSegmenter::new(ChunkLimits {
            max_duration_secs: config.limits.max_chunk_minutes as f64 * 60.0,
            max_size_bytes: config.limits.max_chunk_mb * 1024 * 1024,
        }),
        transcriber: TranscriptionCoordinator::new(
            whisper,
            config.retry.clone(),
            config.limits.transcribe_parallelism,
        ),
        analyzer: AnalysisEngine::new(chat, config.retry.clone()),
        size_ceiling_bytes: config.size_ceiling_bytes(),
    };

    Arc::new(JobManager::new(Arc::new(pipeline), config.limits.workers))
}

/// Process a single input and print or save the report
async fn run_one(
    input: &str,
    detail: SummaryDetail,
    email: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = config::config()?;
    if config.api_key.is_empty() {
        anyhow::bail!("No API key configured. Set FINSCRIBE_API_KEY or api.api_key in config.yaml");
    }

    let manager = build_manager(config);
    let resolver = LinkResolver::new();
    let locator = resolver
        .classify(input)
        .with_context(|| format!("Could not understand input: {}", input))?;

    eprintln!("Processing {} ...", locator);

    let options = JobOptions {
        summary_detail: detail,
        notify_email: email.clone(),
    };
    let job = manager.submit(locator, options);

    let snapshot = manager
        .wait(job)
        .await
        .context("Job vanished from the registry")?;

    match snapshot.state {
        JobState::Completed => {
            let report = render_report(&snapshot);

            if let Some(path) = &output {
                std::fs::write(path, &report)
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
                eprintln!("Report written to {}", path.display());
            } else {
                println!("{}", report);
            }

            if let Some(to) = email {
                send_report_email(config, &to, &snapshot).await?;
                eprintln!("Report emailed to {}", to);
            }

            eprintln!("\n[Job {} completed]", snapshot.id);
            Ok(())
        }
        JobState::Failed => {
            let failure = snapshot
                .error
                .map(|f| format!("{} (during {})", f.message, f.stage.label()))
                .unwrap_or_else(|| "unknown error".to_string());
            eprintln!("\n[Job {} failed: {}]", snapshot.id, failure);
            std::process::exit(1);
        }
        state => {
            eprintln!("\n[Job {} ended in state: {}]", snapshot.id, state.label());
            std::process::exit(1);
        }
    }
}

/// Combined report: analysis first, full transcript after
fn render_report(snapshot: &JobSnapshot) -> String {
    let Some(output) = &snapshot.output else {
        return String::new();
    };

    let mut report = String::new();
    report.push_str(&format!("Source: {}\n", snapshot.locator));
    report.push_str(&format!("Job: {}\n\n", snapshot.id));

    report.push_str("=== Analysis ===\n\n");
    if output.analysis.partial {
        report.push_str("(section formatting failed; raw analysis below)\n\n");
    }
    report.push_str(output.analysis.text.trim());
    report.push_str("\n\n=== Transcript ===\n\n");
    report.push_str(output.transcript.text.trim());
    report.push('\n');

    report
}

/// One-off SMTP send for `run --email`
async fn send_report_email(config: &Config, to: &str, snapshot: &JobSnapshot) -> Result<()> {
    let email = config
        .email
        .as_ref()
        .context("`--email` needs an [email] section in config.yaml")?;

    let sender = SmtpReplySender::new(SmtpConfig {
        host: email.smtp_host.clone(),
        username: email.username.clone(),
        password: email.password.clone().unwrap_or_default(),
        sender: email.sender.clone().unwrap_or_else(|| email.username.clone()),
    })
    .map_err(|e| anyhow::anyhow!("SMTP setup failed: {}", e))?;

    let reply = crate::ingest::ingestor::build_result_reply(
        to,
        &snapshot.locator.source_name(),
        snapshot,
    );

    crate::adapters::ReplySender::send(&sender, reply)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to send report email: {}", e))
}

/// Start the mailbox watcher
async fn watch_mail(once: bool, interval_override: Option<u64>) -> Result<()> {
    let config = config::config()?;
    if config.api_key.is_empty() {
        anyhow::bail!("No API key configured. Set FINSCRIBE_API_KEY or api.api_key in config.yaml");
    }
    let email = config
        .email
        .as_ref()
        .context("watch-mail needs an [email] section in config.yaml")?;
    let password = email
        .password
        .clone()
        .context("No mailbox password configured. Set FINSCRIBE_EMAIL_PASSWORD")?;

    let mailbox = Arc::new(ImapMailbox::new(ImapConfig {
        host: email.imap_host.clone(),
        port: email.imap_port,
        username: email.username.clone(),
        password: password.clone(),
        folder: email.imap_folder.clone().unwrap_or_else(|| "INBOX".to_string()),
    }));

    let replies = Arc::new(
        SmtpReplySender::new(SmtpConfig {
            host: email.smtp_host.clone(),
            username: email.username.clone(),
            password,
            sender: email.sender.clone().unwrap_or_else(|| email.username.clone()),
        })
        .map_err(|e| anyhow::anyhow!("SMTP setup failed: {}", e))?,
    );

    let manager = build_manager(config);
    let ledger = IngestLedger::new(config.ledger_path());
    let ingestor = EmailIngestor::new(mailbox, replies, manager, ledger).await?;

    if once {
        let outcome = ingestor.poll_once().await?;
        println!(
            "Polled {} message(s), submitted {} job(s), sent {} repl(y/ies)",
            outcome.messages, outcome.submitted, outcome.replies_sent
        );
        return Ok(());
    }

    let interval = Duration::from_secs(interval_override.unwrap_or(email.poll_interval_secs));
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(true);
        }
    });

    eprintln!(
        "Watching {} every {}s (ctrl-c to stop)",
        email.imap_host,
        interval.as_secs()
    );
    ingestor.run(interval, stop_rx).await;
    Ok(())
}

/// Print the resolved configuration with secrets masked
fn show_config() -> Result<()> {
    let config = config::config()?;

    println!("home:        {}", config.home.display());
    println!("ledger:      {}", config.ledger_path().display());
    println!("api base:    {}", config.api_base_url);
    println!("api key:     {}", mask(&config.api_key));
    println!("whisper:     {}", config.whisper_model);
    println!("chat model:  {}", config.chat_model);
    println!(
        "limits:      {} MB download, {} min / {} MB chunks, {} workers, {} parallel transcriptions",
        config.limits.max_download_mb,
        config.limits.max_chunk_minutes,
        config.limits.max_chunk_mb,
        config.limits.workers,
        config.limits.transcribe_parallelism
    );

    match &config.email {
        Some(email) => {
            println!("imap:        {}:{}", email.imap_host, email.imap_port);
            println!("smtp:        {}", email.smtp_host);
            println!("mail user:   {}", email.username);
            println!("poll every:  {}s", email.poll_interval_secs);
        }
        None => println!("email:       (not configured)"),
    }

    Ok(())
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        "(not set)".to_string()
    } else if secret.len() <= 8 {
        "****".to_string()
    } else {
        format!("{}...{}", &secret[..4], &secret[secret.len() - 4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask(""), "(not set)");
        assert_eq!(mask("short"), "****");
        assert_eq!(mask("sk-abcdefghijklmnop"), "sk-a...mnop");
    }

    #[test]
    fn test_detail_level_mapping() {
        assert_eq!(SummaryDetail::from(DetailLevel::Short), SummaryDetail::Short);
        assert_eq!(
            SummaryDetail::from(DetailLevel::Detailed),
            SummaryDetail::Detailed
        );
    }
}
