//! finscribe - financial audio transcription and analysis pipeline
//!
//! Takes a recording (local file, direct URL, or a sharing-service link),
//! turns it into a transcript, and distills the transcript into a
//! three-section research summary.
//!
//! # Architecture
//!
//! Jobs flow through six stages: resolve, download, segment, transcribe,
//! analyze, report. The `JobManager` drives them on a fixed worker pool;
//! every stage publishes its state to the job registry, cancellation is
//! checked at stage boundaries, and ephemeral media files are owned by the
//! worker stack so they clean up on every exit path.
//!
//! # Modules
//!
//! - `adapters`: External systems (speech-to-text, chat, IMAP, SMTP, ffmpeg)
//! - `core`: Pipeline stages and the job manager
//! - `domain`: Data structures (locators, jobs, transcripts)
//! - `ingest`: Email ingestion with a replayable dedupe ledger
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Summarize one recording
//! finscribe run https://www.dropbox.com/s/abc/call.mp3?dl=0
//!
//! # Watch a mailbox for links
//! finscribe watch-mail --interval 60
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;

// Re-export main types at crate root for convenience
pub use crate::core::{JobManager, LinkResolver, MediaPipeline, PipelineStages, RetryPolicy};
pub use domain::{
    Analysis, ContentLocator, JobOptions, JobSnapshot, JobState, MergedTranscript, SummaryDetail,
};
pub use ingest::{EmailIngestor, IngestLedger};
