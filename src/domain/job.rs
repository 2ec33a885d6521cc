//! Job state and status snapshots.
//!
//! A Job is one locator moving through the pipeline. State transitions are
//! monotonic and one-directional; the manager is the only writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::locator::ContentLocator;
use super::transcript::{Analysis, MergedTranscript};

/// Pipeline stage / job state.
///
/// Ordered: a job only ever moves to a state with a higher ordinal, so
/// comparing ordinals is enough to enforce monotonicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Resolving,
    Downloading,
    Segmenting,
    Transcribing,
    Analyzing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stage label for status displays
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Segmenting => "segmenting",
            Self::Transcribing => "transcribing",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Requested analysis depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryDetail {
    Short,
    #[default]
    Medium,
    Detailed,
}

/// Options recognized at submission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Analysis depth
    #[serde(default)]
    pub summary_detail: SummaryDetail,

    /// Address to send the finished report to (ingestor/CLI concern)
    #[serde(default)]
    pub notify_email: Option<String>,
}

/// Terminal result of a successful job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutput {
    pub transcript: MergedTranscript,
    pub analysis: Analysis,
}

/// Why and where a job failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    /// Stage that was active when the error surfaced
    pub stage: JobState,

    /// Error kind, stable across messages (e.g. "transcription_exhausted")
    pub kind: String,

    /// Human-readable reason
    pub message: String,
}

impl JobFailure {
    pub fn new(stage: JobState, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Non-blocking view of a job returned by `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub locator: ContentLocator,
    pub options: JobOptions,
    pub state: JobState,

    /// Monotone progress in 0..=1
    pub progress: f32,

    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    pub output: Option<JobOutput>,
    pub error: Option<JobFailure>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
