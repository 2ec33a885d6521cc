//! Domain types for the finscribe pipeline.
//!
//! This module contains the core data structures:
//! - Locator: classified content references (paths, URLs, sharing links)
//! - Job: lifecycle state, options, snapshots
//! - Transcript: chunks, segments, merged transcripts, analyses

pub mod job;
pub mod locator;
pub mod transcript;

// Re-export commonly used types
pub use job::{JobFailure, JobOptions, JobOutput, JobSnapshot, JobState, SummaryDetail};
pub use locator::{ContentLocator, PlatformKind, SharingPlatform, VideoPlatform};
pub use transcript::{
    format_offset, Analysis, AnalysisSection, AudioChunk, MergedTranscript, TranscriptSegment,
};
