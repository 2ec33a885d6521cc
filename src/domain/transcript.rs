//! Chunk, transcript segment and analysis types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One bounded-duration slice of the source audio.
///
/// Chunks tile the source exactly: `start_secs + duration_secs` of chunk i
/// equals `start_secs` of chunk i+1, and the last chunk ends at the source
/// duration.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// 0-based position in the segmentation
    pub index: usize,

    /// Absolute offset in the original timeline, seconds
    pub start_secs: f64,

    /// Chunk length, seconds
    pub duration_secs: f64,

    /// Segment audio file (ephemeral; owned by the segmentation)
    pub path: PathBuf,
}

impl AudioChunk {
    /// End offset in the original timeline
    pub fn end_secs(&self) -> f64 {
        self.start_secs + self.duration_secs
    }
}

/// Recognized text for one chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Index of the chunk this text came from
    pub chunk_index: usize,

    /// Recognized text
    pub text: String,

    /// Chunk start offset in the original timeline, seconds
    pub start_secs: f64,

    /// Chunk duration, seconds
    pub duration_secs: f64,
}

/// Ordered merge of all segment texts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedTranscript {
    /// Full text with `[mm:ss]` offset annotations between segments
    pub text: String,

    /// Segments in chunk order
    pub segments: Vec<TranscriptSegment>,
}

impl MergedTranscript {
    /// Build the merged transcript from segments already sorted by chunk
    /// index. Offsets annotate approximate timestamps in the merged output.
    pub fn from_segments(segments: Vec<TranscriptSegment>) -> Self {
        let mut text = String::new();
        for segment in &segments {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            // Single-chunk transcripts skip the redundant [00:00] marker
            if segments.len() > 1 {
                text.push_str(&format!("[{}] ", format_offset(segment.start_secs)));
            }
            text.push_str(segment.text.trim());
        }
        Self { text, segments }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Render seconds as `mm:ss` (or `h:mm:ss` past an hour)
pub fn format_offset(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

/// Structured financial analysis of a transcript.
///
/// `partial` is set when the analysis service returned text that failed
/// section validation twice; the raw response is kept rather than failing
/// the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Full analysis text as returned by the service
    pub text: String,

    /// Section bodies in contract order, when validation succeeded
    pub sections: Option<Vec<AnalysisSection>>,

    /// True when the structure could not be validated
    pub partial: bool,
}

/// One validated section of the analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSection {
    /// Heading as required by the prompt contract
    pub heading: String,

    /// Body text under the heading
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(index: usize, start: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            chunk_index: index,
            text: text.to_string(),
            start_secs: start,
            duration_secs: 600.0,
        }
    }

    #[test]
    fn test_merge_annotates_offsets() {
        let merged = MergedTranscript::from_segments(vec![
            segment(0, 0.0, "first part"),
            segment(1, 600.0, "second part"),
        ]);
        assert!(merged.text.starts_with("[00:00] first part"));
        assert!(merged.text.contains("[10:00] second part"));
    }

    #[test]
    fn test_single_segment_has_no_marker() {
        let merged = MergedTranscript::from_segments(vec![segment(0, 0.0, "only part")]);
        assert_eq!(merged.text, "only part");
    }

    #[test]
    fn test_format_offset() {
        assert_eq!(format_offset(0.0), "00:00");
        assert_eq!(format_offset(75.0), "01:15");
        assert_eq!(format_offset(3725.0), "1:02:05");
    }
}
