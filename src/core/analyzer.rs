//! Transcript analysis.
//!
//! One chat completion turns the merged transcript into a three-section
//! research summary. The response must contain all three numbered section
//! headings; a malformed response gets exactly one corrective retry, and if
//! that also fails the raw text is kept as a partial analysis rather than
//! failing the job.

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::adapters::{Analyst, ServiceError};
use crate::core::retry::RetryPolicy;
use crate::domain::{Analysis, AnalysisSection, MergedTranscript, SummaryDetail};

/// Section headings the completion must produce, in order
pub const SECTION_HEADINGS: [&str; 3] = [
    "Market Views",
    "Trade Ideas and Position Commentary",
    "Strategic Takeaways",
];

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis service failed after {attempts} attempts: {reason}")]
    ServiceExhausted { attempts: u32, reason: String },

    #[error("analysis service failed: {0}")]
    ServiceFatal(String),

    #[error("transcript is empty, nothing to analyze")]
    EmptyTranscript,
}

/// Runs transcripts through the language model
pub struct AnalysisEngine {
    analyst: std::sync::Arc<dyn Analyst>,
    retry: RetryPolicy,
}

impl AnalysisEngine {
    pub fn new(analyst: std::sync::Arc<dyn Analyst>, retry: RetryPolicy) -> Self {
        Self { analyst, retry }
    }

    /// Analyze a transcript at the requested level of detail
    #[instrument(skip(self, transcript), fields(chars = transcript.text.len()))]
    pub async fn analyze(
        &self,
        transcript: &MergedTranscript,
        detail: SummaryDetail,
    ) -> Result<Analysis, AnalysisError> {
        if transcript.is_empty() {
            return Err(AnalysisError::EmptyTranscript);
        }

        let max_tokens = max_tokens_for(detail);
        let prompt = build_prompt(&transcript.text, detail);

        let first = self.complete_with_retry(&prompt, max_tokens).await?;
        if let Some(sections) = parse_sections(&first) {
            return Ok(Analysis {
                text: first,
                sections: Some(sections),
                partial: false,
            });
        }

        // One corrective pass before accepting a partial result
        warn!("Analysis response missing required sections, retrying once with correction");
        let corrective = format!(
            "{}\n\nYour previous response did not follow the required format. \
             Respond again using exactly the three numbered section headings \
             given above, each on its own line.",
            prompt
        );

        let second = self.complete_with_retry(&corrective, max_tokens).await?;
        if let Some(sections) = parse_sections(&second) {
            return Ok(Analysis {
                text: second,
                sections: Some(sections),
                partial: false,
            });
        }

        info!("Keeping unstructured analysis text as a partial result");
        Ok(Analysis {
            text: second,
            sections: None,
            partial: true,
        })
    }

    async fn complete_with_retry(
        &self,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, AnalysisError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.analyst.complete(prompt, max_tokens).await {
                Ok(text) => return Ok(text),
                Err(e @ ServiceError::Transient(_)) if self.retry.should_retry(attempt) => {
                    warn!(attempt, error = %e, "Analysis call failed, retrying");
                    self.retry.wait(attempt).await;
                }
                Err(ServiceError::Transient(reason)) => {
                    return Err(AnalysisError::ServiceExhausted {
                        attempts: attempt,
                        reason,
                    });
                }
                Err(ServiceError::Fatal(reason)) => {
                    return Err(AnalysisError::ServiceFatal(reason));
                }
            }
        }
    }
}

fn max_tokens_for(detail: SummaryDetail) -> u32 {
    match detail {
        SummaryDetail::Short => 800,
        SummaryDetail::Medium => 1600,
        SummaryDetail::Detailed => 3200,
    }
}

fn detail_instruction(detail: SummaryDetail) -> &'static str {
    match detail {
        SummaryDetail::Short => "Keep each section to two or three bullet points.",
        SummaryDetail::Medium => "Give each section four to six bullet points.",
        SummaryDetail::Detailed => {
            "Cover each section exhaustively; include every view, trade and takeaway mentioned."
        }
    }
}

fn build_prompt(transcript: &str, detail: SummaryDetail) -> String {
    format!(
        "You are an analyst summarizing a recorded financial call for a portfolio manager.\n\
         Produce a summary with exactly these three numbered sections, each heading on its own line:\n\
         \n\
         1. {}\n\
         2. {}\n\
         3. {}\n\
         \n\
         Rules:\n\
         - Base every statement strictly on the transcript; never invent views, \
         numbers or positions that are not in it.\n\
         - Quote the speaker verbatim where the exact wording matters.\n\
         - If a section has no relevant content, write \"None discussed.\" under its heading.\n\
         - {}\n\
         \n\
         Transcript:\n\
         {}",
        SECTION_HEADINGS[0],
        SECTION_HEADINGS[1],
        SECTION_HEADINGS[2],
        detail_instruction(detail),
        transcript
    )
}

/// Split a well-formed response into its three sections.
///
/// Returns None unless every heading appears, in order.
fn parse_sections(text: &str) -> Option<Vec<AnalysisSection>> {
    let mut positions = Vec::with_capacity(SECTION_HEADINGS.len());
    let mut cursor = 0;

    for heading in SECTION_HEADINGS {
        let at = text[cursor..].find(heading)? + cursor;
        positions.push(at);
        cursor = at + heading.len();
    }

    let mut sections = Vec::with_capacity(SECTION_HEADINGS.len());
    for (i, heading) in SECTION_HEADINGS.iter().enumerate() {
        let body_start = positions[i] + heading.len();
        let body_end = match positions.get(i + 1) {
            // Cut before the line holding the next heading so its "2."
            // numbering does not leak into this body
            Some(&next) => text[..next].rfind('\n').unwrap_or(next),
            None => text.len(),
        };
        let body = text[body_start..body_end.max(body_start)]
            .trim_matches(|c: char| c == ':' || c.is_whitespace())
            .to_string();

        sections.push(AnalysisSection {
            heading: heading.to_string(),
            body,
        });
    }

    Some(sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const GOOD_RESPONSE: &str = "\
1. Market Views\n\
Rates stay higher for longer.\n\
\n\
2. Trade Ideas and Position Commentary\n\
Long two-year notes, \"we added on the dip\".\n\
\n\
3. Strategic Takeaways\n\
Stay defensive into year end.\n";

    struct ScriptedAnalyst {
        responses: Vec<Result<String, ServiceError>>,
        calls: AtomicU32,
    }

    impl ScriptedAnalyst {
        fn new(responses: Vec<Result<String, ServiceError>>) -> Arc<Self> {
            Arc::new(Self {
                responses,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Analyst for ScriptedAnalyst {
        async fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String, ServiceError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.responses.get(i) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(ServiceError::Transient(m))) => Err(ServiceError::Transient(m.clone())),
                Some(Err(ServiceError::Fatal(m))) => Err(ServiceError::Fatal(m.clone())),
                None => panic!("analyst called more times than scripted"),
            }
        }
    }

    fn transcript() -> MergedTranscript {
        MergedTranscript {
            text: "We think rates stay higher for longer.".to_string(),
            segments: Vec::new(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 1.0,
        }
    }

    #[test]
    fn test_parse_sections_well_formed() {
        let sections = parse_sections(GOOD_RESPONSE).unwrap();
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].heading, "Market Views");
        assert!(sections[0].body.contains("higher for longer"));
        assert!(sections[1].body.contains("we added on the dip"));
        assert!(sections[2].body.contains("defensive"));
    }

    #[test]
    fn test_parse_sections_rejects_missing_heading() {
        assert!(parse_sections("1. Market Views\nstuff\n").is_none());
        assert!(parse_sections("free-form summary with no headings").is_none());
    }

    #[test]
    fn test_parse_sections_requires_order() {
        let out_of_order = "Strategic Takeaways\nx\nMarket Views\ny\n\
                            Trade Ideas and Position Commentary\nz\n";
        assert!(parse_sections(out_of_order).is_none());
    }

    #[tokio::test]
    async fn test_well_formed_response_first_try() {
        let analyst = ScriptedAnalyst::new(vec![Ok(GOOD_RESPONSE.to_string())]);
        let engine = AnalysisEngine::new(analyst, fast_retry());
        let analysis = engine
            .analyze(&transcript(), SummaryDetail::Medium)
            .await
            .unwrap();

        assert!(!analysis.partial);
        assert_eq!(analysis.sections.as_ref().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_then_corrected() {
        let analyst = ScriptedAnalyst::new(vec![
            Ok("a rambling summary".to_string()),
            Ok(GOOD_RESPONSE.to_string()),
        ]);
        let engine = AnalysisEngine::new(analyst, fast_retry());
        let analysis = engine
            .analyze(&transcript(), SummaryDetail::Short)
            .await
            .unwrap();

        assert!(!analysis.partial);
        assert!(analysis.sections.is_some());
    }

    #[tokio::test]
    async fn test_twice_malformed_falls_back_to_partial() {
        let analyst = ScriptedAnalyst::new(vec![
            Ok("still rambling".to_string()),
            Ok("rambling harder".to_string()),
        ]);
        let engine = AnalysisEngine::new(analyst, fast_retry());
        let analysis = engine
            .analyze(&transcript(), SummaryDetail::Medium)
            .await
            .unwrap();

        assert!(analysis.partial);
        assert!(analysis.sections.is_none());
        assert_eq!(analysis.text, "rambling harder");
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_exhaust() {
        let analyst = ScriptedAnalyst::new(vec![
            Err(ServiceError::Transient("503".to_string())),
            Err(ServiceError::Transient("503".to_string())),
        ]);
        let engine = AnalysisEngine::new(analyst, fast_retry());
        let err = engine
            .analyze(&transcript(), SummaryDetail::Medium)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::ServiceExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_empty_transcript_is_rejected() {
        let engine = AnalysisEngine::new(ScriptedAnalyst::new(vec![]), fast_retry());
        let empty = MergedTranscript {
            text: String::new(),
            segments: Vec::new(),
        };
        let err = engine.analyze(&empty, SummaryDetail::Medium).await.unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyTranscript));
    }
}
