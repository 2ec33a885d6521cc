//! End-to-end job lifecycle over scripted pipeline stages: completion,
//! stage failure, and cancellation with ephemeral-file cleanup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;

use finscribe::core::analyzer::AnalysisError;
use finscribe::core::fetcher::{DownloadError, DownloadedAsset, MediaKind, ProgressFn};
use finscribe::core::resolver::{ResolutionError, ResolvedUrl};
use finscribe::core::segmenter::{SegmentationError, SegmentedAudio};
use finscribe::core::transcriber::TranscriptionError;
use finscribe::core::{JobManager, PipelineStages};
use finscribe::domain::{
    Analysis, AnalysisSection, AudioChunk, ContentLocator, JobOptions, JobState, MergedTranscript,
    SharingPlatform, SummaryDetail, TranscriptSegment,
};

/// Stages that behave like a healthy pipeline, with failure/delay knobs.
/// `fetch` writes a real temp file so cleanup is observable.
struct FakeStages {
    fetch_delay: Duration,
    doom_chunk: Option<usize>,
    /// Observed path of the last fetched asset
    fetched_path: std::sync::Mutex<Option<PathBuf>>,
}

impl FakeStages {
    fn healthy() -> Self {
        Self {
            fetch_delay: Duration::ZERO,
            doom_chunk: None,
            fetched_path: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl PipelineStages for FakeStages {
    async fn resolve(
        &self,
        locator: &ContentLocator,
    ) -> Result<Option<ResolvedUrl>, ResolutionError> {
        // Mimics the Dropbox direct-download rewrite
        Ok(locator.url().map(|u| ResolvedUrl(u.replace("dl=0", "dl=1"))))
    }

    async fn fetch(
        &self,
        _locator: &ContentLocator,
        resolved: Option<&ResolvedUrl>,
        progress: &ProgressFn,
    ) -> Result<DownloadedAsset, DownloadError> {
        assert!(
            resolved.map_or(true, |r| r.0.contains("dl=1")),
            "fetch must see the rewritten URL"
        );

        tokio::time::sleep(self.fetch_delay).await;

        let file = NamedTempFile::with_suffix(".mp3")
            .map_err(|e| DownloadError::Fatal(e.to_string()))?;
        std::fs::write(file.path(), b"fake audio")
            .map_err(|e| DownloadError::Fatal(e.to_string()))?;

        *self.fetched_path.lock().unwrap() = Some(file.path().to_path_buf());
        progress(10, Some(10));

        Ok(DownloadedAsset::ephemeral(
            file.into_temp_path(),
            MediaKind::Audio,
            10,
        ))
    }

    async fn segment(&self, audio: &Path) -> Result<SegmentedAudio, SegmentationError> {
        let chunks = (0..4)
            .map(|i| AudioChunk {
                index: i,
                start_secs: i as f64 * 600.0,
                duration_secs: 600.0,
                path: audio.to_path_buf(),
            })
            .collect();
        Ok(SegmentedAudio::from_chunks(chunks, 2400.0))
    }

    async fn transcribe(
        &self,
        audio: &SegmentedAudio,
    ) -> Result<MergedTranscript, TranscriptionError> {
        if let Some(doomed) = self.doom_chunk {
            return Err(TranscriptionError::ChunkExhausted {
                chunk: doomed,
                attempts: 3,
                reason: "service kept timing out".to_string(),
            });
        }

        let segments = audio
            .chunks
            .iter()
            .map(|c| TranscriptSegment {
                chunk_index: c.index,
                text: format!("part {}", c.index),
                start_secs: c.start_secs,
                duration_secs: c.duration_secs,
            })
            .collect();
        Ok(MergedTranscript::from_segments(segments))
    }

    async fn analyze(
        &self,
        _transcript: &MergedTranscript,
        _detail: SummaryDetail,
    ) -> Result<Analysis, AnalysisError> {
        let sections = ["Market Views", "Trade Ideas and Position Commentary", "Strategic Takeaways"]
            .iter()
            .map(|h| AnalysisSection {
                heading: h.to_string(),
                body: format!("{} body", h),
            })
            .collect();
        Ok(Analysis {
            text: "full analysis".to_string(),
            sections: Some(sections),
            partial: false,
        })
    }
}

fn dropbox_locator() -> ContentLocator {
    ContentLocator::SharingService {
        url: "https://www.dropbox.com/s/abc/call.mp3?dl=0".to_string(),
        platform: SharingPlatform::Dropbox,
    }
}

#[tokio::test]
async fn dropbox_link_runs_to_completion_with_three_sections() {
    let stages = Arc::new(FakeStages::healthy());
    let manager = JobManager::new(stages.clone(), 2);

    let id = manager.submit(dropbox_locator(), JobOptions::default());
    let snapshot = manager.wait(id).await.unwrap();

    assert_eq!(snapshot.state, JobState::Completed);
    assert_eq!(snapshot.progress, 1.0);

    let output = snapshot.output.expect("completed job carries output");
    let sections = output.analysis.sections.expect("validated sections");
    assert_eq!(sections.len(), 3);
    assert_eq!(sections[0].heading, "Market Views");
    assert!(!output.analysis.partial);

    // Transcript merged in chunk order with timeline markers
    assert!(output.transcript.text.starts_with("[00:00] part 0"));
    assert!(output.transcript.text.contains("[30:00] part 3"));

    // The ephemeral download is gone once the job is terminal
    let fetched = stages.fetched_path.lock().unwrap().clone().unwrap();
    assert!(!fetched.exists(), "downloaded temp file must be cleaned up");
}

#[tokio::test]
async fn exhausted_chunk_fails_the_job_without_partial_output() {
    let stages = Arc::new(FakeStages {
        doom_chunk: Some(3),
        ..FakeStages::healthy()
    });
    let manager = JobManager::new(stages, 1);

    let id = manager.submit(dropbox_locator(), JobOptions::default());
    let snapshot = manager.wait(id).await.unwrap();

    assert_eq!(snapshot.state, JobState::Failed);
    assert!(snapshot.output.is_none(), "no partial transcript on failure");

    let failure = snapshot.error.unwrap();
    assert_eq!(failure.stage, JobState::Transcribing);
    assert_eq!(failure.kind, "transcription_exhausted");
    assert!(failure.message.contains("chunk 3"));
    assert!(failure.message.contains("3 attempts"));
}

#[tokio::test]
async fn cancellation_during_download_cleans_up_and_ends_cancelled() {
    let stages = Arc::new(FakeStages {
        fetch_delay: Duration::from_millis(300),
        ..FakeStages::healthy()
    });
    let manager = JobManager::new(stages.clone(), 1);

    let id = manager.submit(dropbox_locator(), JobOptions::default());

    // Cancel once the worker is inside the fetch stage
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.cancel(id));

    let snapshot = manager.wait(id).await.unwrap();
    assert_eq!(snapshot.state, JobState::Cancelled);
    assert!(snapshot.output.is_none());
    assert!(snapshot.error.is_none());
    assert!(snapshot.finished_at.is_some());

    // The fetch finished before the boundary check, so a temp file was
    // created; cancellation must still have dropped it
    let fetched = stages.fetched_path.lock().unwrap().clone().unwrap();
    assert!(!fetched.exists(), "cancelled job must leave no temp files");
}

#[tokio::test]
async fn jobs_run_in_submission_order_on_a_single_worker() {
    let stages = Arc::new(FakeStages {
        fetch_delay: Duration::from_millis(30),
        ..FakeStages::healthy()
    });
    let manager = JobManager::new(stages, 1);

    let first = manager.submit(dropbox_locator(), JobOptions::default());
    let second = manager.submit(dropbox_locator(), JobOptions::default());

    let first_done = manager.wait(first).await.unwrap();
    let second_done = manager.wait(second).await.unwrap();

    assert_eq!(first_done.state, JobState::Completed);
    assert_eq!(second_done.state, JobState::Completed);
    assert!(first_done.finished_at.unwrap() <= second_done.finished_at.unwrap());
}
