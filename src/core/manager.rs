//! Job queue and worker pool.
//!
//! Jobs run FIFO on a fixed pool of workers. The registry is the single
//! source of truth for job state; workers publish each transition atomically
//! and state only ever moves forward. Cancellation is cooperative: the flag
//! is checked at every stage boundary, and ephemeral files release on every
//! exit path because the worker stack owns them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::core::analyzer::{AnalysisEngine, AnalysisError};
use crate::core::fetcher::{ContentFetcher, DownloadError, DownloadedAsset, ProgressFn};
use crate::core::resolver::{LinkResolver, ResolutionError, ResolvedUrl};
use crate::core::segmenter::{AudioSegmenter, SegmentationError, SegmentedAudio};
use crate::core::transcriber::{TranscriptionCoordinator, TranscriptionError};
use crate::domain::{
    Analysis, ContentLocator, JobFailure, JobOptions, JobOutput, JobSnapshot, JobState,
    MergedTranscript, SummaryDetail,
};

/// The five pipeline stages a worker drives a job through.
///
/// The production implementation composes the real resolver, fetcher,
/// segmenter, transcription coordinator and analysis engine; tests
/// substitute scripted stages.
#[async_trait]
pub trait PipelineStages: Send + Sync {
    /// Resolve a URL locator; local paths resolve to None
    async fn resolve(
        &self,
        locator: &ContentLocator,
    ) -> Result<Option<ResolvedUrl>, ResolutionError>;

    async fn fetch(
        &self,
        locator: &ContentLocator,
        resolved: Option<&ResolvedUrl>,
        progress: &ProgressFn,
    ) -> Result<DownloadedAsset, DownloadError>;

    async fn segment(&self, audio: &Path) -> Result<SegmentedAudio, SegmentationError>;

    async fn transcribe(&self, audio: &SegmentedAudio)
        -> Result<MergedTranscript, TranscriptionError>;

    async fn analyze(
        &self,
        transcript: &MergedTranscript,
        detail: SummaryDetail,
    ) -> Result<Analysis, AnalysisError>;
}

/// Production pipeline backed by the real components
pub struct MediaPipeline {
    pub resolver: LinkResolver,
    pub fetcher: ContentFetcher,
    pub segmenter: AudioSegmenter,
    pub transcriber: TranscriptionCoordinator,
    pub analyzer: AnalysisEngine,
    pub size_ceiling_bytes: u64,
}

#[async_trait]
impl PipelineStages for MediaPipeline {
    async fn resolve(
        &self,
        locator: &ContentLocator,
    ) -> Result<Option<ResolvedUrl>, ResolutionError> {
        match locator {
            ContentLocator::LocalPath { .. } => Ok(None),
            _ => Ok(Some(self.resolver.resolve(locator).await?)),
        }
    }

    async fn fetch(
        &self,
        locator: &ContentLocator,
        resolved: Option<&ResolvedUrl>,
        progress: &ProgressFn,
    ) -> Result<DownloadedAsset, DownloadError> {
        match (locator, resolved) {
            (ContentLocator::LocalPath { path }, _) => {
                self.fetcher.fetch_local(path, self.size_ceiling_bytes).await
            }
            (_, Some(url)) => {
                self.fetcher
                    .fetch_url(url, self.size_ceiling_bytes, progress)
                    .await
            }
            (_, None) => Err(DownloadError::Fatal(
                "URL locator reached the fetcher without a resolved URL".to_string(),
            )),
        }
    }

    async fn segment(&self, audio: &Path) -> Result<SegmentedAudio, SegmentationError> {
        self.segmenter.segment(audio).await
    }

    async fn transcribe(
        &self,
        audio: &SegmentedAudio,
    ) -> Result<MergedTranscript, TranscriptionError> {
        self.transcriber.transcribe(audio).await
    }

    async fn analyze(
        &self,
        transcript: &MergedTranscript,
        detail: SummaryDetail,
    ) -> Result<Analysis, AnalysisError> {
        self.analyzer.analyze(transcript, detail).await
    }
}

/// Progress floor each stage publishes on entry; downloads interpolate
/// inside their window
fn stage_floor(state: JobState) -> f32 {
    match state {
        JobState::Queued => 0.0,
        JobState::Resolving => 0.05,
        JobState::Downloading => 0.10,
        JobState::Segmenting => 0.40,
        JobState::Transcribing => 0.50,
        JobState::Analyzing => 0.85,
        JobState::Completed | JobState::Failed | JobState::Cancelled => 1.0,
    }
}

const DOWNLOAD_WINDOW: (f32, f32) = (0.10, 0.40);

struct JobEntry {
    snapshot: JobSnapshot,
    cancel: Arc<AtomicBool>,
}

type Registry = Arc<RwLock<HashMap<Uuid, JobEntry>>>;

/// Owns the job registry and the worker pool
pub struct JobManager {
    registry: Registry,
    queue: mpsc::UnboundedSender<Uuid>,
}

impl JobManager {
    /// Start `workers` workers over the given pipeline
    pub fn new(stages: Arc<dyn PipelineStages>, workers: usize) -> Self {
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel::<Uuid>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let registry = Arc::clone(&registry);
            let stages = Arc::clone(&stages);
            let rx = Arc::clone(&rx);

            tokio::spawn(async move {
                loop {
                    let id = {
                        let mut rx = rx.lock().await;
                        match rx.recv().await {
                            Some(id) => id,
                            None => break,
                        }
                    };
                    run_job(&*stages, &registry, id).await;
                }
                info!(worker, "Worker shutting down");
            });
        }

        Self {
            registry,
            queue: tx,
        }
    }

    /// Queue a job; returns its id immediately
    pub fn submit(&self, locator: ContentLocator, options: JobOptions) -> Uuid {
        let id = Uuid::new_v4();
        let snapshot = JobSnapshot {
            id,
            locator,
            options,
            state: JobState::Queued,
            progress: 0.0,
            created_at: Utc::now(),
            finished_at: None,
            output: None,
            error: None,
        };

        if let Ok(mut registry) = self.registry.write() {
            registry.insert(
                id,
                JobEntry {
                    snapshot,
                    cancel: Arc::new(AtomicBool::new(false)),
                },
            );
        }

        if self.queue.send(id).is_err() {
            // Worker pool is gone; fail the job rather than strand it
            fail_job(
                &self.registry,
                id,
                JobFailure::new(JobState::Queued, "queue_closed", "worker pool is shut down"),
            );
        } else {
            info!(job = %id, "Job queued");
        }

        id
    }

    /// Non-blocking status snapshot
    pub fn status(&self, id: Uuid) -> Option<JobSnapshot> {
        self.registry
            .read()
            .ok()?
            .get(&id)
            .map(|entry| entry.snapshot.clone())
    }

    /// All known jobs, newest first
    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = match self.registry.read() {
            Ok(registry) => registry.values().map(|e| e.snapshot.clone()).collect(),
            Err(_) => Vec::new(),
        };
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Request cancellation.
    ///
    /// Queued jobs cancel immediately; running jobs cancel at their next
    /// stage boundary. Returns false for unknown or already-terminal jobs.
    pub fn cancel(&self, id: Uuid) -> bool {
        let Ok(mut registry) = self.registry.write() else {
            return false;
        };
        let Some(entry) = registry.get_mut(&id) else {
            return false;
        };

        if entry.snapshot.state.is_terminal() {
            return false;
        }

        entry.cancel.store(true, Ordering::SeqCst);

        if entry.snapshot.state == JobState::Queued {
            entry.snapshot.state = JobState::Cancelled;
            entry.snapshot.finished_at = Some(Utc::now());
            info!(job = %id, "Cancelled queued job");
        } else {
            info!(job = %id, state = entry.snapshot.state.label(), "Cancellation requested");
        }

        true
    }

    /// Poll until the job reaches a terminal state
    pub async fn wait(&self, id: Uuid) -> Option<JobSnapshot> {
        loop {
            let snapshot = self.status(id)?;
            if snapshot.is_terminal() {
                return Some(snapshot);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

/// Publish a state transition. Never moves a job backwards or out of a
/// terminal state; returns false when the job is terminal (cancelled under
/// us) so the worker can stop.
fn advance_state(registry: &Registry, id: Uuid, state: JobState) -> bool {
    let Ok(mut reg) = registry.write() else {
        return false;
    };
    let Some(entry) = reg.get_mut(&id) else {
        return false;
    };

    if entry.snapshot.state.is_terminal() {
        return false;
    }
    if state > entry.snapshot.state {
        entry.snapshot.state = state;
        entry.snapshot.progress = entry.snapshot.progress.max(stage_floor(state));
    }
    true
}

fn set_progress(registry: &Registry, id: Uuid, progress: f32) {
    if let Ok(mut reg) = registry.write() {
        if let Some(entry) = reg.get_mut(&id) {
            if !entry.snapshot.state.is_terminal() {
                entry.snapshot.progress = entry.snapshot.progress.max(progress.clamp(0.0, 1.0));
            }
        }
    }
}

fn fail_job(registry: &Registry, id: Uuid, failure: JobFailure) {
    if let Ok(mut reg) = registry.write() {
        if let Some(entry) = reg.get_mut(&id) {
            if entry.snapshot.state.is_terminal() {
                return;
            }
            error!(job = %id, stage = failure.stage.label(), kind = %failure.kind, "Job failed");
            entry.snapshot.state = JobState::Failed;
            entry.snapshot.progress = 1.0;
            entry.snapshot.finished_at = Some(Utc::now());
            entry.snapshot.error = Some(failure);
        }
    }
}

fn complete_job(registry: &Registry, id: Uuid, output: JobOutput) {
    if let Ok(mut reg) = registry.write() {
        if let Some(entry) = reg.get_mut(&id) {
            if entry.snapshot.state.is_terminal() {
                return;
            }
            info!(job = %id, "Job completed");
            entry.snapshot.state = JobState::Completed;
            entry.snapshot.progress = 1.0;
            entry.snapshot.finished_at = Some(Utc::now());
            entry.snapshot.output = Some(output);
        }
    }
}

fn cancel_job(registry: &Registry, id: Uuid) {
    if let Ok(mut reg) = registry.write() {
        if let Some(entry) = reg.get_mut(&id) {
            if entry.snapshot.state.is_terminal() {
                return;
            }
            info!(job = %id, "Job cancelled");
            entry.snapshot.state = JobState::Cancelled;
            entry.snapshot.finished_at = Some(Utc::now());
        }
    }
}

/// Drive one job through every stage.
///
/// The downloaded asset and segmented chunks live on this stack, so every
/// return path (including cancellation) drops and deletes them.
#[instrument(skip(stages, registry))]
async fn run_job(stages: &dyn PipelineStages, registry: &Registry, id: Uuid) {
    let (locator, options, cancel) = {
        let Ok(reg) = registry.read() else { return };
        let Some(entry) = reg.get(&id) else {
            warn!(job = %id, "Dequeued unknown job");
            return;
        };
        if entry.snapshot.state.is_terminal() {
            // Cancelled while still queued
            return;
        }
        (
            entry.snapshot.locator.clone(),
            entry.snapshot.options.clone(),
            Arc::clone(&entry.cancel),
        )
    };

    let cancelled = || cancel.load(Ordering::SeqCst);

    if cancelled() {
        cancel_job(registry, id);
        return;
    }

    // Resolve
    if !advance_state(registry, id, JobState::Resolving) {
        return;
    }
    let resolved = match stages.resolve(&locator).await {
        Ok(resolved) => resolved,
        Err(e) => {
            fail_job(
                registry,
                id,
                JobFailure::new(JobState::Resolving, "resolution_failed", e.to_string()),
            );
            return;
        }
    };

    if cancelled() {
        cancel_job(registry, id);
        return;
    }

    // Download
    if !advance_state(registry, id, JobState::Downloading) {
        return;
    }
    let progress_registry = Arc::clone(registry);
    let progress = move |bytes: u64, total: Option<u64>| {
        if let Some(total) = total.filter(|&t| t > 0) {
            let (lo, hi) = DOWNLOAD_WINDOW;
            let fraction = (bytes as f64 / total as f64).min(1.0) as f32;
            set_progress(&progress_registry, id, lo + (hi - lo) * fraction);
        }
    };
    let asset = match stages.fetch(&locator, resolved.as_ref(), &progress).await {
        Ok(asset) => asset,
        Err(e) => {
            let kind = match &e {
                DownloadError::SizeExceeded { .. } => "size_exceeded",
                DownloadError::UnsupportedType(_) => "unsupported_type",
                _ => "download_failed",
            };
            fail_job(
                registry,
                id,
                JobFailure::new(JobState::Downloading, kind, e.to_string()),
            );
            return;
        }
    };

    if cancelled() {
        cancel_job(registry, id);
        return;
    }

    // Segment
    if !advance_state(registry, id, JobState::Segmenting) {
        return;
    }
    let segmented = match stages.segment(asset.path()).await {
        Ok(segmented) => segmented,
        Err(e) => {
            fail_job(
                registry,
                id,
                JobFailure::new(JobState::Segmenting, "segmentation_failed", e.to_string()),
            );
            return;
        }
    };

    if cancelled() {
        cancel_job(registry, id);
        return;
    }

    // Transcribe
    if !advance_state(registry, id, JobState::Transcribing) {
        return;
    }
    let transcript = match stages.transcribe(&segmented).await {
        Ok(transcript) => transcript,
        Err(e) => {
            let kind = match &e {
                TranscriptionError::ChunkExhausted { .. } => "transcription_exhausted",
                _ => "transcription_failed",
            };
            fail_job(
                registry,
                id,
                JobFailure::new(JobState::Transcribing, kind, e.to_string()),
            );
            return;
        }
    };

    if cancelled() {
        cancel_job(registry, id);
        return;
    }

    // Analyze
    if !advance_state(registry, id, JobState::Analyzing) {
        return;
    }
    let analysis = match stages.analyze(&transcript, options.summary_detail).await {
        Ok(analysis) => analysis,
        Err(e) => {
            let kind = match &e {
                AnalysisError::EmptyTranscript => "empty_transcript",
                _ => "analysis_failed",
            };
            fail_job(
                registry,
                id,
                JobFailure::new(JobState::Analyzing, kind, e.to_string()),
            );
            return;
        }
    };

    complete_job(
        registry,
        id,
        JobOutput {
            transcript,
            analysis,
        },
    );
}
