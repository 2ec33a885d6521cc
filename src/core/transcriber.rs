//! Parallel chunk transcription.
//!
//! Chunks go out concurrently under a semaphore, each with its own retry
//! budget, and the results merge strictly by chunk index regardless of
//! completion order.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::adapters::{ServiceError, SpeechToText};
use crate::core::retry::RetryPolicy;
use crate::core::segmenter::SegmentedAudio;
use crate::domain::{MergedTranscript, TranscriptSegment};

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("chunk {chunk} failed after {attempts} attempts: {reason}")]
    ChunkExhausted {
        chunk: usize,
        attempts: u32,
        reason: String,
    },

    #[error("chunk {chunk} failed: {reason}")]
    ChunkFatal { chunk: usize, reason: String },

    #[error("transcription task panicked: {0}")]
    TaskPanic(String),
}

/// Fans chunk transcription out to the speech-to-text service
pub struct TranscriptionCoordinator {
    service: Arc<dyn SpeechToText>,
    retry: RetryPolicy,
    max_parallel: usize,
}

impl TranscriptionCoordinator {
    pub fn new(service: Arc<dyn SpeechToText>, retry: RetryPolicy, max_parallel: usize) -> Self {
        Self {
            service,
            retry,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Transcribe every chunk and merge into one transcript.
    ///
    /// Any chunk exhausting its retries fails the whole transcription; a
    /// partial transcript is never returned.
    #[instrument(skip(self, audio), fields(chunks = audio.chunks.len()))]
    pub async fn transcribe(
        &self,
        audio: &SegmentedAudio,
    ) -> Result<MergedTranscript, TranscriptionError> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut handles = Vec::with_capacity(audio.chunks.len());

        for chunk in &audio.chunks {
            let service = Arc::clone(&self.service);
            let retry = self.retry.clone();
            let semaphore = Arc::clone(&semaphore);
            let index = chunk.index;
            let start_secs = chunk.start_secs;
            let duration_secs = chunk.duration_secs;
            let path = chunk.path.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| TranscriptionError::TaskPanic(e.to_string()))?;

                let text = transcribe_chunk(service.as_ref(), &retry, index, &path).await?;
                debug!(chunk = index, chars = text.len(), "Chunk transcribed");

                Ok::<_, TranscriptionError>(TranscriptSegment {
                    chunk_index: index,
                    text,
                    start_secs,
                    duration_secs,
                })
            }));
        }

        let mut segments = Vec::with_capacity(handles.len());
        let mut failure: Option<TranscriptionError> = None;

        for handle in handles {
            match handle.await {
                Ok(Ok(segment)) => segments.push(segment),
                Ok(Err(e)) => failure = Some(failure.take().unwrap_or(e)),
                Err(e) => {
                    failure =
                        Some(failure.take().unwrap_or(TranscriptionError::TaskPanic(e.to_string())))
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        Ok(MergedTranscript::from_segments(segments))
    }
}

async fn transcribe_chunk(
    service: &dyn SpeechToText,
    retry: &RetryPolicy,
    index: usize,
    path: &std::path::Path,
) -> Result<String, TranscriptionError> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match service.transcribe(path).await {
            Ok(text) => return Ok(text),
            Err(e @ ServiceError::Transient(_)) if retry.should_retry(attempt) => {
                warn!(chunk = index, attempt, error = %e, "Chunk transcription failed, retrying");
                retry.wait(attempt).await;
            }
            Err(ServiceError::Transient(reason)) => {
                return Err(TranscriptionError::ChunkExhausted {
                    chunk: index,
                    attempts: attempt,
                    reason,
                });
            }
            Err(ServiceError::Fatal(reason)) => {
                return Err(TranscriptionError::ChunkFatal {
                    chunk: index,
                    reason,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::domain::AudioChunk;

    fn fake_audio(chunks: usize) -> SegmentedAudio {
        SegmentedAudio::from_chunks(
            (0..chunks)
                .map(|i| AudioChunk {
                    index: i,
                    start_secs: i as f64 * 60.0,
                    duration_secs: 60.0,
                    path: PathBuf::from(format!("/tmp/chunk-{}.mp3", i)),
                })
                .collect(),
            chunks as f64 * 60.0,
        )
    }

    /// Answers slower for earlier chunks so completion order is reversed
    struct ReversedService;

    #[async_trait]
    impl SpeechToText for ReversedService {
        async fn transcribe(&self, audio: &Path) -> Result<String, ServiceError> {
            let name = audio.file_stem().unwrap().to_string_lossy().to_string();
            let index: u64 = name.trim_start_matches("chunk-").parse().unwrap();
            tokio::time::sleep(Duration::from_millis(30u64.saturating_sub(index * 10))).await;
            Ok(format!("segment {}", index))
        }
    }

    struct FlakyService {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl SpeechToText for FlakyService {
        async fn transcribe(&self, _audio: &Path) -> Result<String, ServiceError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                Err(ServiceError::Transient("503".to_string()))
            } else {
                Ok("recovered".to_string())
            }
        }
    }

    struct DoomedChunkService {
        doomed: usize,
    }

    #[async_trait]
    impl SpeechToText for DoomedChunkService {
        async fn transcribe(&self, audio: &Path) -> Result<String, ServiceError> {
            if audio.to_string_lossy().contains(&format!("chunk-{}", self.doomed)) {
                Err(ServiceError::Transient("always down".to_string()))
            } else {
                Ok("ok".to_string())
            }
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 1.0,
        }
    }

    #[tokio::test]
    async fn test_merge_order_is_by_index_not_completion() {
        let coordinator =
            TranscriptionCoordinator::new(Arc::new(ReversedService), fast_retry(1), 4);
        let transcript = coordinator.transcribe(&fake_audio(3)).await.unwrap();

        let text = &transcript.text;
        let p0 = text.find("segment 0").unwrap();
        let p1 = text.find("segment 1").unwrap();
        let p2 = text.find("segment 2").unwrap();
        assert!(p0 < p1 && p1 < p2);
    }

    #[tokio::test]
    async fn test_transient_failures_recover() {
        let service = Arc::new(FlakyService {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let coordinator = TranscriptionCoordinator::new(service, fast_retry(3), 1);
        let transcript = coordinator.transcribe(&fake_audio(2)).await.unwrap();
        assert!(transcript.text.contains("recovered"));
    }

    #[tokio::test]
    async fn test_exhausted_chunk_fails_the_job() {
        let coordinator = TranscriptionCoordinator::new(
            Arc::new(DoomedChunkService { doomed: 2 }),
            fast_retry(3),
            4,
        );
        let err = coordinator.transcribe(&fake_audio(4)).await.unwrap_err();
        match err {
            TranscriptionError::ChunkExhausted { chunk, attempts, .. } => {
                assert_eq!(chunk, 2);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        struct CountingService {
            active: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl SpeechToText for CountingService {
            async fn transcribe(&self, _audio: &Path) -> Result<String, ServiceError> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok("x".to_string())
            }
        }

        let service = Arc::new(CountingService {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let coordinator = TranscriptionCoordinator::new(service.clone(), fast_retry(1), 2);
        coordinator.transcribe(&fake_audio(6)).await.unwrap();
        assert!(service.peak.load(Ordering::SeqCst) <= 2);
    }
}
