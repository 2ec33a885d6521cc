//! Silence-aware audio segmentation.
//!
//! Long recordings are cut into chunks that tile the full duration with no
//! gaps and no overlap. Cut points prefer detected silences near the chunk
//! limit so sentences are not split mid-word; when no silence falls inside
//! the tolerance window, the cut lands exactly at the limit.

use std::path::Path;

use tempfile::TempPath;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::adapters::ffmpeg;
use crate::domain::AudioChunk;

/// How far below the chunk limit a silence may sit and still be preferred
/// over a hard cut
const SILENCE_TOLERANCE_SECS: f64 = 30.0;

/// Encoded byte rate of the 32 kbps mp3 chunks, used to translate a size
/// limit into a duration limit
const CHUNK_BYTES_PER_SEC: f64 = 4000.0;

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("cannot probe audio source: {0}")]
    SourceUnreadable(String),

    #[error("audio source is empty")]
    EmptySource,

    #[error("failed to cut chunk {index}: {reason}")]
    CutFailed { index: usize, reason: String },
}

/// Limits a single chunk must respect
#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    /// Hard ceiling on chunk duration in seconds
    pub max_duration_secs: f64,

    /// Hard ceiling on encoded chunk size in bytes
    pub max_size_bytes: u64,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_duration_secs: 20.0 * 60.0,
            max_size_bytes: 24 * 1024 * 1024,
        }
    }
}

impl ChunkLimits {
    /// The binding duration cap: whichever of the two limits is reached first
    fn effective_max_secs(&self) -> f64 {
        let size_bound = self.max_size_bytes as f64 / CHUNK_BYTES_PER_SEC;
        self.max_duration_secs.min(size_bound)
    }
}

/// The segmented form of one audio asset.
///
/// Owns the chunk temp files; they are removed when this value drops. When
/// the source fits in a single chunk no cutting happens and `chunks` points
/// straight at the source file.
#[derive(Debug)]
pub struct SegmentedAudio {
    pub chunks: Vec<AudioChunk>,
    pub total_duration_secs: f64,
    _storage: Vec<TempPath>,
}

impl SegmentedAudio {
    /// Assemble from already-cut chunks whose files the caller owns
    pub fn from_chunks(chunks: Vec<AudioChunk>, total_duration_secs: f64) -> Self {
        Self {
            chunks,
            total_duration_secs,
            _storage: Vec::new(),
        }
    }
}

/// Cuts audio assets into transcription-sized chunks
#[derive(Debug, Default)]
pub struct AudioSegmenter {
    pub limits: ChunkLimits,
}

impl AudioSegmenter {
    pub fn new(limits: ChunkLimits) -> Self {
        Self { limits }
    }

    /// Segment `source` into chunks that tile its full duration
    #[instrument(skip(self), fields(source = %source.display()))]
    pub async fn segment(&self, source: &Path) -> Result<SegmentedAudio, SegmentationError> {
        let total = ffmpeg::probe_duration(source)
            .await
            .map_err(|e| SegmentationError::SourceUnreadable(e.to_string()))?;

        if total <= 0.0 {
            return Err(SegmentationError::EmptySource);
        }

        let limit = self.limits.effective_max_secs();

        // Short recording: hand the source through untouched
        if total <= limit {
            debug!(duration_secs = total, "Source fits in a single chunk");
            return Ok(SegmentedAudio {
                chunks: vec![AudioChunk {
                    index: 0,
                    start_secs: 0.0,
                    duration_secs: total,
                    path: source.to_path_buf(),
                }],
                total_duration_secs: total,
                _storage: Vec::new(),
            });
        }

        let silences = ffmpeg::detect_silence_points(source)
            .await
            .map_err(|e| SegmentationError::SourceUnreadable(e.to_string()))?;

        let boundaries = plan_boundaries(total, &silences, limit, SILENCE_TOLERANCE_SECS);
        info!(
            duration_secs = total,
            chunks = boundaries.len(),
            silences = silences.len(),
            "Cutting audio into chunks"
        );

        let mut chunks = Vec::with_capacity(boundaries.len());
        let mut storage = Vec::with_capacity(boundaries.len());

        for (index, &(start, duration)) in boundaries.iter().enumerate() {
            let file = ffmpeg::cut_chunk(source, start, duration)
                .await
                .map_err(|e| SegmentationError::CutFailed {
                    index,
                    reason: e.to_string(),
                })?;

            let path = file.path().to_path_buf();
            storage.push(file.into_temp_path());
            chunks.push(AudioChunk {
                index,
                start_secs: start,
                duration_secs: duration,
                path,
            });
        }

        Ok(SegmentedAudio {
            chunks,
            total_duration_secs: total,
            _storage: storage,
        })
    }
}

/// Plan `(start, duration)` pairs that tile `[0, total_secs]`.
///
/// Each chunk ends at the latest silence point that falls inside
/// `[limit - tolerance, limit]` past its start, or exactly at the limit when
/// no silence qualifies. The final chunk absorbs the remainder.
pub fn plan_boundaries(
    total_secs: f64,
    silence_points: &[f64],
    max_chunk_secs: f64,
    tolerance_secs: f64,
) -> Vec<(f64, f64)> {
    let mut boundaries = Vec::new();
    let mut start = 0.0;

    while total_secs - start > max_chunk_secs {
        let hard_end = start + max_chunk_secs;
        let window_start = hard_end - tolerance_secs;

        let cut = silence_points
            .iter()
            .copied()
            .filter(|&p| p > window_start && p <= hard_end && p > start)
            .fold(None::<f64>, |best, p| match best {
                Some(b) if b >= p => Some(b),
                _ => Some(p),
            })
            .unwrap_or(hard_end);

        boundaries.push((start, cut - start));
        start = cut;
    }

    boundaries.push((start, total_secs - start));
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_tiles(boundaries: &[(f64, f64)], total: f64, max: f64) {
        let mut cursor = 0.0;
        for &(start, duration) in boundaries {
            assert!((start - cursor).abs() < 1e-9, "gap or overlap at {}", start);
            assert!(duration > 0.0);
            assert!(duration <= max + 1e-9, "chunk of {}s exceeds {}s", duration, max);
            cursor = start + duration;
        }
        assert!((cursor - total).abs() < 1e-9, "tiling ends at {} not {}", cursor, total);
    }

    #[test]
    fn test_short_audio_is_one_chunk() {
        let boundaries = plan_boundaries(100.0, &[], 600.0, 30.0);
        assert_eq!(boundaries, vec![(0.0, 100.0)]);
    }

    #[test]
    fn test_hard_cuts_without_silence() {
        let boundaries = plan_boundaries(1500.0, &[], 600.0, 30.0);
        assert_eq!(boundaries, vec![(0.0, 600.0), (600.0, 600.0), (1200.0, 300.0)]);
    }

    #[test]
    fn test_silence_inside_window_wins() {
        // 580 sits inside [570, 600]; the first cut moves there
        let boundaries = plan_boundaries(1000.0, &[580.0], 600.0, 30.0);
        assert_eq!(boundaries, vec![(0.0, 580.0), (580.0, 420.0)]);
        assert_tiles(&boundaries, 1000.0, 600.0);
    }

    #[test]
    fn test_latest_qualifying_silence_is_picked() {
        let boundaries = plan_boundaries(1000.0, &[575.0, 590.0, 650.0], 600.0, 30.0);
        assert_eq!(boundaries[0], (0.0, 590.0));
    }

    #[test]
    fn test_silence_outside_window_is_ignored() {
        // 500 is more than 30s below the 600s limit
        let boundaries = plan_boundaries(1000.0, &[500.0], 600.0, 30.0);
        assert_eq!(boundaries, vec![(0.0, 600.0), (600.0, 400.0)]);
    }

    #[test]
    fn test_long_audio_tiles_exactly() {
        let silences: Vec<f64> = (1..20).map(|i| i as f64 * 595.0).collect();
        let boundaries = plan_boundaries(7200.0, &silences, 600.0, 30.0);
        assert_tiles(&boundaries, 7200.0, 600.0);
        assert!(boundaries.len() >= 12);
    }

    #[test]
    fn test_effective_max_honors_size_bound() {
        let limits = ChunkLimits {
            max_duration_secs: 3600.0,
            max_size_bytes: 24 * 1024 * 1024,
        };
        // 24 MiB at 4000 B/s is well under an hour
        let effective = limits.effective_max_secs();
        assert!(effective < 3600.0);
        assert!((effective - 24.0 * 1024.0 * 1024.0 / 4000.0).abs() < 1e-6);
    }
}
