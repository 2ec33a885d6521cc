//! Pipeline core: resolution, fetching, segmentation, transcription,
//! analysis and the job manager that drives them.

pub mod analyzer;
pub mod fetcher;
pub mod manager;
pub mod resolver;
pub mod retry;
pub mod segmenter;
pub mod transcriber;

pub use analyzer::{AnalysisEngine, AnalysisError};
pub use fetcher::{ContentFetcher, DownloadError, DownloadedAsset, MediaKind};
pub use manager::{JobManager, MediaPipeline, PipelineStages};
pub use resolver::{LinkResolver, ResolutionError, ResolvedUrl};
pub use retry::RetryPolicy;
pub use segmenter::{AudioSegmenter, ChunkLimits, SegmentationError, SegmentedAudio};
pub use transcriber::{TranscriptionCoordinator, TranscriptionError};
