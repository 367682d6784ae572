// Library exports for the post enrichment pipeline

pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod pipeline;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use core::{
    config::Config,
    errors::{ConfigError, ConversionError, ModelError, PipelineError, StoreError},
    types::{
        BatchRunStats, Bucket, FailureReason, ImagePayload, ImageReference, Interpretation,
        InterpretationRecord, InterpretationStatus, PostId, RawPost,
    },
};

pub use middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

pub use orchestration::EnrichmentOrchestrator;

pub use pipeline::{DualDispatcher, FallbackController, PostClassifier, ResultSink};

pub use services::{
    BackgroundConverterPool, ConvertImage, ImageConversionCache, ImageConverter,
    InterpretationStore, JsonFilePostSource, JsonFileStore, MemoryPostSource, MemoryStore,
    ModelClient, ModelReply, OpenAiClient, PostSource, StoreStats,
};

pub use utils::{Metrics, MetricsSnapshot};
