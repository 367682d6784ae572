pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{ConfigError, ConversionError, ModelError, PipelineError, StoreError};
pub use types::{
    BatchRunStats, Bucket, ClassifiedPost, FailureReason, FormatClass, ImagePayload,
    ImageReference, ImageState, Interpretation, InterpretationRecord, InterpretationStatus,
    PostId, RawPost,
};
