// Error types for the enrichment pipeline
//
// Every per-post failure is converted into one of these typed values at its
// component boundary. Only `PipelineError` ever reaches the caller of a run.

use thiserror::Error;

/// Why an image could not be turned into a usable payload.
///
/// Cloneable because one outcome is shared by every post that references the
/// same normalized URL.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("invalid image url: {0}")]
    InvalidUrl(String),

    #[error("download timed out after {0}s")]
    Timeout(u64),

    #[error("image exceeds size ceiling ({size} > {limit} bytes)")]
    TooLarge { size: u64, limit: u64 },

    #[error("download failed with HTTP status {0}")]
    HttpStatus(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("image decode failed: {0}")]
    Decode(String),

    #[error("image encode failed: {0}")]
    Encode(String),

    #[error("gave up after {0}s waiting for a conversion in flight")]
    WaitTimedOut(u64),

    #[error("conversion abandoned before it published a result")]
    Abandoned,
}

impl ConversionError {
    /// True when the runtime lacks a decoder for the source format, as opposed
    /// to a corrupt or truncated file.
    pub fn is_unsupported_format(&self) -> bool {
        matches!(self, ConversionError::UnsupportedFormat(_))
    }

    /// Failures that happened before any bytes were decoded.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ConversionError::Timeout(_)
                | ConversionError::TooLarge { .. }
                | ConversionError::HttpStatus(_)
                | ConversionError::Transport(_)
        )
    }
}

/// Model API errors
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("circuit breaker is open, model API is unavailable")]
    CircuitOpen,

    #[error("model request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("invalid model response: {0}")]
    InvalidResponse(String),

    #[error("vision call without any image payloads")]
    NoImages,

    #[error("model rejected image input: {0}")]
    BadImageInput(String),

    #[error("model worker pool is closed")]
    PoolClosed,
}

/// Persistence and post-source errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Run-level errors. Per-post problems never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not obtain the unprocessed post batch: {0}")]
    SourceUnavailable(#[source] StoreError),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be > 0, got {value}")]
    ZeroValue { name: &'static str, value: u64 },

    #[error("{name} must be <= {limit}, got {value}")]
    AboveLimit {
        name: &'static str,
        value: u64,
        limit: u64,
    },

    #[error("JPEG quality must be in [1, 100], got {0}")]
    InvalidJpegQuality(u8),

    #[error("invalid model API base url: {0}")]
    InvalidBaseUrl(String),

    #[error("environment variable {name} could not be parsed: {value}")]
    EnvVarError { name: &'static str, value: String },
}

pub type ConversionResult<T> = Result<T, ConversionError>;
pub type ModelResult<T> = Result<T, ModelError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
