// Domain types shared by the classifier, cache, dispatcher and sink

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::errors::ConversionError;

pub type PostId = i64;

/// A post as supplied by the ingestion side. Read-only inside the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPost {
    pub id: PostId,
    /// Markdown body; ingestion stores it under `summary`
    #[serde(default, alias = "summary")]
    pub text: String,
    #[serde(default)]
    pub title: Option<String>,
}

impl RawPost {
    pub fn new(id: PostId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            title: None,
        }
    }

    /// Body text, falling back to the title when the body is blank.
    pub fn content(&self) -> &str {
        if !self.text.trim().is_empty() {
            return &self.text;
        }
        self.title.as_deref().unwrap_or("")
    }
}

/// Whether the vision API can consume an image by URL as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatClass {
    Standard,
    NonStandard,
}

/// Image data as handed to the vision model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    /// Directly fetchable by the model provider
    UrlRef(String),
    /// Locally converted image, base64 text of the encoded bytes
    EncodedBlob { media_type: String, data: Arc<str> },
}

impl ImagePayload {
    /// URL form accepted by OpenAI-compatible `image_url` parts.
    pub fn to_request_url(&self) -> String {
        match self {
            ImagePayload::UrlRef(url) => url.clone(),
            ImagePayload::EncodedBlob { media_type, data } => {
                format!("data:{};base64,{}", media_type, data)
            }
        }
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, ImagePayload::EncodedBlob { .. })
    }
}

/// Lifecycle of a single image reference. Only forward moves are legal:
/// Pending -> InFlight -> Ready | Failed, or Pending -> Ready | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageState {
    Pending,
    InFlight,
    Ready,
    Failed,
}

impl ImageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ImageState::Ready | ImageState::Failed)
    }

    pub fn can_advance_to(self, next: ImageState) -> bool {
        use ImageState::*;
        matches!(
            (self, next),
            (Pending, InFlight) | (Pending, Ready) | (Pending, Failed) | (InFlight, Ready)
                | (InFlight, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal image state transition {from:?} -> {to:?}")]
pub struct StateTransitionError {
    pub from: ImageState,
    pub to: ImageState,
}

/// One embedded image of a post
#[derive(Debug, Clone, PartialEq)]
pub struct ImageReference {
    pub original_url: String,
    /// scheme + host + path; cache key and dedup identity
    pub normalized_url: String,
    pub format: FormatClass,
    pub payload: Option<ImagePayload>,
    pub state: ImageState,
    pub failure: Option<ConversionError>,
}

impl ImageReference {
    /// Standard formats are usable by URL, so they start out Ready.
    pub fn standard(original_url: String, normalized_url: String) -> Self {
        let payload = ImagePayload::UrlRef(normalized_url.clone());
        Self {
            original_url,
            normalized_url,
            format: FormatClass::Standard,
            payload: Some(payload),
            state: ImageState::Ready,
            failure: None,
        }
    }

    pub fn pending(original_url: String, normalized_url: String) -> Self {
        Self {
            original_url,
            normalized_url,
            format: FormatClass::NonStandard,
            payload: None,
            state: ImageState::Pending,
            failure: None,
        }
    }

    fn advance(&mut self, next: ImageState) -> Result<(), StateTransitionError> {
        if !self.state.can_advance_to(next) {
            return Err(StateTransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn mark_in_flight(&mut self) -> Result<(), StateTransitionError> {
        self.advance(ImageState::InFlight)
    }

    /// Apply a conversion outcome. Fails if the reference already settled.
    pub fn resolve(
        &mut self,
        outcome: Result<ImagePayload, ConversionError>,
    ) -> Result<(), StateTransitionError> {
        match outcome {
            Ok(payload) => {
                self.advance(ImageState::Ready)?;
                self.payload = Some(payload);
            }
            Err(error) => {
                self.advance(ImageState::Failed)?;
                self.failure = Some(error);
            }
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state == ImageState::Ready && self.payload.is_some()
    }
}

/// Initial routing decision for a post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bucket {
    TextOnly,
    ImageReady,
    ImagePending,
}

/// A post together with its classification
#[derive(Debug, Clone)]
pub struct ClassifiedPost {
    pub post: RawPost,
    pub bucket: Bucket,
    pub images: Vec<ImageReference>,
}

impl ClassifiedPost {
    /// Distinct normalized URLs that still need background conversion.
    pub fn pending_urls(&self) -> impl Iterator<Item = &str> {
        self.images
            .iter()
            .filter(|r| r.format == FormatClass::NonStandard)
            .map(|r| r.normalized_url.as_str())
    }

    pub fn ready_payloads(&self) -> Vec<ImagePayload> {
        self.images
            .iter()
            .filter(|r| r.is_ready())
            .filter_map(|r| r.payload.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpretationStatus {
    Success,
    Failed,
}

/// Why a post ended without an interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Neither body nor title carried any text
    EmptyPost,
    /// Text-only post whose text call failed
    TextFailed,
    /// Vision call failed, then the text fallback failed too (API outage signal)
    VisionAndTextFailed,
    /// No image survived conversion and the text call failed (content screening signal)
    NoImageData,
    /// The post's worker died before producing an outcome
    WorkerCrashed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::EmptyPost => "post has no text content",
            FailureReason::TextFailed => "text model failed",
            FailureReason::VisionAndTextFailed => "vision failed, text fallback also failed",
            FailureReason::NoImageData => "vision failed, no image data available",
            FailureReason::WorkerCrashed => "worker crashed before producing an outcome",
        };
        f.write_str(s)
    }
}

/// The result of processing one post, before it is stamped and stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interpretation {
    pub text: String,
    pub model_name: String,
    pub status: InterpretationStatus,
    /// Produced from text alone although the post carried images
    pub downgraded: bool,
    pub failure_reason: Option<FailureReason>,
}

impl Interpretation {
    pub fn success(text: String, model_name: &str) -> Self {
        Self {
            text,
            model_name: model_name.to_string(),
            status: InterpretationStatus::Success,
            downgraded: false,
            failure_reason: None,
        }
    }

    pub fn downgraded(text: String, model_name: &str) -> Self {
        Self {
            downgraded: true,
            ..Self::success(text, model_name)
        }
    }

    pub fn failed(reason: FailureReason, detail: &str, model_name: &str) -> Self {
        Self {
            text: format!("{}: {}", reason, detail),
            model_name: model_name.to_string(),
            status: InterpretationStatus::Failed,
            downgraded: false,
            failure_reason: Some(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == InterpretationStatus::Success
    }
}

/// Stored interpretation; exactly one live record per post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpretationRecord {
    pub post_id: PostId,
    pub text: String,
    pub model_name: String,
    pub status: InterpretationStatus,
    #[serde(default)]
    pub downgraded: bool,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
}

impl InterpretationRecord {
    pub fn new(post_id: PostId, interpretation: Interpretation) -> Self {
        Self {
            post_id,
            text: interpretation.text,
            model_name: interpretation.model_name,
            status: interpretation.status,
            downgraded: interpretation.downgraded,
            failure_reason: interpretation.failure_reason,
            created_at: Utc::now(),
        }
    }
}

/// Counts returned by one enrichment run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchRunStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub text_only: usize,
    pub image_ready: usize,
    pub image_pending: usize,
    pub vision_success: usize,
    pub vision_failed: usize,
    pub text_success: usize,
    pub text_failed: usize,
    pub downgraded: usize,
    pub redirected_to_text: usize,
    pub images_dropped: usize,
    pub conversions_ready: usize,
    pub conversions_failed: usize,
    pub cache_wait_timeouts: usize,
    pub elapsed_ms: u64,
}

/// Lock-free counters behind `BatchRunStats`, shared by all workers of a run
#[derive(Debug, Default)]
pub struct RunCounters {
    pub success: AtomicUsize,
    pub failed: AtomicUsize,
    pub vision_success: AtomicUsize,
    pub vision_failed: AtomicUsize,
    pub text_success: AtomicUsize,
    pub text_failed: AtomicUsize,
    pub downgraded: AtomicUsize,
    pub redirected_to_text: AtomicUsize,
    pub cache_wait_timeouts: AtomicUsize,
}

impl RunCounters {
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, interpretation: &Interpretation) {
        if interpretation.is_success() {
            Self::incr(&self.success);
            if interpretation.downgraded {
                Self::incr(&self.downgraded);
            }
        } else {
            Self::incr(&self.failed);
        }
    }

    pub fn completed(&self) -> usize {
        self.success.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed)
    }

    /// Copy counter values into `stats`; classification and conversion counts
    /// are set by the caller.
    pub fn fill(&self, stats: &mut BatchRunStats) {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        stats.success = load(&self.success);
        stats.failed = load(&self.failed);
        stats.vision_success = load(&self.vision_success);
        stats.vision_failed = load(&self.vision_failed);
        stats.text_success = load(&self.text_success);
        stats.text_failed = load(&self.text_failed);
        stats.downgraded = load(&self.downgraded);
        stats.redirected_to_text = load(&self.redirected_to_text);
        stats.cache_wait_timeouts = load(&self.cache_wait_timeouts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webp_ref() -> ImageReference {
        ImageReference::pending(
            "https://cdn.example.com/a.webp?x=1".to_string(),
            "https://cdn.example.com/a.webp".to_string(),
        )
    }

    #[test]
    fn test_content_falls_back_to_title() {
        let mut post = RawPost::new(1, "   ");
        post.title = Some("headline".to_string());
        assert_eq!(post.content(), "headline");

        let post = RawPost::new(2, "body");
        assert_eq!(post.content(), "body");
    }

    #[test]
    fn test_raw_post_accepts_summary_field() {
        let post: RawPost =
            serde_json::from_str(r#"{"id": 7, "summary": "hi", "title": null}"#).unwrap();
        assert_eq!(post.text, "hi");
    }

    #[test]
    fn test_standard_reference_starts_ready() {
        let r = ImageReference::standard(
            "https://cdn.example.com/a.jpg".to_string(),
            "https://cdn.example.com/a.jpg".to_string(),
        );
        assert_eq!(r.state, ImageState::Ready);
        assert_eq!(
            r.payload,
            Some(ImagePayload::UrlRef("https://cdn.example.com/a.jpg".to_string()))
        );
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        let mut r = webp_ref();
        r.mark_in_flight().unwrap();
        r.resolve(Ok(ImagePayload::EncodedBlob {
            media_type: "image/jpeg".to_string(),
            data: Arc::from("AAAA"),
        }))
        .unwrap();
        assert_eq!(r.state, ImageState::Ready);

        // Settled references never move again
        assert!(r.mark_in_flight().is_err());
        assert!(r.resolve(Err(ConversionError::Abandoned)).is_err());
        assert_eq!(r.state, ImageState::Ready);
        assert!(r.failure.is_none());
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut r = webp_ref();
        r.resolve(Err(ConversionError::HttpStatus(404))).unwrap();
        assert_eq!(r.state, ImageState::Failed);
        assert!(!r.is_ready());
        assert!(r
            .resolve(Ok(ImagePayload::UrlRef("x".to_string())))
            .is_err());
        assert_eq!(r.failure, Some(ConversionError::HttpStatus(404)));
    }

    #[test]
    fn test_blob_request_url_is_data_url() {
        let payload = ImagePayload::EncodedBlob {
            media_type: "image/jpeg".to_string(),
            data: Arc::from("QUJD"),
        };
        assert_eq!(payload.to_request_url(), "data:image/jpeg;base64,QUJD");
        assert!(payload.is_blob());
    }

    #[test]
    fn test_failure_reasons_render_distinctly() {
        let outage = Interpretation::failed(FailureReason::VisionAndTextFailed, "503", "gpt");
        let screening = Interpretation::failed(FailureReason::NoImageData, "503", "gpt");
        assert_ne!(outage.text, screening.text);
        assert!(outage.text.starts_with("vision failed, text fallback also failed"));
        assert_eq!(
            serde_json::to_string(&FailureReason::NoImageData).unwrap(),
            "\"no_image_data\""
        );
    }

    #[test]
    fn test_counters_fill_stats() {
        let counters = RunCounters::default();
        counters.record_outcome(&Interpretation::downgraded("t".to_string(), "m"));
        counters.record_outcome(&Interpretation::failed(FailureReason::TextFailed, "e", "m"));

        let mut stats = BatchRunStats::default();
        counters.fill(&mut stats);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.downgraded, 1);
        assert_eq!(counters.completed(), 2);
    }
}
