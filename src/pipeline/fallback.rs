use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::types::{FailureReason, ImagePayload, Interpretation, RawPost, RunCounters};
use crate::pipeline::dispatcher::DualDispatcher;

/// Per-post outcome logic on top of the dispatcher.
///
/// Runs inline in the worker that owns the post. The vision attempt always
/// finishes before any text attempt starts.
pub struct FallbackController {
    dispatcher: Arc<DualDispatcher>,
    counters: Arc<RunCounters>,
}

impl FallbackController {
    pub fn new(dispatcher: Arc<DualDispatcher>, counters: Arc<RunCounters>) -> Self {
        Self {
            dispatcher,
            counters,
        }
    }

    /// Text-only post: one text attempt.
    pub async fn interpret_text(&self, post: &RawPost) -> Interpretation {
        let text = post.content();
        if text.trim().is_empty() {
            return self.empty_post(post);
        }

        match self.dispatcher.dispatch_text(text).await {
            Ok(reply) => {
                RunCounters::incr(&self.counters.text_success);
                Interpretation::success(reply.content, &reply.model)
            }
            Err(e) => {
                RunCounters::incr(&self.counters.text_failed);
                warn!("Text interpretation failed for post {}: {}", post.id, e);
                Interpretation::failed(
                    FailureReason::TextFailed,
                    &e.to_string(),
                    self.dispatcher.text_model(),
                )
            }
        }
    }

    /// Post that carried images. `images` holds whatever survived conversion;
    /// when it is empty the post goes straight to text as a downgrade.
    pub async fn interpret_with_images(
        &self,
        post: &RawPost,
        images: &[ImagePayload],
    ) -> Interpretation {
        let text = post.content();
        if text.trim().is_empty() {
            return self.empty_post(post);
        }

        if images.is_empty() {
            RunCounters::incr(&self.counters.redirected_to_text);
            debug!("Post {} has no usable images, redirecting to text", post.id);
            return self.downgrade(post, FailureReason::NoImageData, None).await;
        }

        match self.dispatcher.dispatch_vision(text, images).await {
            Ok(reply) => {
                RunCounters::incr(&self.counters.vision_success);
                Interpretation::success(reply.content, &reply.model)
            }
            Err(e) => {
                RunCounters::incr(&self.counters.vision_failed);
                warn!(
                    "Vision interpretation failed for post {}: {}. Falling back to text",
                    post.id, e
                );
                self.downgrade(post, FailureReason::VisionAndTextFailed, Some(e.to_string()))
                    .await
            }
        }
    }

    /// Text attempt standing in for a vision reading. Success is tagged as
    /// downgraded; failure is terminal with `reason`.
    async fn downgrade(
        &self,
        post: &RawPost,
        reason: FailureReason,
        vision_error: Option<String>,
    ) -> Interpretation {
        match self.dispatcher.dispatch_text(post.content()).await {
            Ok(reply) => {
                RunCounters::incr(&self.counters.text_success);
                Interpretation::downgraded(reply.content, &reply.model)
            }
            Err(e) => {
                RunCounters::incr(&self.counters.text_failed);
                let detail = match vision_error {
                    Some(vision) => format!("vision: {}; text: {}", vision, e),
                    None => format!("text: {}", e),
                };
                warn!("Post {} failed terminally: {} ({})", post.id, reason, detail);
                Interpretation::failed(reason, &detail, self.dispatcher.text_model())
            }
        }
    }

    fn empty_post(&self, post: &RawPost) -> Interpretation {
        debug!("Post {} has no text content", post.id);
        Interpretation::failed(
            FailureReason::EmptyPost,
            "no body or title",
            self.dispatcher.text_model(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{ModelError, ModelResult};
    use crate::core::types::InterpretationStatus;
    use crate::services::llm::{ModelClient, ModelReply};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;

    /// Records the order of calls; fails whichever kinds are configured to fail
    struct ScriptedModel {
        vision_ok: bool,
        text_ok: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedModel {
        fn new(vision_ok: bool, text_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                vision_ok,
                text_ok,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        fn vision_model(&self) -> &str {
            "vision-m"
        }

        fn text_model(&self) -> &str {
            "text-m"
        }

        async fn call_vision(
            &self,
            _prompt: &str,
            _images: &[ImagePayload],
            _max_images: usize,
        ) -> ModelResult<ModelReply> {
            self.calls.lock().push("vision");
            if self.vision_ok {
                Ok(ModelReply {
                    content: "full reading".to_string(),
                    model: "vision-m".to_string(),
                })
            } else {
                Err(ModelError::Status {
                    status: 503,
                    body: "down".to_string(),
                })
            }
        }

        async fn call_text(&self, _prompt: &str) -> ModelResult<ModelReply> {
            self.calls.lock().push("text");
            if self.text_ok {
                Ok(ModelReply {
                    content: "text reading".to_string(),
                    model: "text-m".to_string(),
                })
            } else {
                Err(ModelError::EmptyResponse)
            }
        }
    }

    fn controller(model: Arc<ScriptedModel>) -> (FallbackController, Arc<RunCounters>) {
        let counters = Arc::new(RunCounters::default());
        let dispatcher = Arc::new(DualDispatcher::new(model, 2, 2, 10));
        (FallbackController::new(dispatcher, counters.clone()), counters)
    }

    fn image() -> Vec<ImagePayload> {
        vec![ImagePayload::UrlRef("https://cdn.example.com/a.jpg".to_string())]
    }

    #[tokio::test]
    async fn test_vision_success_uses_vision_model() {
        let model = ScriptedModel::new(true, true);
        let (controller, counters) = controller(model.clone());

        let result = controller
            .interpret_with_images(&RawPost::new(1, "look"), &image())
            .await;
        assert_eq!(result, Interpretation::success("full reading".to_string(), "vision-m"));
        assert_eq!(*model.calls.lock(), vec!["vision"]);
        assert_eq!(counters.vision_success.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_vision_failure_downgrades_to_text() {
        let model = ScriptedModel::new(false, true);
        let (controller, counters) = controller(model.clone());

        let result = controller
            .interpret_with_images(&RawPost::new(1, "look"), &image())
            .await;
        assert!(result.is_success());
        assert!(result.downgraded);
        assert_eq!(result.model_name, "text-m");
        assert_eq!(*model.calls.lock(), vec!["vision", "text"]);
        assert_eq!(counters.vision_failed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.text_success.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_both_failing_is_an_outage_signal() {
        let model = ScriptedModel::new(false, false);
        let (controller, _) = controller(model);

        let result = controller
            .interpret_with_images(&RawPost::new(1, "look"), &image())
            .await;
        assert_eq!(result.status, InterpretationStatus::Failed);
        assert_eq!(result.failure_reason, Some(FailureReason::VisionAndTextFailed));
        assert!(result.text.contains("vision:"));
    }

    #[tokio::test]
    async fn test_no_image_data_skips_vision() {
        let model = ScriptedModel::new(true, false);
        let (controller, counters) = controller(model.clone());

        let result = controller
            .interpret_with_images(&RawPost::new(1, "look"), &[])
            .await;
        assert_eq!(result.failure_reason, Some(FailureReason::NoImageData));
        assert_eq!(*model.calls.lock(), vec!["text"]);
        assert_eq!(counters.redirected_to_text.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_empty_post_makes_no_call() {
        let model = ScriptedModel::new(true, true);
        let (controller, _) = controller(model.clone());

        let result = controller.interpret_text(&RawPost::new(1, "  ")).await;
        assert_eq!(result.failure_reason, Some(FailureReason::EmptyPost));
        assert!(model.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_text_only_failure_reason() {
        let model = ScriptedModel::new(true, false);
        let (controller, counters) = controller(model);

        let result = controller.interpret_text(&RawPost::new(1, "hello")).await;
        assert_eq!(result.failure_reason, Some(FailureReason::TextFailed));
        assert_eq!(counters.text_failed.load(Ordering::Relaxed), 1);
    }
}
