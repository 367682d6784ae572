use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::core::config::Config;
use crate::core::errors::{ModelError, ModelResult};
use crate::core::types::ImagePayload;
use crate::services::llm::{text_prompt, vision_prompt, ModelClient, ModelReply};

/// Two independently bounded model-calling pools.
///
/// A permit is held only for the duration of one model call, so a post that
/// falls back from vision to text releases its vision slot before queueing
/// for a text slot. Saturating one pool never blocks the other.
pub struct DualDispatcher {
    client: Arc<dyn ModelClient>,
    vision_pool: Arc<Semaphore>,
    text_pool: Arc<Semaphore>,
    max_images: usize,
}

impl DualDispatcher {
    pub fn new(
        client: Arc<dyn ModelClient>,
        vision_workers: usize,
        text_workers: usize,
        max_images: usize,
    ) -> Self {
        Self {
            client,
            vision_pool: Arc::new(Semaphore::new(vision_workers.max(1))),
            text_pool: Arc::new(Semaphore::new(text_workers.max(1))),
            max_images,
        }
    }

    pub fn from_config(client: Arc<dyn ModelClient>, config: &Config) -> Self {
        Self::new(
            client,
            config.workers.vision_workers,
            config.workers.text_workers,
            config.max_images_per_call(),
        )
    }

    pub fn vision_model(&self) -> &str {
        self.client.vision_model()
    }

    pub fn text_model(&self) -> &str {
        self.client.text_model()
    }

    /// Interpret text plus images on the vision pool.
    pub async fn dispatch_vision(
        &self,
        post_text: &str,
        images: &[ImagePayload],
    ) -> ModelResult<ModelReply> {
        let _permit = self
            .vision_pool
            .acquire()
            .await
            .map_err(|_| ModelError::PoolClosed)?;
        debug!("Vision dispatch with {} images", images.len());
        self.client
            .call_vision(&vision_prompt(post_text), images, self.max_images)
            .await
    }

    /// Interpret raw text on the text pool.
    pub async fn dispatch_text(&self, post_text: &str) -> ModelResult<ModelReply> {
        let _permit = self
            .text_pool
            .acquire()
            .await
            .map_err(|_| ModelError::PoolClosed)?;
        self.client.call_text(&text_prompt(post_text)).await
    }

    pub fn vision_slots_free(&self) -> usize {
        self.vision_pool.available_permits()
    }

    pub fn text_slots_free(&self) -> usize {
        self.text_pool.available_permits()
    }
}
