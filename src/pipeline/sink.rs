use std::sync::Arc;
use tracing::error;

use crate::core::errors::StoreResult;
use crate::core::types::{Interpretation, InterpretationRecord, PostId};
use crate::services::store::InterpretationStore;

/// Writes the single live interpretation of a post (upsert by post id).
#[derive(Clone)]
pub struct ResultSink {
    store: Arc<dyn InterpretationStore>,
}

impl ResultSink {
    pub fn new(store: Arc<dyn InterpretationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn InterpretationStore> {
        &self.store
    }

    pub async fn save(&self, post_id: PostId, interpretation: Interpretation) -> StoreResult<PostId> {
        self.store
            .save_interpretation(InterpretationRecord::new(post_id, interpretation))
            .await
    }

    /// Save and report whether the record landed. Store errors are logged
    /// here so one bad write cannot abort the batch.
    pub async fn record(&self, post_id: PostId, interpretation: Interpretation) -> bool {
        match self.save(post_id, interpretation).await {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to save interpretation for post {}: {}", post_id, e);
                false
            }
        }
    }
}
