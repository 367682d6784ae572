// Enrichment orchestrator: one run over the unprocessed-post batch

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{ConversionError, PipelineError};
use crate::core::types::{
    BatchRunStats, Bucket, ClassifiedPost, FailureReason, ImageState, Interpretation, PostId,
    RunCounters,
};
use crate::pipeline::{DualDispatcher, FallbackController, PostClassifier, ResultSink};
use crate::services::images::{BackgroundConverterPool, ConvertImage, ImageConversionCache};
use crate::services::llm::ModelClient;
use crate::services::store::{InterpretationStore, PostSource};
use crate::utils::Metrics;

/// Composes classification, background conversion, dispatch and persistence.
///
/// Each run gets a fresh conversion cache, so deduplication is scoped to the
/// batch and nothing leaks between runs.
pub struct EnrichmentOrchestrator {
    source: Arc<dyn PostSource>,
    sink: ResultSink,
    dispatcher: Arc<DualDispatcher>,
    converter: Arc<dyn ConvertImage>,
    classifier: PostClassifier,
    conversion_workers: usize,
    cache_wait_timeout: Duration,
    metrics: Option<Metrics>,
}

/// State shared by the workers of one run
struct RunContext {
    fallback: FallbackController,
    pool: BackgroundConverterPool,
    sink: ResultSink,
    counters: Arc<RunCounters>,
}

impl EnrichmentOrchestrator {
    pub fn new(
        config: &Config,
        source: Arc<dyn PostSource>,
        store: Arc<dyn InterpretationStore>,
        client: Arc<dyn ModelClient>,
        converter: Arc<dyn ConvertImage>,
        metrics: Option<Metrics>,
    ) -> Self {
        info!(
            "Pools: vision={}, text={}, conversion={}",
            config.workers.vision_workers,
            config.workers.text_workers,
            config.workers.conversion_workers
        );

        Self {
            source,
            sink: ResultSink::new(store),
            dispatcher: Arc::new(DualDispatcher::from_config(client, config)),
            converter,
            classifier: PostClassifier::new(),
            conversion_workers: config.workers.conversion_workers,
            cache_wait_timeout: config.cache_wait_timeout(),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn InterpretationStore> {
        self.sink.store()
    }

    /// Process every unprocessed post created in the last `window_hours`.
    ///
    /// Per-post failures are recorded and counted; only failing to fetch the
    /// batch itself is an error.
    #[instrument(skip(self))]
    pub async fn run_enrichment(&self, window_hours: u32) -> Result<BatchRunStats, PipelineError> {
        let start = Instant::now();

        let posts = self
            .source
            .unprocessed_posts(window_hours)
            .await
            .map_err(|e| {
                error!("Could not fetch unprocessed posts: {}", e);
                PipelineError::SourceUnavailable(e)
            })?;

        let total = posts.len();
        let mut stats = BatchRunStats {
            total,
            ..Default::default()
        };
        info!("Enriching {} posts from the last {}h", total, window_hours);

        // Classify, collecting the distinct URLs that need conversion
        let mut immediate = Vec::new();
        let mut delayed = Vec::new();
        let mut pending_urls = Vec::new();
        let mut seen = HashSet::new();
        for post in posts {
            let (classified, dropped) = self.classifier.classify_post(post);
            stats.images_dropped += dropped;
            match classified.bucket {
                Bucket::TextOnly => stats.text_only += 1,
                Bucket::ImageReady => stats.image_ready += 1,
                Bucket::ImagePending => {
                    stats.image_pending += 1;
                    for url in classified.pending_urls() {
                        if seen.insert(url.to_string()) {
                            pending_urls.push(url.to_string());
                        }
                    }
                }
            }
            if classified.bucket == Bucket::ImagePending {
                delayed.push(classified);
            } else {
                immediate.push(classified);
            }
        }

        info!(
            "Classified: {} text-only, {} image-ready, {} image-pending ({} images to convert, {} references dropped)",
            stats.text_only,
            stats.image_ready,
            stats.image_pending,
            pending_urls.len(),
            stats.images_dropped
        );

        // Conversion starts before dispatch and overlaps with it
        let cache = ImageConversionCache::new(self.cache_wait_timeout, self.metrics.clone());
        let pool = BackgroundConverterPool::new(
            Arc::clone(&self.converter),
            cache.clone(),
            self.conversion_workers,
            self.metrics.clone(),
        );
        let mut background = pool.launch(pending_urls);

        let counters = Arc::new(RunCounters::default());
        let ctx = Arc::new(RunContext {
            fallback: FallbackController::new(Arc::clone(&self.dispatcher), Arc::clone(&counters)),
            pool,
            sink: self.sink.clone(),
            counters: Arc::clone(&counters),
        });

        let mut running = FuturesUnordered::new();
        for classified in immediate.into_iter().chain(delayed) {
            let post_id = classified.post.id;
            let ctx = Arc::clone(&ctx);
            let handle = tokio::spawn(async move { ctx.process_post(classified).await });
            running.push(async move { (post_id, handle.await) });
        }

        while let Some((post_id, joined)) = running.next().await {
            match joined {
                Ok((interpretation, true)) => counters.record_outcome(&interpretation),
                Ok((_, false)) => RunCounters::incr(&counters.failed),
                Err(e) => {
                    error!("Worker for post {} panicked: {}", post_id, e);
                    self.record_crash(post_id).await;
                    RunCounters::incr(&counters.failed);
                }
            }

            let done = counters.completed();
            if done % 10 == 0 || done == total {
                info!(
                    "Progress: {}/{} posts ({} ok, {} failed)",
                    done,
                    total,
                    counters.success.load(std::sync::atomic::Ordering::Relaxed),
                    counters.failed.load(std::sync::atomic::Ordering::Relaxed)
                );
            }
        }

        // Every post has an outcome; conversions still running have no consumer
        background.shutdown().await;

        counters.fill(&mut stats);
        let cache_stats = cache.stats();
        stats.conversions_ready = cache_stats.ready;
        stats.conversions_failed = cache_stats.failed;
        stats.elapsed_ms = start.elapsed().as_millis() as u64;

        if let Some(ref m) = self.metrics {
            m.record_run(&stats);
        }

        info!(
            "Run complete in {:.2}s: {} ok ({} downgraded), {} failed of {}",
            start.elapsed().as_secs_f64(),
            stats.success,
            stats.downgraded,
            stats.failed,
            stats.total
        );

        Ok(stats)
    }

    async fn record_crash(&self, post_id: PostId) {
        let interpretation = Interpretation::failed(
            FailureReason::WorkerCrashed,
            "task panicked",
            self.dispatcher.text_model(),
        );
        self.sink.record(post_id, interpretation).await;
    }
}

impl RunContext {
    /// Produce and persist the outcome of one post. Returns the outcome and
    /// whether it was stored.
    async fn process_post(&self, mut classified: ClassifiedPost) -> (Interpretation, bool) {
        let interpretation = match classified.bucket {
            Bucket::TextOnly => self.fallback.interpret_text(&classified.post).await,
            Bucket::ImageReady => {
                let images = classified.ready_payloads();
                self.fallback
                    .interpret_with_images(&classified.post, &images)
                    .await
            }
            Bucket::ImagePending => {
                self.resolve_pending(&mut classified).await;
                let images = classified.ready_payloads();
                debug!(
                    "Post {}: {}/{} images usable after conversion",
                    classified.post.id,
                    images.len(),
                    classified.images.len()
                );
                self.fallback
                    .interpret_with_images(&classified.post, &images)
                    .await
            }
        };

        let persisted = self
            .sink
            .record(classified.post.id, interpretation.clone())
            .await;
        (interpretation, persisted)
    }

    /// Wait for this post's non-standard images through the shared cache.
    async fn resolve_pending(&self, classified: &mut ClassifiedPost) {
        let post_id = classified.post.id;
        let waits = classified
            .images
            .iter_mut()
            .filter(|r| r.state == ImageState::Pending)
            .map(|reference| async move {
                if let Err(e) = reference.mark_in_flight() {
                    warn!("Post {}: {}", post_id, e);
                    return;
                }
                let outcome = self.pool.resolve(&reference.normalized_url).await;
                if matches!(outcome, Err(ConversionError::WaitTimedOut(_))) {
                    RunCounters::incr(&self.counters.cache_wait_timeouts);
                }
                if let Err(e) = reference.resolve(outcome) {
                    warn!("Post {}: {}", post_id, e);
                }
            });
        join_all(waits).await;
    }
}
