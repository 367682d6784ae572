use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{ConversionError, ConversionResult};
use crate::core::types::ImagePayload;
use crate::services::images::cache::{ConversionOutcome, ImageConversionCache};
use crate::utils::{to_canonical_jpeg_async, Metrics, CANONICAL_MEDIA_TYPE};

/// Turns one image URL into a payload the vision model accepts.
#[async_trait]
pub trait ConvertImage: Send + Sync {
    async fn convert(&self, url: &str) -> ConversionResult<ImagePayload>;
}

/// Downloads an image (bounded in time and size), decodes it, flattens it to
/// RGB and re-encodes it as base64 JPEG.
///
/// Every stage reports failure as a [`ConversionError`]; nothing panics or
/// escapes. Intermediate buffers live only for the duration of `convert`.
pub struct ImageConverter {
    http_client: reqwest::Client,
    max_bytes: u64,
    download_timeout: Duration,
    jpeg_quality: u8,
}

impl ImageConverter {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_limits(
            config.images.max_bytes,
            config.download_timeout(),
            config.images.jpeg_quality,
        )
    }

    pub fn with_limits(max_bytes: u64, download_timeout: Duration, jpeg_quality: u8) -> Result<Self> {
        // Redirects are followed by the default policy (up to 10 hops)
        let http_client = reqwest::Client::builder()
            .timeout(download_timeout)
            .connect_timeout(download_timeout.min(Duration::from_secs(10)))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("post-insight/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create image download client")?;

        Ok(Self {
            http_client,
            max_bytes,
            download_timeout,
            jpeg_quality,
        })
    }

    fn map_transport(&self, error: reqwest::Error) -> ConversionError {
        if error.is_timeout() {
            ConversionError::Timeout(self.download_timeout.as_secs())
        } else {
            ConversionError::Transport(error.to_string())
        }
    }

    /// Fetch the body, enforcing the size ceiling both on the declared
    /// Content-Length and on the bytes actually received.
    async fn download(&self, url: &str) -> ConversionResult<Vec<u8>> {
        let parsed = reqwest::Url::parse(url).map_err(|e| ConversionError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConversionError::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let mut response = self
            .http_client
            .get(parsed)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConversionError::HttpStatus(status.as_u16()));
        }

        if let Some(declared) = response.content_length() {
            if declared > self.max_bytes {
                return Err(ConversionError::TooLarge {
                    size: declared,
                    limit: self.max_bytes,
                });
            }
        }

        let capacity = response.content_length().unwrap_or(0).min(self.max_bytes) as usize;
        let mut body = Vec::with_capacity(capacity);
        while let Some(chunk) = response.chunk().await.map_err(|e| self.map_transport(e))? {
            let received = (body.len() + chunk.len()) as u64;
            if received > self.max_bytes {
                return Err(ConversionError::TooLarge {
                    size: received,
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

#[async_trait]
impl ConvertImage for ImageConverter {
    #[instrument(skip(self))]
    async fn convert(&self, url: &str) -> ConversionResult<ImagePayload> {
        let bytes = self.download(url).await?;
        let downloaded = bytes.len();

        let jpeg = to_canonical_jpeg_async(bytes, self.jpeg_quality).await?;
        let encoded = general_purpose::STANDARD.encode(&jpeg);

        debug!(
            "Converted {} ({} bytes -> {} bytes JPEG)",
            url,
            downloaded,
            jpeg.len()
        );

        Ok(ImagePayload::EncodedBlob {
            media_type: CANONICAL_MEDIA_TYPE.to_string(),
            data: Arc::from(encoded),
        })
    }
}

/// Bounded pool that converts non-standard images through the shared cache.
///
/// Launched once per run over the deduplicated URL set; posts that need an
/// image go through [`BackgroundConverterPool::resolve`] and either reuse the
/// background result or wait for it.
#[derive(Clone)]
pub struct BackgroundConverterPool {
    converter: Arc<dyn ConvertImage>,
    cache: ImageConversionCache,
    permits: Arc<Semaphore>,
    metrics: Option<Metrics>,
}

impl BackgroundConverterPool {
    pub fn new(
        converter: Arc<dyn ConvertImage>,
        cache: ImageConversionCache,
        workers: usize,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            converter,
            cache,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            metrics,
        }
    }

    pub fn cache(&self) -> &ImageConversionCache {
        &self.cache
    }

    /// Outcome for `url`, converting it at most once per cache.
    ///
    /// The claim is taken before a worker slot is free; waiters on the same
    /// URL only start their timeout once the conversion is actually running.
    pub async fn resolve(&self, url: &str) -> ConversionOutcome {
        let converter = Arc::clone(&self.converter);
        let permits = Arc::clone(&self.permits);
        let metrics = self.metrics.clone();

        self.cache
            .claim_or_wait_queued(url, |started| async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| ConversionError::Abandoned)?;
                started.running();

                let outcome = converter.convert(url).await;
                if let Err(ref e) = outcome {
                    log_failure(url, e);
                }
                if let Some(ref m) = metrics {
                    m.record_conversion(outcome.is_ok());
                }
                outcome
            })
            .await
    }

    /// Start converting every URL in the background. The returned set can be
    /// drained once dispatch is done; dropping it cancels unfinished work.
    pub fn launch(&self, urls: Vec<String>) -> JoinSet<()> {
        debug!("Launching background conversion for {} images", urls.len());
        let mut tasks = JoinSet::new();
        for url in urls {
            let pool = self.clone();
            tasks.spawn(async move {
                let _ = pool.resolve(&url).await;
            });
        }
        tasks
    }
}

fn log_failure(url: &str, error: &ConversionError) {
    if error.is_unsupported_format() {
        // Expected for some formats; the post falls back to its other images
        debug!("Skipping image {}: {}", url, error);
    } else if error.is_transport() {
        warn!("Could not fetch image {}: {}", url, error);
    } else {
        warn!("Image conversion failed for {}: {}", url, error);
    }
}
