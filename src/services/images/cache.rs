use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::core::errors::ConversionError;
use crate::core::types::ImagePayload;
use crate::utils::Metrics;

/// Final result of converting one normalized URL
pub type ConversionOutcome = Result<ImagePayload, ConversionError>;

/// Progress of a claimed key, broadcast to its waiters
#[derive(Clone)]
enum Progress {
    /// Claimed, but the producer has not started (e.g. queued for a worker)
    Queued,
    Running,
    Settled(ConversionOutcome),
}

enum Slot {
    /// A claimant owns the key; waiters subscribe to this channel
    InFlight(watch::Receiver<Progress>),
    Done(ConversionOutcome),
}

/// Per-run conversion cache keyed by normalized image URL.
///
/// All map access happens under one mutex with short critical sections; the
/// conversion itself runs outside the lock. Each key is produced at most once
/// for the lifetime of the cache, no matter how many posts reference it.
#[derive(Clone)]
pub struct ImageConversionCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    slots: Mutex<HashMap<String, Slot>>,
    wait_timeout: Duration,
    metrics: Option<Metrics>,
}

enum Role {
    Settled(ConversionOutcome),
    Waiter(watch::Receiver<Progress>),
    Claimant(watch::Sender<Progress>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub ready: usize,
    pub failed: usize,
    pub in_flight: usize,
}

/// Handed to the producer of a claimed key. Waiters start their timeout
/// only once [`ClaimStarted::running`] has been called.
pub struct ClaimStarted {
    tx: Arc<watch::Sender<Progress>>,
}

impl ClaimStarted {
    pub fn running(&self) {
        self.tx.send_if_modified(|progress| match progress {
            Progress::Queued => {
                *progress = Progress::Running;
                true
            }
            _ => false,
        });
    }
}

impl ImageConversionCache {
    pub fn new(wait_timeout: Duration, metrics: Option<Metrics>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                slots: Mutex::new(HashMap::new()),
                wait_timeout,
                metrics,
            }),
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.inner.wait_timeout
    }

    /// Completed outcome for `url`, if any. Never blocks on an in-flight claim.
    pub fn get(&self, url: &str) -> Option<ConversionOutcome> {
        match self.inner.slots.lock().get(url) {
            Some(Slot::Done(outcome)) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// Whether anyone has claimed `url` yet, finished or not.
    pub fn is_claimed(&self, url: &str) -> bool {
        self.inner.slots.lock().contains_key(url)
    }

    /// Return the outcome for `url`, producing it if nobody has claimed it yet.
    /// The producer counts as running as soon as it is called.
    pub async fn claim_or_wait<F, Fut>(&self, url: &str, produce: F) -> ConversionOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConversionOutcome>,
    {
        self.claim_or_wait_queued(url, move |started| {
            started.running();
            produce()
        })
        .await
    }

    /// Like [`claim_or_wait`](Self::claim_or_wait), for producers that may
    /// queue before doing any work.
    ///
    /// - no entry: this caller claims the key and runs `produce` (unlocked)
    /// - in flight: waits for the claimant to start, then for its outcome,
    ///   bounded by the cache wait timeout; a timed-out waiter gets
    ///   `WaitTimedOut` and the shared entry is left alone
    /// - settled: returns the stored outcome immediately
    pub async fn claim_or_wait_queued<F, Fut>(&self, url: &str, produce: F) -> ConversionOutcome
    where
        F: FnOnce(ClaimStarted) -> Fut,
        Fut: Future<Output = ConversionOutcome>,
    {
        let role = {
            let mut slots = self.inner.slots.lock();
            match slots.get(url) {
                Some(Slot::Done(outcome)) => Role::Settled(outcome.clone()),
                Some(Slot::InFlight(rx)) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(Progress::Queued);
                    slots.insert(url.to_string(), Slot::InFlight(rx));
                    Role::Claimant(tx)
                }
            }
        };

        match role {
            Role::Settled(outcome) => {
                if let Some(ref m) = self.inner.metrics {
                    m.record_cache_hit();
                }
                outcome
            }
            Role::Claimant(tx) => {
                if let Some(ref m) = self.inner.metrics {
                    m.record_cache_miss();
                }
                debug!("Claimed conversion for {}", url);
                let tx = Arc::new(tx);
                let mut guard = ClaimGuard {
                    inner: &self.inner,
                    url,
                    tx: Some(Arc::clone(&tx)),
                };
                let outcome = produce(ClaimStarted { tx }).await;
                guard.publish(outcome.clone());
                outcome
            }
            Role::Waiter(rx) => self.wait_for_claimant(url, rx).await,
        }
    }

    async fn wait_for_claimant(
        &self,
        url: &str,
        mut rx: watch::Receiver<Progress>,
    ) -> ConversionOutcome {
        if let Some(ref m) = self.inner.metrics {
            m.record_cache_wait();
        }

        // Time spent queued behind other conversions is not a stall
        if rx
            .wait_for(|p| !matches!(p, Progress::Queued))
            .await
            .is_err()
        {
            return self.get(url).unwrap_or(Err(ConversionError::Abandoned));
        }

        let waited = tokio::time::timeout(self.inner.wait_timeout, async {
            rx.wait_for(|p| matches!(p, Progress::Settled(_)))
                .await
                .map(|progress| progress.clone())
        })
        .await;

        match waited {
            Ok(Ok(Progress::Settled(outcome))) => outcome,
            // Sender gone without an outcome; the guard normally prevents this
            Ok(_) => self.get(url).unwrap_or(Err(ConversionError::Abandoned)),
            Err(_) => {
                warn!(
                    "Gave up waiting {:?} for in-flight conversion of {}",
                    self.inner.wait_timeout, url
                );
                if let Some(ref m) = self.inner.metrics {
                    m.record_cache_wait_timeout();
                }
                Err(ConversionError::WaitTimedOut(self.inner.wait_timeout.as_secs()))
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let slots = self.inner.slots.lock();
        let mut stats = CacheStats::default();
        for slot in slots.values() {
            match slot {
                Slot::InFlight(_) => stats.in_flight += 1,
                Slot::Done(Ok(_)) => stats.ready += 1,
                Slot::Done(Err(_)) => stats.failed += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Publishes the claimant's outcome. If the claimant is dropped first
/// (cancelled or panicked) it publishes `Abandoned` so waiters wake up.
struct ClaimGuard<'a> {
    inner: &'a CacheInner,
    url: &'a str,
    tx: Option<Arc<watch::Sender<Progress>>>,
}

impl ClaimGuard<'_> {
    fn publish(&mut self, outcome: ConversionOutcome) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        self.inner
            .slots
            .lock()
            .insert(self.url.to_string(), Slot::Done(outcome.clone()));
        tx.send_replace(Progress::Settled(outcome));
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!("Conversion of {} dropped before completion", self.url);
            self.publish(Err(ConversionError::Abandoned));
        }
    }
}
