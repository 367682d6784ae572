// Post source and interpretation store collaborators

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::errors::{StoreError, StoreResult};
use crate::core::types::{InterpretationRecord, InterpretationStatus, PostId, RawPost};

/// Largest batch handed to a single enrichment run
pub const MAX_BATCH_POSTS: usize = 1000;

/// Supplies posts that still lack an interpretation.
#[async_trait]
pub trait PostSource: Send + Sync {
    /// Posts created within the last `window_hours`, in no guaranteed order.
    async fn unprocessed_posts(&self, window_hours: u32) -> StoreResult<Vec<RawPost>>;
}

/// Persists exactly one interpretation per post.
#[async_trait]
pub trait InterpretationStore: Send + Sync {
    /// Insert or replace the record for `record.post_id`; returns that id.
    async fn save_interpretation(&self, record: InterpretationRecord) -> StoreResult<PostId>;

    async fn get(&self, post_id: PostId) -> StoreResult<Option<InterpretationRecord>>;

    async fn len(&self) -> StoreResult<usize>;

    async fn stats(&self) -> StoreResult<StoreStats>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub downgraded: usize,
}

impl StoreStats {
    fn tally<'a>(records: impl Iterator<Item = &'a InterpretationRecord>) -> Self {
        records.fold(Self::default(), |mut stats, record| {
            stats.total += 1;
            match record.status {
                InterpretationStatus::Success => stats.success += 1,
                InterpretationStatus::Failed => stats.failed += 1,
            }
            if record.downgraded {
                stats.downgraded += 1;
            }
            stats
        })
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<PostId, InterpretationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<InterpretationRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by_key(|r| r.post_id);
        records
    }
}

#[async_trait]
impl InterpretationStore for MemoryStore {
    async fn save_interpretation(&self, record: InterpretationRecord) -> StoreResult<PostId> {
        let post_id = record.post_id;
        self.records.write().insert(post_id, record);
        Ok(post_id)
    }

    async fn get(&self, post_id: PostId) -> StoreResult<Option<InterpretationRecord>> {
        Ok(self.records.read().get(&post_id).cloned())
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.records.read().len())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        Ok(StoreStats::tally(self.records.read().values()))
    }
}

/// JSON-file store. The full record set is rewritten after every save,
/// through a temp file and a rename so readers never see a torn file.
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<HashMap<PostId, InterpretationRecord>>,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        let records = match tokio::fs::read_to_string(&path).await {
            Ok(data) => serde_json::from_str::<Vec<InterpretationRecord>>(&data)?
                .into_iter()
                .map(|r| (r.post_id, r))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(io_error(&path, e)),
        };

        info!("Loaded {} interpretations from {}", records.len(), path.display());

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    async fn persist(&self, records: &HashMap<PostId, InterpretationRecord>) -> StoreResult<()> {
        let mut sorted: Vec<_> = records.values().collect();
        sorted.sort_by_key(|r| r.post_id);
        let data = serde_json::to_string_pretty(&sorted)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        Ok(())
    }
}

#[async_trait]
impl InterpretationStore for JsonFileStore {
    async fn save_interpretation(&self, record: InterpretationRecord) -> StoreResult<PostId> {
        let post_id = record.post_id;
        // Held across the write so file updates are serialized
        let mut records = self.records.lock().await;
        let previous = records.insert(post_id, record);
        if let Err(e) = self.persist(&records).await {
            // The map mirrors the file; a record that never landed is not processed
            match previous {
                Some(previous) => records.insert(post_id, previous),
                None => records.remove(&post_id),
            };
            return Err(e);
        }
        debug!("Saved interpretation for post {}", post_id);
        Ok(post_id)
    }

    async fn get(&self, post_id: PostId) -> StoreResult<Option<InterpretationRecord>> {
        Ok(self.records.lock().await.get(&post_id).cloned())
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.records.lock().await.len())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        Ok(StoreStats::tally(self.records.lock().await.values()))
    }
}

/// Fixed list of posts, used by tests and one-off runs
#[derive(Default)]
pub struct MemoryPostSource {
    posts: RwLock<Vec<RawPost>>,
    offline: bool,
}

impl MemoryPostSource {
    pub fn new(posts: Vec<RawPost>) -> Self {
        Self {
            posts: RwLock::new(posts),
            offline: false,
        }
    }

    /// A source whose every fetch fails
    pub fn offline() -> Self {
        Self {
            posts: RwLock::new(Vec::new()),
            offline: true,
        }
    }
}

#[async_trait]
impl PostSource for MemoryPostSource {
    async fn unprocessed_posts(&self, _window_hours: u32) -> StoreResult<Vec<RawPost>> {
        if self.offline {
            return Err(StoreError::Backend("post source is offline".to_string()));
        }
        Ok(self.posts.read().clone())
    }
}

/// A post as written by the ingestion job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPost {
    pub id: PostId,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<StoredPost> for RawPost {
    fn from(stored: StoredPost) -> Self {
        RawPost {
            id: stored.id,
            text: stored.summary,
            title: stored.title,
        }
    }
}

/// Reads ingested posts from a JSON array and skips those already
/// interpreted in `store`.
pub struct JsonFilePostSource {
    path: PathBuf,
    store: Arc<dyn InterpretationStore>,
}

impl JsonFilePostSource {
    pub fn new(path: impl AsRef<Path>, store: Arc<dyn InterpretationStore>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            store,
        }
    }
}

#[async_trait]
impl PostSource for JsonFilePostSource {
    async fn unprocessed_posts(&self, window_hours: u32) -> StoreResult<Vec<RawPost>> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        let mut posts: Vec<StoredPost> = serde_json::from_str(&data)?;

        // A window reaching past the representable range means "everything"
        let cutoff = ChronoDuration::try_hours(i64::from(window_hours))
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        posts.retain(|p| p.created_at >= cutoff);
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut batch = Vec::new();
        for post in posts {
            if batch.len() >= MAX_BATCH_POSTS {
                break;
            }
            if self.store.get(post.id).await?.is_none() {
                batch.push(RawPost::from(post));
            }
        }

        debug!(
            "{} unprocessed posts in the last {}h from {}",
            batch.len(),
            window_hours,
            self.path.display()
        );
        Ok(batch)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FailureReason, Interpretation};

    fn record(post_id: PostId, text: &str) -> InterpretationRecord {
        InterpretationRecord::new(post_id, Interpretation::success(text.to_string(), "m"))
    }

    #[tokio::test]
    async fn test_memory_store_upserts() {
        let store = MemoryStore::new();
        store.save_interpretation(record(1, "first")).await.unwrap();
        store.save_interpretation(record(1, "second")).await.unwrap();
        store.save_interpretation(record(2, "other")).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 2);
        assert_eq!(store.get(1).await.unwrap().unwrap().text, "second");
    }

    #[tokio::test]
    async fn test_stats_tally_status_and_downgrades() {
        let store = MemoryStore::new();
        store.save_interpretation(record(1, "ok")).await.unwrap();
        store
            .save_interpretation(InterpretationRecord::new(
                2,
                Interpretation::downgraded("text only".to_string(), "m"),
            ))
            .await
            .unwrap();
        store
            .save_interpretation(InterpretationRecord::new(
                3,
                Interpretation::failed(FailureReason::TextFailed, "503", "m"),
            ))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            StoreStats {
                total: 3,
                success: 2,
                failed: 1,
                downgraded: 1
            }
        );
    }

    #[tokio::test]
    async fn test_json_store_persists_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("interpretations.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        store.save_interpretation(record(7, "draft")).await.unwrap();
        store.save_interpretation(record(7, "final")).await.unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.len().await.unwrap(), 1);
        assert_eq!(reopened.get(7).await.unwrap().unwrap().text, "final");
    }

    #[tokio::test]
    async fn test_failed_write_leaves_post_unprocessed() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let store = JsonFileStore::open(data_dir.join("interpretations.json"))
            .await
            .unwrap();
        let store = Arc::new(store);
        store.save_interpretation(record(1, "first")).await.unwrap();

        // Replace the data directory with a plain file so every write fails
        std::fs::remove_dir_all(&data_dir).unwrap();
        std::fs::write(&data_dir, "not a directory").unwrap();

        assert!(store.save_interpretation(record(1, "second")).await.is_err());
        assert!(store.save_interpretation(record(2, "new")).await.is_err());
        assert_eq!(store.get(1).await.unwrap().unwrap().text, "first");
        assert_eq!(store.get(2).await.unwrap(), None);
        assert_eq!(store.len().await.unwrap(), 1);

        let posts_path = dir.path().join("posts.json");
        std::fs::write(&posts_path, serde_json::to_string(&vec![stored(2, 1)]).unwrap()).unwrap();
        let source = JsonFilePostSource::new(&posts_path, store);
        let ids: Vec<PostId> = source
            .unprocessed_posts(36)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interpretations.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            JsonFileStore::open(&path).await,
            Err(StoreError::Serde(_))
        ));
    }

    fn stored(id: PostId, hours_ago: i64) -> StoredPost {
        StoredPost {
            id,
            summary: format!("post {}", id),
            title: None,
            created_at: Utc::now() - ChronoDuration::hours(hours_ago),
        }
    }

    #[tokio::test]
    async fn test_json_source_filters_window_and_processed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posts.json");
        let posts = vec![stored(1, 1), stored(2, 50), stored(3, 5), stored(4, 2)];
        std::fs::write(&path, serde_json::to_string(&posts).unwrap()).unwrap();

        let store = Arc::new(MemoryStore::new());
        store.save_interpretation(record(4, "done")).await.unwrap();

        let source = JsonFilePostSource::new(&path, store);
        let batch = source.unprocessed_posts(36).await.unwrap();
        let ids: Vec<PostId> = batch.iter().map(|p| p.id).collect();

        // Newest first, outside-window and processed posts skipped
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(batch[0].text, "post 1");
    }

    #[tokio::test]
    async fn test_huge_window_includes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posts.json");
        let posts = vec![stored(1, 1), stored(2, 24 * 365 * 30)];
        std::fs::write(&path, serde_json::to_string(&posts).unwrap()).unwrap();

        let source = JsonFilePostSource::new(&path, Arc::new(MemoryStore::new()));
        let batch = source.unprocessed_posts(u32::MAX).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_json_source_caps_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posts.json");
        let posts: Vec<StoredPost> = (0..(MAX_BATCH_POSTS as i64 + 5)).map(|id| stored(id, 1)).collect();
        std::fs::write(&path, serde_json::to_string(&posts).unwrap()).unwrap();

        let source = JsonFilePostSource::new(&path, Arc::new(MemoryStore::new()));
        assert_eq!(source.unprocessed_posts(36).await.unwrap().len(), MAX_BATCH_POSTS);
    }

    #[tokio::test]
    async fn test_missing_posts_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonFilePostSource::new(dir.path().join("absent.json"), Arc::new(MemoryStore::new()));
        assert!(matches!(
            source.unprocessed_posts(36).await,
            Err(StoreError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_offline_memory_source_fails() {
        assert!(MemoryPostSource::offline().unprocessed_posts(36).await.is_err());
    }
}
