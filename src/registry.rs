use crate::models::{progress_percent, DownloadRecord, DownloadStatus, Manga};
use crate::persist::Persisted;
use crate::traits::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const DOWNLOADS_KEY: &str = "manga-downloads";
pub const FAVORITES_KEY: &str = "manga-favorites";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DownloadsState {
    #[serde(default)]
    pub downloads: BTreeMap<String, DownloadRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FavoritesState {
    #[serde(default)]
    pub favorites: Vec<Manga>,
}

/// Registry of offline chapters, keyed by chapter id.
pub struct ChapterRegistry {
    state: Persisted<DownloadsState>,
}

impl ChapterRegistry {
    /// Loads the registry without writing anything back.
    pub async fn load(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            state: Persisted::load(store, DOWNLOADS_KEY).await,
        }
    }

    /// Marks records still `downloading` as `failed` and returns how many
    /// changed. Only the holder of the instance lock may call this: without
    /// it a `downloading` record may belong to a live process.
    pub async fn reconcile_interrupted(&self) -> usize {
        let stale = self.state.apply(|s| {
            let mut stale = Vec::new();
            for record in s.downloads.values_mut() {
                if record.status == DownloadStatus::Downloading {
                    record.status = DownloadStatus::Failed;
                    record.touch();
                    stale.push(record.chapter_id.clone());
                }
            }
            (!stale.is_empty()).then_some(stale)
        });

        match stale {
            Some(stale) => {
                warn!("Marked {} interrupted downloads as failed: {:?}", stale.len(), stale);
                self.state.flush().await;
                stale.len()
            }
            None => 0,
        }
    }

    pub fn get(&self, chapter_id: &str) -> Option<DownloadRecord> {
        self.state.read(|s| s.downloads.get(chapter_id).cloned())
    }

    pub fn is_downloaded(&self, chapter_id: &str) -> bool {
        self.state.read(|s| {
            s.downloads
                .get(chapter_id)
                .is_some_and(DownloadRecord::is_completed)
        })
    }

    pub fn all(&self) -> Vec<DownloadRecord> {
        self.state.read(|s| s.downloads.values().cloned().collect())
    }

    /// Records grouped by owning manga.
    pub fn by_manga(&self) -> BTreeMap<String, Vec<DownloadRecord>> {
        let mut groups: BTreeMap<String, Vec<DownloadRecord>> = BTreeMap::new();
        for record in self.all() {
            groups.entry(record.manga_id.clone()).or_default().push(record);
        }
        groups
    }

    /// Installs a fresh `downloading` record unless the chapter is already completed.
    pub(crate) async fn begin(&self, record: DownloadRecord) -> Option<DownloadRecord> {
        self.state
            .update(|s| {
                if s.downloads
                    .get(&record.chapter_id)
                    .is_some_and(DownloadRecord::is_completed)
                {
                    return None;
                }
                s.downloads.insert(record.chapter_id.clone(), record.clone());
                Some(record)
            })
            .await
    }

    /// Mutates the record only while `attempt` still owns it.
    async fn transition<F>(&self, chapter_id: &str, attempt: Uuid, f: F) -> Option<DownloadRecord>
    where
        F: FnOnce(&mut DownloadRecord) + Send,
    {
        self.state
            .update(|s| {
                let record = s
                    .downloads
                    .get_mut(chapter_id)
                    .filter(|r| r.attempt == attempt)?;
                f(record);
                record.touch();
                Some(record.clone())
            })
            .await
    }

    pub(crate) async fn set_total(
        &self,
        chapter_id: &str,
        attempt: Uuid,
        total: usize,
    ) -> Option<DownloadRecord> {
        self.transition(chapter_id, attempt, |r| {
            r.total_images = total;
            r.downloaded_images = 0;
            r.progress = 0;
        })
        .await
    }

    /// Counts one resolved image against the live record.
    pub(crate) async fn record_image(&self, chapter_id: &str, attempt: Uuid) -> Option<DownloadRecord> {
        self.transition(chapter_id, attempt, |r| {
            r.downloaded_images = (r.downloaded_images + 1).min(r.total_images);
            r.progress = progress_percent(r.downloaded_images, r.total_images);
        })
        .await
    }

    pub(crate) async fn complete(
        &self,
        chapter_id: &str,
        attempt: Uuid,
        images: Vec<PathBuf>,
    ) -> Option<DownloadRecord> {
        self.transition(chapter_id, attempt, |r| {
            r.downloaded_images = images.len();
            r.total_images = images.len();
            r.images = images;
            r.status = DownloadStatus::Completed;
            r.progress = 100;
        })
        .await
    }

    pub(crate) async fn fail(&self, chapter_id: &str, attempt: Uuid) -> Option<DownloadRecord> {
        self.transition(chapter_id, attempt, |r| {
            r.status = DownloadStatus::Failed;
            r.images.clear();
        })
        .await
    }

    pub(crate) async fn remove(&self, chapter_id: &str) -> Option<DownloadRecord> {
        self.state.update(|s| s.downloads.remove(chapter_id)).await
    }
}

/// Favorited manga, in the order they were added.
pub struct FavoritesRegistry {
    state: Persisted<FavoritesState>,
}

impl FavoritesRegistry {
    pub async fn load(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            state: Persisted::load(store, FAVORITES_KEY).await,
        }
    }

    pub fn favorites(&self) -> Vec<Manga> {
        self.state.read(|s| s.favorites.clone())
    }

    pub fn is_favorite(&self, manga_id: &str) -> bool {
        self.state.read(|s| s.favorites.iter().any(|f| f.id == manga_id))
    }

    /// Returns `false` when a manga with the same id is already a favorite.
    pub async fn add_favorite(&self, manga: Manga) -> bool {
        let name = manga.name.clone();
        let added = self
            .state
            .update(|s| {
                if s.favorites.iter().any(|f| f.id == manga.id) {
                    return None;
                }
                s.favorites.push(manga);
                Some(())
            })
            .await
            .is_some();

        if added {
            info!("Added '{}' to favorites", name);
        }
        added
    }

    pub async fn remove_favorite(&self, manga_id: &str) -> bool {
        self.state
            .update(|s| {
                let before = s.favorites.len();
                s.favorites.retain(|f| f.id != manga_id);
                (s.favorites.len() != before).then_some(())
            })
            .await
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{manga, MemoryStore};

    #[tokio::test]
    async fn favorites_dedup_by_id() {
        let store = Arc::new(MemoryStore::default());
        let favorites = FavoritesRegistry::load(store.clone()).await;

        assert!(favorites.add_favorite(manga("m1")).await);
        let mut renamed = manga("m1");
        renamed.name = "Different snapshot".to_string();
        assert!(!favorites.add_favorite(renamed).await);
        assert!(favorites.add_favorite(manga("m2")).await);

        let ids: Vec<_> = favorites.favorites().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(favorites.favorites()[0].name, "Manga m1");
    }

    #[tokio::test]
    async fn removing_unknown_favorite_is_a_no_op() {
        let store = Arc::new(MemoryStore::default());
        let favorites = FavoritesRegistry::load(store.clone()).await;
        favorites.add_favorite(manga("m1")).await;
        let writes = store.writes();

        assert!(!favorites.remove_favorite("missing").await);
        assert_eq!(store.writes(), writes);
        assert!(favorites.is_favorite("m1"));

        assert!(favorites.remove_favorite("m1").await);
        assert!(!favorites.is_favorite("m1"));
    }

    #[tokio::test]
    async fn favorites_survive_reload() {
        let store = Arc::new(MemoryStore::default());
        {
            let favorites = FavoritesRegistry::load(store.clone()).await;
            favorites.add_favorite(manga("m1")).await;
        }

        let blob = store.raw(FAVORITES_KEY).unwrap();
        assert!(blob.contains("\"_id\":\"m1\""));

        let favorites = FavoritesRegistry::load(store).await;
        assert!(favorites.is_favorite("m1"));
    }

    #[tokio::test]
    async fn interrupted_downloads_become_failed_on_load() {
        let store = Arc::new(MemoryStore::default());
        {
            let registry = ChapterRegistry::load(store.clone()).await;
            let record = DownloadRecord::new("m1".into(), "c1".into(), "1".into());
            let attempt = record.attempt;
            registry.begin(record).await.unwrap();
            registry.set_total("c1", attempt, 4).await.unwrap();
            registry.record_image("c1", attempt).await.unwrap();
        }

        let registry = ChapterRegistry::load(store.clone()).await;
        assert_eq!(registry.get("c1").unwrap().status, DownloadStatus::Downloading);

        assert_eq!(registry.reconcile_interrupted().await, 1);
        let record = registry.get("c1").unwrap();
        assert_eq!(record.status, DownloadStatus::Failed);
        assert_eq!(record.downloaded_images, 1);
        assert_eq!(record.progress, 25);

        let again = ChapterRegistry::load(store).await;
        assert_eq!(again.get("c1").unwrap().status, DownloadStatus::Failed);
        assert_eq!(again.reconcile_interrupted().await, 0);
    }

    #[tokio::test]
    async fn second_reader_leaves_live_download_alone() {
        let store = Arc::new(MemoryStore::default());
        let owner = ChapterRegistry::load(store.clone()).await;

        let old = DownloadRecord::new("m1".into(), "old".into(), "1".into());
        let old_attempt = old.attempt;
        owner.begin(old).await.unwrap();
        owner
            .complete("old", old_attempt, vec![PathBuf::from("/d/0.jpg")])
            .await
            .unwrap();

        let live = DownloadRecord::new("m1".into(), "live".into(), "2".into());
        let live_attempt = live.attempt;
        owner.begin(live).await.unwrap();
        let writes = store.writes();

        let viewer = ChapterRegistry::load(store.clone()).await;
        assert_eq!(viewer.get("live").unwrap().status, DownloadStatus::Downloading);
        assert!(viewer.is_downloaded("old"));
        assert_eq!(store.writes(), writes);

        owner.set_total("live", live_attempt, 3).await.unwrap();
        let on_disk = ChapterRegistry::load(store).await;
        assert_eq!(on_disk.get("live").unwrap().status, DownloadStatus::Downloading);
        assert_eq!(on_disk.get("live").unwrap().total_images, 3);
    }

    #[tokio::test]
    async fn stale_attempt_cannot_touch_record() {
        let registry = ChapterRegistry::load(Arc::new(MemoryStore::default())).await;
        let first = DownloadRecord::new("m1".into(), "c1".into(), "1".into());
        let first_attempt = first.attempt;
        registry.begin(first).await.unwrap();

        let second = DownloadRecord::new("m1".into(), "c1".into(), "1".into());
        let second_attempt = second.attempt;
        registry.begin(second).await.unwrap();

        assert!(registry.fail("c1", first_attempt).await.is_none());
        assert!(registry.set_total("c1", second_attempt, 2).await.is_some());
        assert_eq!(registry.get("c1").unwrap().status, DownloadStatus::Downloading);

        registry.remove("c1").await;
        assert!(registry.record_image("c1", second_attempt).await.is_none());
        assert!(registry.get("c1").is_none());
    }

    #[tokio::test]
    async fn completed_record_is_not_replaced() {
        let registry = ChapterRegistry::load(Arc::new(MemoryStore::default())).await;
        let record = DownloadRecord::new("m1".into(), "c1".into(), "1".into());
        let attempt = record.attempt;
        registry.begin(record).await.unwrap();
        registry
            .complete("c1", attempt, vec![PathBuf::from("/d/0.jpg")])
            .await
            .unwrap();

        let retry = DownloadRecord::new("m1".into(), "c1".into(), "1".into());
        assert!(registry.begin(retry).await.is_none());
        assert!(registry.is_downloaded("c1"));
        assert_eq!(registry.get("c1").unwrap().attempt, attempt);
    }

    #[tokio::test]
    async fn groups_records_by_manga() {
        let registry = ChapterRegistry::load(Arc::new(MemoryStore::default())).await;
        for (manga_id, chapter_id) in [("m1", "c1"), ("m2", "c2"), ("m1", "c3")] {
            registry
                .begin(DownloadRecord::new(manga_id.into(), chapter_id.into(), "x".into()))
                .await
                .unwrap();
        }

        let groups = registry.by_manga();
        assert_eq!(groups["m1"].len(), 2);
        assert_eq!(groups["m2"].len(), 1);
    }
}
