use crate::config::DownloadConfig;
use crate::error::{MangaDockError, Result};
use crate::models::{ChapterInfo, DownloadRecord, DownloadStatus, Manga};
use crate::registry::ChapterRegistry;
use crate::storage::{create_chapter_cbz, ChapterLayout};
use crate::traits::{ChapterSource, FileStorage};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

type ActiveDownloads = Mutex<HashMap<String, Uuid>>;

fn lock_active(active: &ActiveDownloads) -> MutexGuard<'_, HashMap<String, Uuid>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a chapter as being downloaded by this process for the guard's lifetime.
struct ActiveGuard<'a> {
    active: &'a ActiveDownloads,
    chapter_id: String,
    attempt: Uuid,
}

impl<'a> ActiveGuard<'a> {
    fn acquire(active: &'a ActiveDownloads, chapter_id: &str, attempt: Uuid) -> Option<Self> {
        let mut map = lock_active(active);
        if map.contains_key(chapter_id) {
            return None;
        }
        map.insert(chapter_id.to_string(), attempt);
        Some(Self {
            active,
            chapter_id: chapter_id.to_string(),
            attempt,
        })
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut map = lock_active(self.active);
        if map.get(&self.chapter_id) == Some(&self.attempt) {
            map.remove(&self.chapter_id);
        }
    }
}

/// Drives chapter downloads and keeps the chapter registry in step with the files on disk.
pub struct DownloadManager {
    source: Arc<dyn ChapterSource>,
    files: Arc<dyn FileStorage>,
    registry: Arc<ChapterRegistry>,
    layout: ChapterLayout,
    max_concurrent_images: usize,
    active: ActiveDownloads,
    events: broadcast::Sender<DownloadRecord>,
}

impl DownloadManager {
    pub fn new(
        source: Arc<dyn ChapterSource>,
        files: Arc<dyn FileStorage>,
        registry: Arc<ChapterRegistry>,
        layout: ChapterLayout,
        config: &DownloadConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            source,
            files,
            registry,
            layout,
            max_concurrent_images: config.max_concurrent_images.max(1),
            active: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn registry(&self) -> &Arc<ChapterRegistry> {
        &self.registry
    }

    /// Snapshot of a record after every state transition.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadRecord> {
        self.events.subscribe()
    }

    pub fn is_chapter_downloaded(&self, chapter_id: &str) -> bool {
        self.registry.is_downloaded(chapter_id)
    }

    pub fn get_downloaded_chapter(&self, chapter_id: &str) -> Option<DownloadRecord> {
        self.registry.get(chapter_id)
    }

    fn publish(&self, record: DownloadRecord) {
        // No subscribers is fine.
        let _ = self.events.send(record);
    }

    fn owns(&self, chapter_id: &str, attempt: Uuid) -> bool {
        self.registry
            .get(chapter_id)
            .is_some_and(|r| r.attempt == attempt)
    }

    /// Downloads every page of a chapter for offline reading. Failures end in
    /// a `failed` record; completed chapters and chapters already in flight
    /// are left alone.
    pub async fn download_chapter(&self, manga: &Manga, chapter: &ChapterInfo) {
        let chapter_id = chapter.chapter_api_data.as_str();

        if self.registry.is_downloaded(chapter_id) {
            debug!("Chapter {} already downloaded", chapter_id);
            return;
        }

        let record = DownloadRecord::new(
            manga.id.clone(),
            chapter_id.to_string(),
            chapter.chapter_name.clone(),
        );
        let attempt = record.attempt;

        let Some(_guard) = ActiveGuard::acquire(&self.active, chapter_id, attempt) else {
            info!("Chapter {} is already downloading", chapter_id);
            return;
        };

        let Some(record) = self.registry.begin(record).await else {
            debug!("Chapter {} completed concurrently", chapter_id);
            return;
        };
        self.publish(record);
        info!("Start downloading {} ({})", chapter.chapter_name, chapter_id);

        match self.run(&manga.id, chapter_id, attempt).await {
            Ok(Some(record)) => {
                info!(
                    "Downloaded {} images for chapter {}",
                    record.images.len(),
                    record.chapter_name
                );
                self.publish(record);
            }
            Ok(None) => self.discard_cancelled(&manga.id, chapter_id).await,
            Err(e) => {
                error!("Download failed for {}: {}", chapter_id, e);
                match self.registry.fail(chapter_id, attempt).await {
                    Some(record) => self.publish(record),
                    None => self.discard_cancelled(&manga.id, chapter_id).await,
                }
            }
        }
    }

    /// Returns `None` when the record was removed while downloading.
    async fn run(&self, manga_id: &str, chapter_id: &str, attempt: Uuid) -> Result<Option<DownloadRecord>> {
        let chapter = self.source.fetch_chapter(chapter_id).await?;
        let urls = chapter.image_urls();

        let Some(record) = self.registry.set_total(chapter_id, attempt, urls.len()).await else {
            return Ok(None);
        };
        self.publish(record);

        let chapter_dir = self.layout.chapter_dir(manga_id, chapter_id);
        if !self.files.exists(&chapter_dir).await? {
            self.files.make_directory(&chapter_dir, true).await?;
        }

        let pages: Vec<PathBuf> = (0..urls.len())
            .map(|index| self.layout.page_path(&chapter_dir, index))
            .collect();

        let tasks: Vec<_> = urls
            .iter()
            .zip(pages.iter())
            .map(|(url, page)| self.fetch_image(chapter_id, attempt, url, page))
            .collect();
        let results: Vec<Result<()>> = stream::iter(tasks)
            .buffer_unordered(self.max_concurrent_images)
            .collect()
            .await;

        let mut failures = results.into_iter().filter_map(|r| r.err());
        if let Some(first) = failures.next() {
            let others = failures.count();
            if others > 0 {
                warn!("{} more images failed for chapter {}", others, chapter_id);
            }
            return Err(first);
        }

        Ok(self.registry.complete(chapter_id, attempt, pages).await)
    }

    async fn fetch_image(&self, chapter_id: &str, attempt: Uuid, url: &str, page: &Path) -> Result<()> {
        if !self.owns(chapter_id, attempt) {
            return Ok(());
        }

        if self.files.exists(page).await? {
            debug!("Reusing {:?}", page);
        } else {
            self.files.download(url, page).await?;
        }

        if let Some(record) = self.registry.record_image(chapter_id, attempt).await {
            self.publish(record);
        }
        Ok(())
    }

    /// A removed chapter may have had its directory recreated by in-flight
    /// image tasks; drop it unless a newer download owns the chapter again.
    async fn discard_cancelled(&self, manga_id: &str, chapter_id: &str) {
        info!("Download of {} was cancelled", chapter_id);
        if self.registry.get(chapter_id).is_some() {
            return;
        }

        let chapter_dir = self.layout.chapter_dir(manga_id, chapter_id);
        if let Err(e) = self.files.delete(&chapter_dir, true).await {
            warn!("Failed to clean up cancelled chapter {:?}: {}", chapter_dir, e);
        }
    }

    /// Deletes the chapter's files and forgets it. An in-flight download of
    /// the chapter stops at its next state transition.
    pub async fn remove_download(&self, chapter_id: &str) {
        let Some(record) = self.registry.get(chapter_id) else {
            return;
        };

        if record.status == DownloadStatus::Downloading {
            info!("Cancelling in-flight download of {}", chapter_id);
            let mut active = lock_active(&self.active);
            if active.get(chapter_id) == Some(&record.attempt) {
                active.remove(chapter_id);
            }
        }

        self.registry.remove(chapter_id).await;

        let chapter_dir = self.layout.chapter_dir(&record.manga_id, chapter_id);
        match self.files.delete(&chapter_dir, true).await {
            Ok(()) => info!("Removed download {}", chapter_id),
            Err(e) => error!("Failed to delete files for {}: {}", chapter_id, e),
        }
    }

    /// Packs a completed chapter into a `.cbz` archive.
    pub async fn export_chapter(&self, chapter_id: &str, destination: &Path) -> Result<PathBuf> {
        let record = self
            .registry
            .get(chapter_id)
            .ok_or_else(|| MangaDockError::chapter_not_found(chapter_id))?;

        if !record.is_completed() {
            return Err(MangaDockError::not_downloaded(chapter_id));
        }

        create_chapter_cbz(&record.images, destination).await
    }
}
