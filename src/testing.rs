//! In-memory collaborators for tests.

use crate::error::{MangaDockError, Result};
use crate::models::{ChapterData, ChapterImage, ChapterItem, Manga};
use crate::traits::{ChapterSource, FileStorage, KeyValueStore};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn raw(&self, name: &str) -> Option<String> {
        self.values.lock().unwrap().get(name).cloned()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self.raw(name))
    }

    async fn set(&self, name: &str, value: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(ErrorKind::Other, "store unavailable").into());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.values
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

/// Chapter source serving canned chapters; unknown ids fail.
#[derive(Default)]
pub struct FakeSource {
    chapters: Mutex<HashMap<String, ChapterData>>,
    calls: AtomicUsize,
}

impl FakeSource {
    pub fn with_chapter(chapter_id: &str, pages: usize) -> Self {
        let source = Self::default();
        source.add_chapter(chapter_id, pages);
        source
    }

    pub fn add_chapter(&self, chapter_id: &str, pages: usize) {
        let data = ChapterData {
            domain_cdn: "https://cdn.test".to_string(),
            item: ChapterItem {
                id: chapter_id.to_string(),
                chapter_name: "1".to_string(),
                chapter_title: String::new(),
                chapter_path: format!("uploads/{}", chapter_id),
                chapter_image: (0..pages)
                    .map(|i| ChapterImage {
                        image_page: i as u32 + 1,
                        image_file: format!("page_{}.jpg", i),
                    })
                    .collect(),
            },
        };
        self.chapters
            .lock()
            .unwrap()
            .insert(chapter_id.to_string(), data);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChapterSource for FakeSource {
    async fn fetch_chapter(&self, chapter_id: &str) -> Result<ChapterData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.chapters
            .lock()
            .unwrap()
            .get(chapter_id)
            .cloned()
            .ok_or_else(|| MangaDockError::api(format!("no chapter {}", chapter_id)))
    }
}

/// File storage tracking paths in memory. Downloads can be held behind a
/// gate and individual URLs can be made to fail.
pub struct FakeStorage {
    files: Mutex<HashSet<PathBuf>>,
    dirs: Mutex<HashSet<PathBuf>>,
    downloads: Mutex<Vec<String>>,
    failing_urls: Mutex<HashSet<String>>,
    failing_delete: AtomicBool,
    gate: Semaphore,
}

impl Default for FakeStorage {
    fn default() -> Self {
        Self::with_permits(Semaphore::MAX_PERMITS)
    }
}

impl FakeStorage {
    fn with_permits(permits: usize) -> Self {
        Self {
            files: Mutex::default(),
            dirs: Mutex::default(),
            downloads: Mutex::default(),
            failing_urls: Mutex::default(),
            failing_delete: AtomicBool::new(false),
            gate: Semaphore::new(permits),
        }
    }

    /// Every download waits for a `release` permit.
    pub fn gated() -> Self {
        Self::with_permits(0)
    }

    pub fn release(&self, downloads: usize) {
        self.gate.add_permits(downloads);
    }

    pub fn fail_url(&self, url: &str) {
        self.failing_urls.lock().unwrap().insert(url.to_string());
    }

    pub fn heal_all(&self) {
        self.failing_urls.lock().unwrap().clear();
    }

    pub fn fail_deletes(&self, failing: bool) {
        self.failing_delete.store(failing, Ordering::SeqCst);
    }

    pub fn put_file(&self, path: PathBuf) {
        self.files.lock().unwrap().insert(path);
    }

    pub fn has_file(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains(path)
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    pub fn downloaded_urls(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl FileStorage for FakeStorage {
    async fn exists(&self, path: &Path) -> Result<bool> {
        tokio::task::yield_now().await;
        Ok(self.has_file(path) || self.dirs.lock().unwrap().contains(path))
    }

    async fn make_directory(&self, path: &Path, _recursive: bool) -> Result<()> {
        self.dirs.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    async fn download(&self, url: &str, path: &Path) -> Result<PathBuf> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e.to_string()))?;
        permit.forget();
        tokio::task::yield_now().await;

        self.downloads.lock().unwrap().push(url.to_string());
        if self.failing_urls.lock().unwrap().contains(url) {
            return Err(std::io::Error::new(ErrorKind::ConnectionReset, url.to_string()).into());
        }
        if !self.dirs.lock().unwrap().iter().any(|d| path.starts_with(d)) {
            return Err(std::io::Error::new(ErrorKind::NotFound, "no parent directory").into());
        }

        self.put_file(path.to_path_buf());
        Ok(path.to_path_buf())
    }

    async fn delete(&self, path: &Path, idempotent: bool) -> Result<()> {
        if self.failing_delete.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(ErrorKind::PermissionDenied, "read-only").into());
        }

        let mut dirs = self.dirs.lock().unwrap();
        let mut files = self.files.lock().unwrap();
        let existed = dirs.iter().any(|d| d.starts_with(path))
            || files.iter().any(|f| f.starts_with(path));
        if !existed && !idempotent {
            return Err(std::io::Error::new(ErrorKind::NotFound, "missing").into());
        }

        dirs.retain(|d| !d.starts_with(path));
        files.retain(|f| !f.starts_with(path));
        Ok(())
    }
}

pub fn manga(id: &str) -> Manga {
    Manga {
        id: id.to_string(),
        name: format!("Manga {}", id),
        slug: format!("manga-{}", id),
        thumb_url: format!("{}.jpg", id),
        updated_at: None,
        current_chapter: None,
        author: Some(vec!["Author".to_string()]),
        content: None,
        status: Some("ongoing".to_string()),
        chapters: None,
    }
}
