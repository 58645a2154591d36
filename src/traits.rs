use crate::error::Result;
use crate::models::ChapterData;
use std::path::{Path, PathBuf};

/// Source of chapter metadata and remote page locations
#[async_trait::async_trait]
pub trait ChapterSource: Send + Sync {
    /// Resolve a chapter by its API identifier
    async fn fetch_chapter(&self, chapter_id: &str) -> Result<ChapterData>;
}

/// Durable string-keyed blob storage that survives restarts
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<String>>;

    async fn set(&self, name: &str, value: &str) -> Result<()>;
}

/// Local file storage used for offline chapter pages
#[async_trait::async_trait]
pub trait FileStorage: Send + Sync {
    async fn exists(&self, path: &Path) -> Result<bool>;

    async fn make_directory(&self, path: &Path, recursive: bool) -> Result<()>;

    /// Download `url` into `path`; an existing file at `path` is always complete.
    async fn download(&self, url: &str, path: &Path) -> Result<PathBuf>;

    /// Recursively delete `path`. With `idempotent`, a missing path is not an error.
    async fn delete(&self, path: &Path, idempotent: bool) -> Result<()>;
}
