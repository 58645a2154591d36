use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{MangaDockError, Result};

/// Status envelope wrapped around every API payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn into_data(self) -> Result<T> {
        if self.status == "success" {
            Ok(self.data)
        } else {
            Err(MangaDockError::api(
                self.message.unwrap_or_else(|| format!("status '{}'", self.status)),
            ))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manga {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub thumb_url: String,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub current_chapter: Option<Vec<CurrentChapter>>,
    #[serde(default)]
    pub author: Option<Vec<String>>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub chapters: Option<Vec<ChapterServer>>,
}

impl Manga {
    /// Chapters of every server, in listing order.
    pub fn chapter_entries(&self) -> impl Iterator<Item = &ChapterEntry> {
        self.chapters
            .iter()
            .flatten()
            .flat_map(|server| server.server_data.iter())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentChapter {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChapterServer {
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub server_data: Vec<ChapterEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChapterEntry {
    #[serde(default)]
    pub filename: String,
    pub chapter_name: String,
    #[serde(default)]
    pub chapter_title: String,
    pub chapter_api_data: String,
}

/// Minimal chapter reference needed to start a download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChapterInfo {
    pub chapter_name: String,
    /// Chapter API URL; doubles as the chapter identifier.
    pub chapter_api_data: String,
}

impl From<&ChapterEntry> for ChapterInfo {
    fn from(entry: &ChapterEntry) -> Self {
        Self {
            chapter_name: entry.chapter_name.clone(),
            chapter_api_data: entry.chapter_api_data.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterData {
    pub item: ChapterItem,
    pub domain_cdn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterItem {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(default)]
    pub chapter_name: String,
    #[serde(default)]
    pub chapter_title: String,
    #[serde(default)]
    pub chapter_path: String,
    #[serde(default)]
    pub chapter_image: Vec<ChapterImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterImage {
    #[serde(default)]
    pub image_page: u32,
    pub image_file: String,
}

impl ChapterData {
    /// Remote URL of every page, in descriptor order.
    pub fn image_urls(&self) -> Vec<String> {
        self.item
            .chapter_image
            .iter()
            .map(|image| image_url(&self.domain_cdn, &self.item.chapter_path, &image.image_file))
            .collect()
    }
}

/// `cdn/path/file` when the chapter has a path segment, `cdn/file` otherwise.
/// Absolute image URLs are used as-is.
pub fn image_url(cdn_base: &str, chapter_path: &str, image_file: &str) -> String {
    if image_file.starts_with("http://") || image_file.starts_with("https://") {
        return image_file.to_string();
    }

    let cdn = cdn_base.trim_end_matches('/');
    let file = image_file.trim_start_matches('/');
    let path = chapter_path.trim_matches('/');

    if path.is_empty() {
        format!("{}/{}", cdn, file)
    } else {
        format!("{}/{}/{}", cdn, path, file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListData {
    #[serde(default)]
    pub items: Vec<Manga>,
    #[serde(default)]
    pub params: Option<ListParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListParams {
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total_items: u64,
    pub total_items_per_page: u64,
    pub current_page: u64,
    pub total_pages: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailData {
    pub item: Manga,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Category {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryListData {
    #[serde(default)]
    pub items: Vec<Category>,
}

/// Offline copy of one chapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub manga_id: String,
    pub chapter_id: String,
    pub chapter_name: String,
    pub images: Vec<PathBuf>,
    pub status: DownloadStatus,
    pub progress: u8,
    pub total_images: usize,
    pub downloaded_images: usize,
    /// Download attempt owning the record.
    #[serde(default = "Uuid::nil")]
    pub attempt: Uuid,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl DownloadRecord {
    pub fn new(manga_id: String, chapter_id: String, chapter_name: String) -> Self {
        Self {
            manga_id,
            chapter_id,
            chapter_name,
            images: Vec::new(),
            status: DownloadStatus::Downloading,
            progress: 0,
            total_images: 0,
            downloaded_images: 0,
            attempt: Uuid::new_v4(),
            updated_at: Some(Utc::now()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == DownloadStatus::Completed
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Failed,
}

/// `round(done / total * 100)`, 0 while the total is unknown.
pub fn progress_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (done as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadStatus::Downloading => write!(f, "Downloading"),
            DownloadStatus::Completed => write!(f, "Completed"),
            DownloadStatus::Failed => write!(f, "Failed"),
        }
    }
}
