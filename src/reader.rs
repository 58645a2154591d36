use crate::error::Result;
use crate::registry::ChapterRegistry;
use crate::traits::ChapterSource;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrigin {
    Local,
    Remote,
}

impl std::fmt::Display for PageOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageOrigin::Local => write!(f, "offline copy"),
            PageOrigin::Remote => write!(f, "remote"),
        }
    }
}

/// Pages of a chapter ready for display.
#[derive(Debug, Clone)]
pub struct ReadableChapter {
    pub title: String,
    pub origin: PageOrigin,
    pub pages: Vec<String>,
}

fn chapter_title(name: &str) -> String {
    if name.is_empty() {
        "Reader".to_string()
    } else {
        format!("Chapter {}", name)
    }
}

/// Resolves chapter pages, preferring a completed offline copy.
pub struct ChapterReader {
    registry: Arc<ChapterRegistry>,
    source: Arc<dyn ChapterSource>,
}

impl ChapterReader {
    pub fn new(registry: Arc<ChapterRegistry>, source: Arc<dyn ChapterSource>) -> Self {
        Self { registry, source }
    }

    pub async fn open(&self, chapter_id: &str) -> Result<ReadableChapter> {
        if let Some(record) = self.registry.get(chapter_id).filter(|r| r.is_completed()) {
            debug!("Reading {} from offline copy", chapter_id);
            return Ok(ReadableChapter {
                title: chapter_title(&record.chapter_name),
                origin: PageOrigin::Local,
                pages: record
                    .images
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect(),
            });
        }

        let chapter = self.source.fetch_chapter(chapter_id).await?;
        Ok(ReadableChapter {
            title: chapter_title(&chapter.item.chapter_name),
            origin: PageOrigin::Remote,
            pages: chapter.image_urls(),
        })
    }
}
