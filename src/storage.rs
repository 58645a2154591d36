use crate::error::Result;
use crate::traits::FileStorage;
use crate::utils::{encode_uri_component, HttpClient};
use futures::StreamExt;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::write::FileOptions;

/// Deterministic on-disk layout of offline chapters:
/// `<documents>/downloads/<manga_id>/<encoded chapter_id>/<index>.jpg`.
#[derive(Debug, Clone)]
pub struct ChapterLayout {
    downloads_root: PathBuf,
}

impl ChapterLayout {
    /// Relative documents paths are anchored to the current directory once,
    /// so stored page paths stay valid from any later working directory.
    pub fn new(documents_path: impl AsRef<Path>) -> Self {
        let documents_path = documents_path.as_ref();
        let documents_path = std::path::absolute(documents_path).unwrap_or_else(|e| {
            warn!("Cannot resolve {:?}, using it as given: {}", documents_path, e);
            documents_path.to_path_buf()
        });
        Self {
            downloads_root: documents_path.join("downloads"),
        }
    }

    pub fn chapter_dir(&self, manga_id: &str, chapter_id: &str) -> PathBuf {
        self.downloads_root
            .join(manga_id)
            .join(encode_uri_component(chapter_id))
    }

    pub fn page_path(&self, chapter_dir: &Path, index: usize) -> PathBuf {
        chapter_dir.join(format!("{}.jpg", index))
    }
}

/// Local file system storage; downloads go through the shared HTTP client.
pub struct StorageManager {
    http_client: HttpClient,
}

impl StorageManager {
    pub fn new(http_client: HttpClient) -> Self {
        Self { http_client }
    }

    async fn stream_to(&self, url: &str, part_path: &Path) -> Result<u64> {
        let response = self.http_client.get_raw(url).await?;
        let mut file = tokio::fs::File::create(part_path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

fn part_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}.{}.part", name, Uuid::new_v4()))
}

#[async_trait::async_trait]
impl FileStorage for StorageManager {
    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn make_directory(&self, path: &Path, recursive: bool) -> Result<()> {
        let created = if recursive {
            tokio::fs::create_dir_all(path).await
        } else {
            tokio::fs::create_dir(path).await
        };

        match created {
            Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn download(&self, url: &str, path: &Path) -> Result<PathBuf> {
        // Stream into a unique part file, then rename into place.
        let part = part_path(path);

        match self.stream_to(url, &part).await {
            Ok(bytes) => {
                tokio::fs::rename(&part, path).await?;
                debug!("Downloaded {} ({} bytes) to {:?}", url, bytes, path);
                Ok(path.to_path_buf())
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&part).await {
                    debug!("No part file to clean up at {:?}: {}", part, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, path: &Path, idempotent: bool) -> Result<()> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if idempotent && e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }

        info!("Removed {:?}", path);
        Ok(())
    }
}

/// Packs chapter pages, in order, into a comic book archive at `zip_path`.
pub async fn create_chapter_cbz(images: &[PathBuf], zip_path: &Path) -> Result<PathBuf> {
    info!("Creating CBZ archive: {:?}", zip_path);

    if let Some(parent) = zip_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let file = std::fs::File::create(zip_path)?;
    let mut zip = zip::ZipWriter::new(file);

    for (index, image) in images.iter().enumerate() {
        let extension = image
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "jpg".to_string());

        zip.start_file(format!("{:03}.{}", index, extension), FileOptions::default())?;

        let content = tokio::fs::read(image).await?;
        zip.write_all(&content)?;
    }

    zip.finish()?;

    if images.is_empty() {
        warn!("CBZ archive {:?} has no pages", zip_path);
    }
    info!("Created CBZ archive: {:?}", zip_path);
    Ok(zip_path.to_path_buf())
}
