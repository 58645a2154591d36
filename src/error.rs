use thiserror::Error;

#[derive(Error, Debug)]
pub enum MangaDockError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Config serialization error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("ZIP compression error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("API error: {0}")]
    Api(String),

    #[error("Chapter not found: {0}")]
    ChapterNotFound(String),

    #[error("Chapter is not downloaded: {0}")]
    NotDownloaded(String),

    #[error("Another mangadock instance holds {path:?}: {source}")]
    AlreadyRunning {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl MangaDockError {
    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }

    pub fn chapter_not_found(chapter_id: impl Into<String>) -> Self {
        Self::ChapterNotFound(chapter_id.into())
    }

    pub fn not_downloaded(chapter_id: impl Into<String>) -> Self {
        Self::NotDownloaded(chapter_id.into())
    }
}

pub type Result<T> = std::result::Result<T, MangaDockError>;
