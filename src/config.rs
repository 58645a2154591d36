use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "MANGADOCK";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub downloads: DownloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the app documents directory; chapters land in `<documents_path>/downloads`.
    pub documents_path: PathBuf,
    pub database_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub max_concurrent_images: usize,
}

impl Config {
    /// Layers built-in defaults, the optional TOML file at `path` and
    /// `MANGADOCK_*` environment variables (`__` separates nested keys).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api: ApiConfig {
                base_url: "https://otruyenapi.com/v1/api".to_string(),
                timeout_secs: 10,
                connect_timeout_secs: 10,
                user_agent: "MangaDock/0.1".to_string(),
            },
            storage: StorageConfig {
                documents_path: PathBuf::from("./data"),
                database_url: "sqlite:data/mangadock.db".to_string(),
            },
            downloads: DownloadConfig {
                max_concurrent_images: 4,
            },
        }
    }
}
