use crate::error::Result;
use crate::traits::KeyValueStore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{debug, info};

/// SQLite-backed key-value store; each registry lives in one row.
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Connecting to database: {}", database_url);

        // Extract directory path from database URL
        if let Some(path) = database_url.strip_prefix("sqlite:") {
            let path = std::path::Path::new(path.trim_start_matches("//"));
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !database_url.contains(":memory:") {
                    info!("Creating directory: {:?}", parent);
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init().await?;
        info!("Database connected successfully");
        Ok(db)
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl KeyValueStore for Database {
    async fn get(&self, name: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv_store WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    async fn set(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (name, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(value)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        debug!("Persisted '{}' ({} bytes)", name, value.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_overwrites_previous_value() {
        let db = Database::new("sqlite::memory:").await.unwrap();

        assert_eq!(db.get("manga-downloads").await.unwrap(), None);

        db.set("manga-downloads", "{\"a\":1}").await.unwrap();
        db.set("manga-downloads", "{\"a\":2}").await.unwrap();

        assert_eq!(
            db.get("manga-downloads").await.unwrap().as_deref(),
            Some("{\"a\":2}")
        );
        assert_eq!(db.get("manga-favorites").await.unwrap(), None);
    }

    #[tokio::test]
    async fn values_survive_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("state/mangadock.db").display());

        {
            let db = Database::new(&url).await.unwrap();
            db.set("manga-favorites", "[]").await.unwrap();
            db.pool.close().await;
        }

        let db = Database::new(&url).await.unwrap();
        assert_eq!(db.get("manga-favorites").await.unwrap().as_deref(), Some("[]"));
    }
}
