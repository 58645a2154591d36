use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

mod api;
mod config;
mod database;
mod downloader;
mod error;
mod lock;
mod models;
mod persist;
mod reader;
mod registry;
mod storage;
mod traits;
mod utils;

#[cfg(test)]
mod testing;

use api::{ListType, OtruyenClient};
use config::Config;
use database::Database;
use downloader::DownloadManager;
use lock::InstanceLock;
use models::{ChapterInfo, DownloadRecord, DownloadStatus, ListData, Manga};
use reader::ChapterReader;
use registry::{ChapterRegistry, FavoritesRegistry};
use storage::{ChapterLayout, StorageManager};
use traits::KeyValueStore;

#[derive(Parser)]
#[command(name = "mangadock")]
#[command(about = "Manga browser with offline chapter downloads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    #[command(flatten)]
    Library(LibraryCommand),
}

#[derive(Subcommand)]
enum LibraryCommand {
    /// Show the home listing
    Home,
    /// List manga by publication state
    List {
        #[arg(short, long, value_enum, default_value_t = ListType::New)]
        r#type: ListType,
        #[arg(short, long, default_value = "1")]
        page: u32,
    },
    /// List categories
    Categories,
    /// List manga of a category
    Category {
        slug: String,
        #[arg(short, long, default_value = "1")]
        page: u32,
    },
    /// Search manga by keyword
    Search { keyword: String },
    /// Show manga details and chapter download state
    Detail { slug: String },
    /// Download chapters of a manga for offline reading
    Download {
        /// Manga slug
        slug: String,
        /// Chapter names to download (e.g. "1" "2.5")
        chapters: Vec<String>,
        /// Download every chapter
        #[arg(short, long)]
        all: bool,
    },
    /// List downloaded chapters grouped by manga
    Downloads,
    /// Remove a downloaded chapter and its files
    Remove { chapter_id: String },
    /// Resolve the pages of a chapter, offline copy first
    Read { chapter_id: String },
    /// Export a downloaded chapter as a CBZ archive
    Export {
        chapter_id: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Manage favorites
    Favorite {
        #[command(subcommand)]
        action: FavoriteCommand,
    },
}

#[derive(Subcommand)]
enum FavoriteCommand {
    /// Add a manga by slug
    Add { slug: String },
    /// Remove a manga by id
    Remove { id: String },
    /// List favorites
    List,
}

impl LibraryCommand {
    /// Commands that write the registries or chapter files need the instance lock.
    fn writes_state(&self) -> bool {
        match self {
            LibraryCommand::Download { .. } | LibraryCommand::Remove { .. } => true,
            LibraryCommand::Favorite { action } => !matches!(action, FavoriteCommand::List),
            _ => false,
        }
    }
}

struct App {
    client: Arc<OtruyenClient>,
    downloads: Arc<DownloadManager>,
    favorites: FavoritesRegistry,
    reader: ChapterReader,
    _lock: Option<InstanceLock>,
}

impl App {
    /// Read-only apps never write the stores, so they can run next to a
    /// writer. A writing app holds the instance lock for its whole life.
    async fn new(config: &Config, writable: bool) -> Result<Self> {
        let lock = if writable {
            Some(InstanceLock::acquire(&config.storage.documents_path)?)
        } else {
            None
        };

        let client = Arc::new(OtruyenClient::new(&config.api)?);
        let http = utils::HttpClient::new(&config.api)?;
        let store: Arc<dyn KeyValueStore> = Arc::new(Database::new(&config.storage.database_url).await?);

        let registry = Arc::new(ChapterRegistry::load(store.clone()).await);
        if lock.is_some() {
            registry.reconcile_interrupted().await;
        }
        let favorites = FavoritesRegistry::load(store).await;

        let downloads = Arc::new(DownloadManager::new(
            client.clone(),
            Arc::new(StorageManager::new(http)),
            registry.clone(),
            ChapterLayout::new(&config.storage.documents_path),
            &config.downloads,
        ));
        let reader = ChapterReader::new(registry, client.clone());

        Ok(Self {
            client,
            downloads,
            favorites,
            reader,
            _lock: lock,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Init => init_config(&cli.config),
        Commands::Library(command) => {
            let config = Config::load(&cli.config)?;
            let app = App::new(&config, command.writes_state()).await?;
            run_command(&app, command).await
        }
    }
}

async fn run_command(app: &App, command: LibraryCommand) -> Result<()> {
    match command {
        LibraryCommand::Home => {
            let home = app.client.fetch_home().await?;
            print_listing(app, &home);
        }
        LibraryCommand::List { r#type, page } => {
            let list = app.client.fetch_manga_list(page, r#type).await?;
            print_listing(app, &list);
        }
        LibraryCommand::Categories => {
            let categories = app.client.fetch_category_list().await?;
            println!("{:<30} {:<30}", "Category", "Slug");
            println!("{}", "-".repeat(60));
            for category in categories.items {
                println!("{:<30} {:<30}", category.name, category.slug);
            }
        }
        LibraryCommand::Category { slug, page } => {
            let list = app.client.fetch_category_detail(&slug, page).await?;
            print_listing(app, &list);
        }
        LibraryCommand::Search { keyword } => {
            if keyword.chars().count() < 2 {
                warn!("Search keyword must be at least 2 characters");
                return Ok(());
            }
            let found = app.client.fetch_search(&keyword).await?;
            print_listing(app, &found);
        }
        LibraryCommand::Detail { slug } => {
            let manga = app.client.fetch_manga_detail(&slug).await?;
            show_detail(app, &manga);
        }
        LibraryCommand::Download { slug, chapters, all } => {
            run_download(app, &slug, &chapters, all).await?;
        }
        LibraryCommand::Downloads => show_downloads(app),
        LibraryCommand::Remove { chapter_id } => {
            if app.downloads.get_downloaded_chapter(&chapter_id).is_none() {
                println!("Chapter is not downloaded: {}", chapter_id);
            } else {
                app.downloads.remove_download(&chapter_id).await;
                println!("🗑️ Removed {}", chapter_id);
            }
        }
        LibraryCommand::Read { chapter_id } => {
            let chapter = app.reader.open(&chapter_id).await?;
            println!("📖 {} ({}, {} pages)", chapter.title, chapter.origin, chapter.pages.len());
            for page in chapter.pages {
                println!("{}", page);
            }
        }
        LibraryCommand::Export { chapter_id, output } => {
            let record = app
                .downloads
                .get_downloaded_chapter(&chapter_id)
                .ok_or_else(|| error::MangaDockError::chapter_not_found(&chapter_id))?;
            let output = output
                .unwrap_or_else(|| PathBuf::from(format!("{}-chapter-{}.cbz", record.manga_id, record.chapter_name)));
            let path = app.downloads.export_chapter(&chapter_id, &output).await?;
            println!("📦 Exported to {}", path.display());
        }
        LibraryCommand::Favorite { action } => run_favorite(app, action).await?,
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(format!("mangadock={}", level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn init_config(path: &str) -> Result<()> {
    if std::path::Path::new(path).exists() {
        info!("Configuration already exists at {}", path);
        return Ok(());
    }

    Config::default().save(path)?;
    info!("Wrote default configuration to {}", path);
    Ok(())
}

fn print_listing(app: &App, list: &ListData) {
    println!("{:<40} {:<30} {:<4}", "Title", "Slug", "Fav");
    println!("{}", "-".repeat(76));

    for manga in &list.items {
        let favorite = if app.favorites.is_favorite(&manga.id) { "★" } else { "" };
        println!("{:<40} {:<30} {:<4}", manga.name, manga.slug, favorite);
    }

    if let Some(params) = &list.params {
        let p = &params.pagination;
        println!(
            "Page {}/{} ({} items)",
            p.current_page,
            p.total_pages.max(1),
            p.total_items
        );
    }
}

fn show_detail(app: &App, manga: &Manga) {
    println!("📚 {} ({})", manga.name, manga.id);
    if let Some(authors) = &manga.author {
        println!("Author: {}", authors.join(", "));
    }
    if let Some(status) = &manga.status {
        println!("Status: {}", status);
    }
    if app.favorites.is_favorite(&manga.id) {
        println!("★ In favorites");
    }

    println!("{:<10} {:<12} {}", "Chapter", "Offline", "Chapter ID");
    println!("{}", "-".repeat(70));
    for entry in manga.chapter_entries() {
        let state = match app.downloads.get_downloaded_chapter(&entry.chapter_api_data) {
            Some(record) if record.status == DownloadStatus::Downloading => format!("{}%", record.progress),
            Some(record) => record.status.to_string(),
            None => "-".to_string(),
        };
        println!("{:<10} {:<12} {}", entry.chapter_name, state, entry.chapter_api_data);
    }
}

async fn run_download(app: &App, slug: &str, names: &[String], all: bool) -> Result<()> {
    let manga = app.client.fetch_manga_detail(slug).await?;

    let selected: Vec<ChapterInfo> = manga
        .chapter_entries()
        .filter(|entry| all || names.iter().any(|n| n == &entry.chapter_name))
        .map(ChapterInfo::from)
        .collect();

    if selected.is_empty() {
        warn!("No matching chapters for '{}'", manga.name);
        return Ok(());
    }

    info!("⬇️ Downloading {} chapters of {}", selected.len(), manga.name);

    let style = ProgressStyle::with_template("{msg:>12} [{bar:40}] {pos}/{len}")?.progress_chars("=> ");
    let multi = MultiProgress::new();
    let bars: HashMap<String, ProgressBar> = selected
        .iter()
        .map(|info| {
            let bar = multi.add(ProgressBar::new(0));
            bar.set_style(style.clone());
            bar.set_message(format!("Chapter {}", info.chapter_name));
            (info.chapter_api_data.clone(), bar)
        })
        .collect();

    let mut events = app.downloads.subscribe();
    let live_bars = bars.clone();
    let listener = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(record) => {
                    if let Some(bar) = live_bars.get(&record.chapter_id) {
                        show_progress(bar, &record);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Progress listener skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    futures::future::join_all(
        selected
            .iter()
            .map(|info| app.downloads.download_chapter(&manga, info)),
    )
    .await;
    listener.abort();

    // Queued events may be lost with the listener; the registry has the final state.
    let mut completed = 0;
    let mut failed = 0;
    for info in &selected {
        let record = app.downloads.get_downloaded_chapter(&info.chapter_api_data);
        if let Some(bar) = bars.get(&info.chapter_api_data) {
            match &record {
                Some(record) => show_progress(bar, record),
                None => bar.abandon_with_message("removed"),
            }
        }
        match record {
            Some(record) if record.is_completed() => completed += 1,
            _ => failed += 1,
        }
    }

    info!("📊 Download finished: {} completed, {} failed", completed, failed);
    Ok(())
}

fn show_progress(bar: &ProgressBar, record: &DownloadRecord) {
    bar.set_length(record.total_images as u64);
    bar.set_position(record.downloaded_images as u64);
    match record.status {
        DownloadStatus::Completed => bar.finish_with_message("done"),
        DownloadStatus::Failed => bar.abandon_with_message("failed"),
        DownloadStatus::Downloading => {}
    }
}

fn show_downloads(app: &App) {
    let groups = app.downloads.registry().by_manga();
    if groups.is_empty() {
        println!("No downloads yet.");
        return;
    }

    for (manga_id, records) in groups {
        println!("📚 {}", manga_id);
        for record in records {
            let state = match record.status {
                DownloadStatus::Completed => "Downloaded".to_string(),
                _ => format!("{} {}%", record.status, record.progress),
            };
            println!("  {:<10} {:<16} {}", record.chapter_name, state, record.chapter_id);
        }
    }
}

async fn run_favorite(app: &App, action: FavoriteCommand) -> Result<()> {
    match action {
        FavoriteCommand::Add { slug } => {
            let manga = app.client.fetch_manga_detail(&slug).await?;
            let name = manga.name.clone();
            if app.favorites.add_favorite(manga).await {
                println!("★ Added {}", name);
            } else {
                println!("{} is already a favorite", name);
            }
        }
        FavoriteCommand::Remove { id } => {
            if app.favorites.remove_favorite(&id).await {
                println!("Removed {} from favorites", id);
            } else {
                println!("{} is not a favorite", id);
            }
        }
        FavoriteCommand::List => {
            let favorites = app.favorites.favorites();
            if favorites.is_empty() {
                println!("No favorites yet.");
            }
            for manga in favorites {
                println!("{:<40} {:<30} {}", manga.name, manga.slug, manga.id);
            }
        }
    }
    Ok(())
}
