use crate::config::ApiConfig;
use crate::error::Result;
use crate::models::{ApiResponse, CategoryListData, ChapterData, DetailData, ListData, Manga};
use crate::traits::ChapterSource;
use crate::utils::HttpClient;
use tracing::{debug, info};
use url::Url;

/// Listing filters accepted by `/danh-sach/{type}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ListType {
    /// Newly added
    #[default]
    New,
    /// Coming soon
    Upcoming,
    /// Ongoing
    Ongoing,
    /// Finished
    Completed,
}

impl ListType {
    pub fn slug(&self) -> &'static str {
        match self {
            ListType::New => "truyen-moi",
            ListType::Upcoming => "sap-ra-mat",
            ListType::Ongoing => "dang-phat-hanh",
            ListType::Completed => "hoan-thanh",
        }
    }
}

/// Client for the otruyen content API.
#[derive(Clone)]
pub struct OtruyenClient {
    http: HttpClient,
    base_url: String,
}

impl OtruyenClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&format!("{}/{}", self.base_url, path.trim_start_matches('/')))?)
    }

    fn paged(&self, path: &str, page: u32) -> Result<Url> {
        let mut url = self.endpoint(path)?;
        url.query_pairs_mut().append_pair("page", &page.to_string());
        Ok(url)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response: ApiResponse<T> = self.http.get_json(url.as_str()).await?;
        response.into_data()
    }

    pub async fn fetch_home(&self) -> Result<ListData> {
        self.get(self.endpoint("home")?).await
    }

    pub async fn fetch_manga_list(&self, page: u32, list_type: ListType) -> Result<ListData> {
        self.get(self.paged(&format!("danh-sach/{}", list_type.slug()), page)?).await
    }

    pub async fn fetch_category_list(&self) -> Result<CategoryListData> {
        self.get(self.endpoint("the-loai")?).await
    }

    pub async fn fetch_category_detail(&self, slug: &str, page: u32) -> Result<ListData> {
        self.get(self.paged(&format!("the-loai/{}", slug), page)?).await
    }

    pub async fn fetch_manga_detail(&self, slug: &str) -> Result<Manga> {
        let detail: DetailData = self.get(self.endpoint(&format!("truyen-tranh/{}", slug))?).await?;
        Ok(detail.item)
    }

    pub async fn fetch_search(&self, keyword: &str) -> Result<ListData> {
        let mut url = self.endpoint("tim-kiem")?;
        url.query_pairs_mut().append_pair("keyword", keyword);
        self.get(url).await
    }

    /// Chapter identifiers are absolute API URLs; relative ones resolve against the base.
    fn chapter_url(&self, chapter_id: &str) -> Result<Url> {
        match Url::parse(chapter_id) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => self.endpoint(chapter_id),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl ChapterSource for OtruyenClient {
    async fn fetch_chapter(&self, chapter_id: &str) -> Result<ChapterData> {
        let url = self.chapter_url(chapter_id)?;
        debug!("Fetching chapter metadata from {}", url);

        let data: ChapterData = self.get(url).await?;
        info!(
            "Resolved chapter {} with {} images",
            data.item.chapter_name,
            data.item.chapter_image.len()
        );
        Ok(data)
    }
}
