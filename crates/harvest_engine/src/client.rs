use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Rendering-capable clients should skip image/stylesheet/font/media
    /// subresources for speed. The plain HTTP clients have nothing to block.
    pub suppress_assets: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(45),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                         Chrome/118.0.0.0 Safari/537.36 (carharvest/0.1)"
                .to_string(),
            suppress_assets: true,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("navigation timed out")]
    Timeout,
    #[error("navigation error: {0}")]
    Navigation(String),
    #[error("http status {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
}

/// Fetches one rendered item detail document in an isolated context.
#[async_trait]
pub trait PageClient: Send + Sync {
    async fn fetch_document(&self, url: &str) -> Result<String, ClientError>;
}

/// Stateful navigation over a paginated listing.
///
/// Pagination transitions are relative to the results view established by
/// `open`, not absolute; `goto_page` is only meaningful after `open` has
/// succeeded on this session.
#[async_trait]
pub trait ListingSession: Send {
    /// Navigates to the listing root and enters the results view, returning
    /// the first page of results.
    async fn open(&mut self, root_url: &str) -> Result<String, ClientError>;

    /// Replays the pagination transition for the given 1-based page index
    /// and returns that page's document.
    async fn goto_page(&mut self, index: u32) -> Result<String, ClientError>;
}

/// Plain-HTTP `PageClient` for server-rendered detail pages.
#[derive(Debug, Clone)]
pub struct HttpPageClient {
    client: reqwest::Client,
}

impl HttpPageClient {
    pub fn new(settings: &ClientSettings) -> Result<Self, ClientError> {
        Ok(Self {
            client: build_client(settings, false)?,
        })
    }
}

#[async_trait]
impl PageClient for HttpPageClient {
    async fn fetch_document(&self, url: &str) -> Result<String, ClientError> {
        let parsed =
            Url::parse(url).map_err(|err| ClientError::InvalidUrl(err.to_string()))?;
        fetch_text(self.client.get(parsed)).await
    }
}

/// Cookie-keeping `ListingSession` that replays pagination transitions as
/// form posts keyed by page index against the listing root.
#[derive(Debug)]
pub struct HttpListingSession {
    client: reqwest::Client,
    root: Option<Url>,
    page_param: String,
}

impl HttpListingSession {
    pub fn new(settings: &ClientSettings) -> Result<Self, ClientError> {
        Ok(Self {
            client: build_client(settings, true)?,
            root: None,
            page_param: "p".to_string(),
        })
    }
}

#[async_trait]
impl ListingSession for HttpListingSession {
    async fn open(&mut self, root_url: &str) -> Result<String, ClientError> {
        let root =
            Url::parse(root_url).map_err(|err| ClientError::InvalidUrl(err.to_string()))?;
        let html = fetch_text(self.client.get(root.clone())).await?;
        self.root = Some(root);
        Ok(html)
    }

    async fn goto_page(&mut self, index: u32) -> Result<String, ClientError> {
        let root = self.root.clone().ok_or_else(|| {
            ClientError::Navigation("pagination requested before the listing was opened".into())
        })?;
        let request = self
            .client
            .post(root)
            .form(&[(self.page_param.as_str(), index.to_string())]);
        fetch_text(request).await
    }
}

fn build_client(
    settings: &ClientSettings,
    keep_cookies: bool,
) -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.request_timeout)
        .user_agent(settings.user_agent.clone())
        .cookie_store(keep_cookies)
        .build()
        .map_err(|err| ClientError::Network(err.to_string()))
}

async fn fetch_text(request: reqwest::RequestBuilder) -> Result<String, ClientError> {
    let response = request.send().await.map_err(map_reqwest_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Http(status.as_u16()));
    }
    response.text().await.map_err(map_reqwest_error)
}

fn map_reqwest_error(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        return ClientError::Timeout;
    }
    ClientError::Network(err.to_string())
}
