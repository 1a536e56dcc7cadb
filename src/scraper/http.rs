//! HTTP transport for history pages.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::redirect;
use std::time::Duration;
use tracing::debug;

use super::session::{cookie_header, CookieSet};
use super::SITE_REFERER;
use crate::error::ScrapeError;

const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

/// A fetched response, with enough context to spot login redirects
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    /// `Location` header of a redirect that was not followed
    pub redirect_location: Option<String>,
    pub body: String,
}

impl FetchedPage {
    /// A plain 200 response, as served without redirects
    pub fn ok(url: &str, body: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            final_url: url.to_string(),
            status: 200,
            redirect_location: None,
            body: body.into(),
        }
    }
}

/// Something that can GET a page with a given cookie set
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get(&self, url: &str, cookies: &CookieSet) -> Result<FetchedPage, ScrapeError>;
}

/// Headers a desktop browser sends for a top-level navigation
pub fn browser_headers() -> HeaderMap {
    let user_agent = USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0]);

    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(user_agent));
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9,zh-TW;q=0.8,zh;q=0.7"),
    );
    headers.insert(header::REFERER, HeaderValue::from_static(SITE_REFERER));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));
    headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("document"));
    headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("navigate"));
    headers.insert("Sec-Fetch-Site", HeaderValue::from_static("same-origin"));
    headers
}

/// Follow redirects, but hand login redirects back to the caller
fn redirect_policy() -> redirect::Policy {
    redirect::Policy::custom(|attempt| {
        if attempt.url().as_str().to_ascii_lowercase().contains("login") {
            attempt.stop()
        } else if attempt.previous().len() >= 10 {
            attempt.error("too many redirects")
        } else {
            attempt.follow()
        }
    })
}

/// reqwest-backed fetcher
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .redirect(redirect_policy())
            .pool_max_idle_per_host(20)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn get(&self, url: &str, cookies: &CookieSet) -> Result<FetchedPage, ScrapeError> {
        let mut request = self.client.get(url).headers(browser_headers());
        if !cookies.is_empty() {
            request = request.header(header::COOKIE, cookie_header(cookies));
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let redirect_location = if response.status().is_redirection() {
            response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        } else {
            None
        };
        let body = response.text().await?;

        debug!("GET {} -> {} ({} bytes)", url, status, body.len());

        Ok(FetchedPage {
            url: url.to_string(),
            final_url,
            status,
            redirect_location,
            body,
        })
    }
}
