//! Fetch-and-parse boundary. The worker pool only ever sees
//! `fetch(url) → records + follow-up URLs`; what happens to the HTML in
//! between is the extractor's business.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use tracing::{info, warn};

use dealscout_common::Listing;

use crate::extract::ListingExtractor;

/// One fetched-and-parsed page: the listings it carried and the frontier
/// URLs it points at (pagination, category links).
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub listings: Vec<Listing>,
    pub next_urls: Vec<String>,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
    fn name(&self) -> &str;
}

/// Max retry attempts for transient HTTP failures.
const FETCH_MAX_ATTEMPTS: u32 = 3;
/// Base backoff duration. Actual delay is base * 2^attempt + jitter.
const FETCH_RETRY_BASE: Duration = Duration::from_millis(500);

// --- reqwest-backed fetcher ---

/// Plain HTTP fetcher with bounded retry; hands the body to an extractor.
pub struct HttpPageFetcher {
    client: reqwest::Client,
    extractor: Arc<dyn ListingExtractor>,
}

impl HttpPageFetcher {
    pub fn new(extractor: Arc<dyn ListingExtractor>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("dealscout/0.1")
            .build()
            .expect("Failed to build HTTP client");
        Self { client, extractor }
    }

    async fn get_with_retry(&self, url: &str) -> Result<String> {
        let parsed = url::Url::parse(url).context("Invalid URL")?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            anyhow::bail!("Only http/https URLs are allowed, got: {}", parsed.scheme());
        }

        let mut last_err = None;
        for attempt in 0..FETCH_MAX_ATTEMPTS {
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(
                        url,
                        status = resp.status().as_u16(),
                        attempt = attempt + 1,
                        "Server error, retrying after backoff"
                    );
                    last_err = Some(anyhow::anyhow!("server returned {}", resp.status()));
                }
                Ok(resp) => {
                    let resp = resp
                        .error_for_status()
                        .with_context(|| format!("Fetch failed for {url}"))?;
                    return resp.text().await.context("Failed to read response body");
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!(url, attempt = attempt + 1, error = %e, "Fetch failed, retrying after backoff");
                    last_err = Some(e.into());
                }
                Err(e) => return Err(e).with_context(|| format!("Fetch failed for {url}")),
            }

            if attempt + 1 < FETCH_MAX_ATTEMPTS {
                let backoff = FETCH_RETRY_BASE * 2u32.pow(attempt);
                let jitter = Duration::from_millis(rand::rng().random_range(0..250));
                tokio::time::sleep(backoff + jitter).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Fetch failed for {url}")))
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let html = self.get_with_retry(url).await?;

        if html.trim().is_empty() {
            warn!(url, fetcher = "http", "Empty response body");
            return Ok(FetchedPage::default());
        }

        let page = self.extractor.extract(&html, url);
        info!(
            url,
            fetcher = "http",
            listings = page.listings.len(),
            next_urls = page.next_urls.len(),
            "Fetched page"
        );
        Ok(page)
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Rewrite a start URL to ask the source for newest-first ordering,
/// preserving any existing query parameters. Unparseable URLs pass through
/// untouched.
pub fn newest_first_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut u) => {
            let mut pairs: Vec<(String, String)> = u
                .query_pairs()
                .filter(|(k, _)| k != "sort")
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            pairs.push(("sort".to_string(), "PUBLISHED_DESC".to_string()));
            u.query_pairs_mut().clear().extend_pairs(pairs);
            u.to_string()
        }
        Err(_) => url.to_string(),
    }
}
