//! Page loading over plain HTTP.
//!
//! No JavaScript runs. Cookies persist for the lifetime of the backend, so
//! a kept-alive session stays logged in across calls.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::html::{extract_links, extract_text, extract_title};
use super::{BrowserBackend, BrowserLauncher, BrowserOptions, PageId, PageSnapshot};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; crawl-crew/0.1)";

/// Launches [`HttpBackend`]s.
#[derive(Debug, Clone)]
pub struct HttpLauncher {
    timeout: Duration,
}

impl HttpLauncher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl BrowserLauncher for HttpLauncher {
    async fn launch(&self, options: &BrowserOptions) -> anyhow::Result<Box<dyn BrowserBackend>> {
        if !options.headless {
            tracing::debug!("HTTP browser backend has no window; ignoring headless=false");
        }
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .timeout(self.timeout)
            .build()?;
        Ok(Box::new(HttpBackend {
            client,
            pages: HashMap::new(),
            next_id: 0,
        }))
    }
}

pub struct HttpBackend {
    client: reqwest::Client,
    /// Last URL loaded per page.
    pages: HashMap<PageId, Url>,
    next_id: PageId,
}

impl HttpBackend {
    async fn fetch(&self, url: &str) -> anyhow::Result<(Url, PageSnapshot)> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().clone();

        if !status.is_success() {
            return Err(anyhow::anyhow!("HTTP error {} for {}", status, final_url));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_default();
        let body = response.text().await?;

        let looks_html = content_type.contains("html")
            || (content_type.is_empty() && body.trim_start().starts_with('<'));
        let snapshot = if looks_html {
            PageSnapshot {
                url: final_url.to_string(),
                title: extract_title(&body),
                text: extract_text(&body),
                links: extract_links(&body, &final_url),
            }
        } else {
            PageSnapshot {
                url: final_url.to_string(),
                title: String::new(),
                text: body,
                links: Vec::new(),
            }
        };
        Ok((final_url, snapshot))
    }
}

#[async_trait]
impl BrowserBackend for HttpBackend {
    async fn open_page(&mut self, url: &str) -> anyhow::Result<(PageId, PageSnapshot)> {
        let (final_url, snapshot) = self.fetch(url).await?;
        let id = self.next_id;
        self.next_id += 1;
        self.pages.insert(id, final_url);
        Ok((id, snapshot))
    }

    async fn goto(&mut self, page: PageId, url: &str) -> anyhow::Result<PageSnapshot> {
        // Relative URLs resolve against the page's current location.
        let target = match self.pages.get(&page) {
            Some(current) => current.join(url).map(|u| u.to_string()).unwrap_or_else(|_| url.to_string()),
            None => anyhow::bail!("Unknown page {}", page),
        };
        let (final_url, snapshot) = self.fetch(&target).await?;
        self.pages.insert(page, final_url);
        Ok(snapshot)
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.pages.clear();
        Ok(())
    }
}
