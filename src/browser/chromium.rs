//! Chromium over the DevTools protocol.

use std::collections::HashMap;

use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use url::Url;

use super::html::{extract_links, extract_text};
use super::{BrowserBackend, BrowserLauncher, BrowserOptions, PageId, PageSnapshot};

#[derive(Debug, Clone, Default)]
pub struct ChromiumLauncher;

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, options: &BrowserOptions) -> anyhow::Result<Box<dyn BrowserBackend>> {
        let (width, height) = options.window_size;
        let mut builder = BrowserConfig::builder()
            .window_size(width, height)
            .viewport(None);
        if !options.headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to launch browser: {}", e))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        tracing::info!(width, height, headless = options.headless, "Chromium launched");
        Ok(Box::new(ChromiumBackend {
            browser,
            pages: HashMap::new(),
            next_id: 0,
            handler_task,
        }))
    }
}

pub struct ChromiumBackend {
    browser: Browser,
    pages: HashMap<PageId, Page>,
    next_id: PageId,
    handler_task: tokio::task::JoinHandle<()>,
}

async fn snapshot(page: &Page) -> anyhow::Result<PageSnapshot> {
    let url: String = page
        .evaluate("window.location.href")
        .await?
        .into_value()
        .unwrap_or_default();
    let title: String = page
        .evaluate("document.title")
        .await?
        .into_value()
        .unwrap_or_default();
    let html = page.content().await?;
    let links = Url::parse(&url)
        .map(|base| extract_links(&html, &base))
        .unwrap_or_default();
    Ok(PageSnapshot {
        url,
        title,
        text: extract_text(&html),
        links,
    })
}

#[async_trait]
impl BrowserBackend for ChromiumBackend {
    async fn open_page(&mut self, url: &str) -> anyhow::Result<(PageId, PageSnapshot)> {
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open page: {}", e))?;
        page.wait_for_navigation().await?;
        let snap = snapshot(&page).await?;
        let id = self.next_id;
        self.next_id += 1;
        self.pages.insert(id, page);
        Ok((id, snap))
    }

    async fn goto(&mut self, page: PageId, url: &str) -> anyhow::Result<PageSnapshot> {
        let page = self
            .pages
            .get(&page)
            .ok_or_else(|| anyhow::anyhow!("Unknown page {}", page))?;
        page.goto(url)
            .await
            .map_err(|e| anyhow::anyhow!("Navigation failed: {}", e))?;
        snapshot(page).await
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        for (_, page) in self.pages.drain() {
            let _ = page.close().await;
        }
        self.browser.close().await?;
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        Ok(())
    }
}
