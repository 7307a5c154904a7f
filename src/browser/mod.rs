//! Browser sessions used by the navigator's `browse_web` tool.
//!
//! A [`BrowserBackend`] loads pages; [`BrowserSession`] layers tabs and a
//! per-tab reading position on top of it so a session kept alive between
//! calls resumes exactly where it stopped. [`SharedBrowser`] decides who
//! may use the single long-lived session.

mod html;
mod http;
mod lease;

#[cfg(feature = "browser")]
mod chromium;

pub use html::{decode_entities, extract_links, extract_text, extract_title};
pub use http::HttpLauncher;
pub use lease::{BrowserLease, BrowserState, LeaseError, SessionHandle, SharedBrowser};

#[cfg(feature = "browser")]
pub use chromium::ChromiumLauncher;

use async_trait::async_trait;
use serde::Serialize;

/// How browser windows are launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserOptions {
    pub headless: bool,
    pub window_size: (u32, u32),
    /// Keep the shared session open after a call that asked for continuity.
    pub keep_alive: bool,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: true,
            window_size: (1280, 720),
            keep_alive: true,
        }
    }
}

/// A hyperlink found on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub text: String,
    pub href: String,
}

/// What a backend reports after loading a page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub text: String,
    pub links: Vec<Link>,
}

/// Backend-specific identifier of an open page.
pub type PageId = usize;

/// Loads pages. Implemented over plain HTTP and over Chromium.
#[async_trait]
pub trait BrowserBackend: Send {
    /// Open a new page (tab) at `url`.
    async fn open_page(&mut self, url: &str) -> anyhow::Result<(PageId, PageSnapshot)>;

    /// Load `url` in an existing page.
    async fn goto(&mut self, page: PageId, url: &str) -> anyhow::Result<PageSnapshot>;

    /// Close every page and release the browser process, if any.
    async fn shutdown(&mut self) -> anyhow::Result<()>;
}

/// Starts backends.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &BrowserOptions) -> anyhow::Result<Box<dyn BrowserBackend>>;
}

/// Characters returned per read of a page.
pub const READ_CHUNK_CHARS: usize = 4_000;

struct Tab {
    page: PageId,
    snapshot: PageSnapshot,
    /// Characters of `snapshot.text` already read.
    offset: usize,
}

/// Summary of one open tab.
#[derive(Debug, Clone, Serialize)]
pub struct TabSummary {
    pub index: usize,
    pub url: String,
    pub title: String,
    pub active: bool,
}

/// One chunk of page text.
#[derive(Debug, Clone, Serialize)]
pub struct PageView {
    pub url: String,
    pub title: String,
    pub text: String,
    pub offset: usize,
    pub total_chars: usize,
    pub has_more: bool,
}

/// Open tabs plus reading positions over a backend.
pub struct BrowserSession {
    backend: Box<dyn BrowserBackend>,
    tabs: Vec<Tab>,
    active: usize,
    closed: bool,
}

impl BrowserSession {
    pub fn new(backend: Box<dyn BrowserBackend>) -> Self {
        Self {
            backend,
            tabs: Vec::new(),
            active: 0,
            closed: false,
        }
    }

    /// Load `url` in the active tab, opening the first tab if needed.
    pub async fn navigate(&mut self, url: &str) -> anyhow::Result<&PageSnapshot> {
        self.ensure_open()?;
        if self.tabs.is_empty() {
            return self.open_tab(url).await;
        }
        let tab = &mut self.tabs[self.active];
        tab.snapshot = self.backend.goto(tab.page, url).await?;
        tab.offset = 0;
        Ok(&tab.snapshot)
    }

    pub async fn open_tab(&mut self, url: &str) -> anyhow::Result<&PageSnapshot> {
        self.ensure_open()?;
        let (page, snapshot) = self.backend.open_page(url).await?;
        self.tabs.push(Tab {
            page,
            snapshot,
            offset: 0,
        });
        self.active = self.tabs.len() - 1;
        Ok(&self.tabs[self.active].snapshot)
    }

    pub fn switch_tab(&mut self, index: usize) -> anyhow::Result<&PageSnapshot> {
        if index >= self.tabs.len() {
            anyhow::bail!("No tab {} ({} open)", index, self.tabs.len());
        }
        self.active = index;
        Ok(&self.tabs[index].snapshot)
    }

    /// Next chunk of the active page, advancing its reading position.
    pub fn read(&mut self, max_chars: usize) -> Option<PageView> {
        let tab = self.tabs.get_mut(self.active)?;
        let total_chars = tab.snapshot.text.chars().count();
        let start = tab.offset.min(total_chars);
        let text: String = tab
            .snapshot
            .text
            .chars()
            .skip(start)
            .take(max_chars.max(1))
            .collect();
        tab.offset = start + text.chars().count();
        Some(PageView {
            url: tab.snapshot.url.clone(),
            title: tab.snapshot.title.clone(),
            text,
            offset: start,
            total_chars,
            has_more: tab.offset < total_chars,
        })
    }

    pub fn current(&self) -> Option<&PageSnapshot> {
        self.tabs.get(self.active).map(|t| &t.snapshot)
    }

    pub fn tabs(&self) -> Vec<TabSummary> {
        self.tabs
            .iter()
            .enumerate()
            .map(|(index, tab)| TabSummary {
                index,
                url: tab.snapshot.url.clone(),
                title: tab.snapshot.title.clone(),
                active: index == self.active,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Shut the backend down. Further navigation fails.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.tabs.clear();
        self.backend.shutdown().await
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed {
            anyhow::bail!("Browser session is closed");
        }
        Ok(())
    }
}
