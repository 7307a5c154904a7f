//! `browse_web`: instruction-driven browsing.
//!
//! Each call runs a small model loop over page actions (navigate, read,
//! tabs, search). With `keep_session_alive` the call works in the shared
//! session leased to the caller's thread, so the next call resumes on the
//! same tabs; otherwise it gets a throwaway session.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{Tool, ToolContext, ToolRegistry};
use crate::agents::{prompts, run_tool_loop};
use crate::browser::{LeaseError, SessionHandle, SharedBrowser, READ_CHUNK_CHARS};
use crate::llm::{ChatMessage, ModelHandle};

/// Appended to the instruction in URL-only mode.
const URL_ONLY_SUFFIX: &str =
    "Only return the final URL of the page you end up on. Do not extract or summarize any page content.";

const NO_RESULT: &str = "Browsing finished without a clear result. Try again with a different, more specific instruction.";

const LINKS_SHOWN: usize = 30;

pub struct BrowseWeb {
    browser: Arc<SharedBrowser>,
    model: ModelHandle,
    max_steps: usize,
}

impl BrowseWeb {
    pub fn new(browser: Arc<SharedBrowser>, model: ModelHandle, max_steps: usize) -> Self {
        Self {
            browser,
            model,
            max_steps,
        }
    }

    async fn drive(
        &self,
        session: SessionHandle,
        task: &str,
        url_only: bool,
        ctx: &ToolContext,
    ) -> anyhow::Result<String> {
        let actions = page_actions(&session);
        // Inner page actions stay out of the caller's event stream.
        let inner_ctx = ToolContext::new(ctx.artifact_dir.clone(), ctx.thread_id.clone());
        let conversation = vec![
            ChatMessage::system(prompts::browser_persona()),
            ChatMessage::user(task),
        ];

        let outcome =
            run_tool_loop(&self.model, conversation, &actions, &inner_ctx, self.max_steps).await?;

        let current_url = session.lock().await.current().map(|p| p.url.clone());
        let answer = outcome.answer.trim().to_string();

        if url_only {
            return Ok(first_url(&answer)
                .map(str::to_string)
                .or(current_url)
                .unwrap_or_else(|| NO_RESULT.to_string()));
        }
        if answer.is_empty() {
            return Ok(match current_url {
                Some(url) if outcome.exhausted => format!(
                    "{} (stopped after {} browser steps; last page: {})",
                    NO_RESULT, outcome.steps, url
                ),
                _ => NO_RESULT.to_string(),
            });
        }
        if outcome.exhausted {
            return Ok(format!(
                "{}\n\n(stopped after {} browser steps; the result may be incomplete)",
                answer, outcome.steps
            ));
        }
        Ok(answer)
    }
}

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"'`)\]]+"#).expect("valid regex"))
}

fn first_url(text: &str) -> Option<&str> {
    url_pattern()
        .find(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']))
}

#[async_trait]
impl Tool for BrowseWeb {
    fn name(&self) -> &str {
        "browse_web"
    }

    fn description(&self) -> &str {
        "Operate a web browser from a natural-language instruction (open sites, search, follow links, read pages). Returns what was found. Set keep_session_alive to continue in the same browser tabs on the next call."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "instruction": {
                    "type": "string",
                    "description": "What to do in the browser, in plain language."
                },
                "return_url_only": {
                    "type": "boolean",
                    "description": "Return only the final page URL instead of page content (default false)."
                },
                "keep_session_alive": {
                    "type": "boolean",
                    "description": "Keep the browser session open so the next call continues from the same pages (default false)."
                }
            },
            "required": ["instruction"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let instruction = args["instruction"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Missing 'instruction' argument"))?;
        let url_only = args["return_url_only"].as_bool().unwrap_or(false);
        let keep_alive = args["keep_session_alive"].as_bool().unwrap_or(false);

        let task = if url_only {
            format!("{}\n\n{}", instruction, URL_ONLY_SUFFIX)
        } else {
            instruction.to_string()
        };

        tracing::info!(
            thread = %ctx.thread_id,
            url_only,
            keep_alive,
            "browse_web: {}",
            instruction
        );

        if keep_alive {
            let holder = ctx.thread_id.to_string();
            let lease = match self.browser.try_acquire(&holder).await {
                Ok(lease) => lease,
                Err(LeaseError::Held { holder: other }) => {
                    return Ok(format!(
                        "The shared browser session is in use by another conversation ({}). Retry later, or call browse_web with keep_session_alive=false to use a fresh session.",
                        other
                    ));
                }
                Err(e) => return Err(e.into()),
            };
            let result = self.drive(lease.handle(), &task, url_only, ctx).await;
            if !self.browser.options().keep_alive {
                if let Err(e) = self.browser.release(&holder).await {
                    tracing::warn!("Failed to release shared browser: {}", e);
                }
            }
            result
        } else {
            let session: SessionHandle = Arc::new(Mutex::new(self.browser.ephemeral().await?));
            let result = self.drive(session.clone(), &task, url_only, ctx).await;
            if let Err(e) = session.lock().await.close().await {
                tracing::warn!("Failed to close browser session: {}", e);
            }
            result
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Page actions offered to the inner browsing model
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum PageAction {
    Navigate,
    OpenTab,
    SwitchTab,
    ReadPage,
    ListTabs,
    FindLinks,
    Search,
}

const ALL_ACTIONS: [PageAction; 7] = [
    PageAction::Navigate,
    PageAction::OpenTab,
    PageAction::SwitchTab,
    PageAction::ReadPage,
    PageAction::ListTabs,
    PageAction::FindLinks,
    PageAction::Search,
];

fn page_actions(session: &SessionHandle) -> ToolRegistry {
    ALL_ACTIONS
        .iter()
        .fold(ToolRegistry::new(), |registry, action| {
            registry.with(Arc::new(PageTool {
                action: *action,
                session: session.clone(),
            }))
        })
}

struct PageTool {
    action: PageAction,
    session: SessionHandle,
}

fn required_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args[key]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("Missing '{}' argument", key))
}

/// Page header, first text chunk, and the leading links.
fn describe_page(session: &mut crate::browser::BrowserSession) -> String {
    let Some(view) = session.read(READ_CHUNK_CHARS) else {
        return "No page is open.".to_string();
    };
    let mut out = format!("URL: {}\nTitle: {}\n\n{}", view.url, view.title, view.text);
    if view.has_more {
        out.push_str(&format!(
            "\n\n[showing {} of {} characters; call read_page for more]",
            view.offset + view.text.chars().count(),
            view.total_chars
        ));
    }
    if let Some(page) = session.current() {
        if !page.links.is_empty() {
            out.push_str("\n\nLinks:");
            for link in page.links.iter().take(LINKS_SHOWN) {
                out.push_str(&format!("\n- {} -> {}", link.text, link.href));
            }
            if page.links.len() > LINKS_SHOWN {
                out.push_str(&format!(
                    "\n... {} more (use find_links)",
                    page.links.len() - LINKS_SHOWN
                ));
            }
        }
    }
    out
}

#[async_trait]
impl Tool for PageTool {
    fn name(&self) -> &str {
        match self.action {
            PageAction::Navigate => "navigate",
            PageAction::OpenTab => "open_tab",
            PageAction::SwitchTab => "switch_tab",
            PageAction::ReadPage => "read_page",
            PageAction::ListTabs => "list_tabs",
            PageAction::FindLinks => "find_links",
            PageAction::Search => "web_search",
        }
    }

    fn description(&self) -> &str {
        match self.action {
            PageAction::Navigate => "Load a URL in the current tab and show the start of the page.",
            PageAction::OpenTab => "Open a URL in a new tab and switch to it.",
            PageAction::SwitchTab => "Switch to an open tab by index.",
            PageAction::ReadPage => "Continue reading the current page from where the last read stopped.",
            PageAction::ListTabs => "List open tabs.",
            PageAction::FindLinks => "List links on the current page whose text or URL contains a filter.",
            PageAction::Search => "Search the web and show the result page.",
        }
    }

    fn parameters_schema(&self) -> Value {
        match self.action {
            PageAction::Navigate | PageAction::OpenTab => json!({
                "type": "object",
                "properties": {"url": {"type": "string", "description": "Absolute URL"}},
                "required": ["url"]
            }),
            PageAction::SwitchTab => json!({
                "type": "object",
                "properties": {"index": {"type": "integer", "description": "Tab index from list_tabs"}},
                "required": ["index"]
            }),
            PageAction::FindLinks => json!({
                "type": "object",
                "properties": {"filter": {"type": "string", "description": "Case-insensitive text to look for"}},
                "required": ["filter"]
            }),
            PageAction::Search => json!({
                "type": "object",
                "properties": {"query": {"type": "string", "description": "Search query"}},
                "required": ["query"]
            }),
            PageAction::ReadPage | PageAction::ListTabs => json!({
                "type": "object",
                "properties": {}
            }),
        }
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        let mut session = self.session.lock().await;
        match self.action {
            PageAction::Navigate => {
                session.navigate(required_str(&args, "url")?).await?;
                Ok(describe_page(&mut session))
            }
            PageAction::OpenTab => {
                session.open_tab(required_str(&args, "url")?).await?;
                Ok(describe_page(&mut session))
            }
            PageAction::SwitchTab => {
                let index = args["index"]
                    .as_u64()
                    .ok_or_else(|| anyhow::anyhow!("Missing 'index' argument"))?;
                let page = session.switch_tab(index as usize)?;
                Ok(format!("Switched to tab {}: {} ({})", index, page.title, page.url))
            }
            PageAction::ReadPage => match session.read(READ_CHUNK_CHARS) {
                None => Ok("No page is open. Use navigate first.".to_string()),
                Some(view) if view.text.is_empty() => {
                    Ok(format!("End of page reached ({} characters).", view.total_chars))
                }
                Some(view) => {
                    let mut out = view.text;
                    if view.has_more {
                        out.push_str("\n\n[more text follows; call read_page again]");
                    } else {
                        out.push_str("\n\n[end of page]");
                    }
                    Ok(out)
                }
            },
            PageAction::ListTabs => {
                let tabs = session.tabs();
                if tabs.is_empty() {
                    return Ok("No tabs open.".to_string());
                }
                Ok(tabs
                    .iter()
                    .map(|t| {
                        format!(
                            "{}{}: {} ({})",
                            if t.active { "* " } else { "  " },
                            t.index,
                            t.title,
                            t.url
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            PageAction::FindLinks => {
                let filter = required_str(&args, "filter")?.to_lowercase();
                let Some(page) = session.current() else {
                    return Ok("No page is open. Use navigate first.".to_string());
                };
                let found: Vec<String> = page
                    .links
                    .iter()
                    .filter(|l| {
                        l.text.to_lowercase().contains(&filter) || l.href.to_lowercase().contains(&filter)
                    })
                    .take(50)
                    .map(|l| format!("- {} -> {}", l.text, l.href))
                    .collect();
                if found.is_empty() {
                    Ok(format!("No links matching '{}'", filter))
                } else {
                    Ok(found.join("\n"))
                }
            }
            PageAction::Search => {
                let query = required_str(&args, "query")?;
                let url = format!(
                    "https://html.duckduckgo.com/html/?q={}",
                    urlencoding::encode(query)
                );
                session.navigate(&url).await?;
                Ok(describe_page(&mut session))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserOptions, BrowserState};
    use crate::testutil::{text, tool_call, FakeLauncher, ScriptedLlm};
    use crate::threads::ThreadId;

    fn setup(
        responses: Vec<crate::llm::ChatResponse>,
        options: BrowserOptions,
    ) -> (BrowseWeb, Arc<SharedBrowser>, Arc<FakeLauncher>, Arc<ScriptedLlm>) {
        let launcher = Arc::new(FakeLauncher::default());
        let browser = Arc::new(SharedBrowser::new(launcher.clone(), options));
        let llm = Arc::new(ScriptedLlm::new(responses));
        let tool = BrowseWeb::new(browser.clone(), llm.handle(), 10);
        (tool, browser, launcher, llm)
    }

    fn ctx(thread: &str) -> ToolContext {
        ToolContext::new("/tmp/artifacts", ThreadId::new(thread))
    }

    #[tokio::test]
    async fn test_continuity_calls_share_one_session() {
        let (tool, browser, launcher, _llm) = setup(
            vec![
                tool_call("navigate", json!({"url": "https://a.test/long"})),
                text("Opened the page."),
                tool_call("read_page", json!({})),
                text("Read more."),
            ],
            BrowserOptions::default(),
        );

        let args = json!({"instruction": "open a.test", "keep_session_alive": true});
        assert_eq!(tool.execute(args, &ctx("t1")).await.unwrap(), "Opened the page.");
        let args = json!({"instruction": "keep reading", "keep_session_alive": true});
        assert_eq!(tool.execute(args, &ctx("t1")).await.unwrap(), "Read more.");

        assert_eq!(launcher.launches(), 1);
        match browser.state().await {
            BrowserState::Active { holder, tabs, .. } => {
                assert_eq!(holder, "t1");
                assert_eq!(tabs[0].url, "https://a.test/long");
            }
            other => panic!("expected active session, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_thread_is_refused_while_held() {
        let (tool, browser, _launcher, llm) = setup(vec![text("done")], BrowserOptions::default());
        browser.try_acquire("owner").await.unwrap();

        let args = json!({"instruction": "open a.test", "keep_session_alive": true});
        let out = tool.execute(args, &ctx("intruder")).await.unwrap();
        assert!(out.contains("in use by another conversation (owner)"));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_ephemeral_call_closes_its_session() {
        let (tool, browser, launcher, _llm) = setup(
            vec![
                tool_call("navigate", json!({"url": "https://b.test/"})),
                text(""),
            ],
            BrowserOptions::default(),
        );
        let out = tool
            .execute(json!({"instruction": "look at b.test"}), &ctx("t"))
            .await
            .unwrap();
        assert_eq!(out, NO_RESULT);
        assert_eq!(launcher.shutdowns(), 1);
        assert!(matches!(browser.state().await, BrowserState::Idle));
    }

    #[tokio::test]
    async fn test_url_only_mode() {
        let (tool, _browser, _launcher, llm) = setup(
            vec![
                tool_call("navigate", json!({"url": "https://c.test/list"})),
                text("The page is at https://c.test/list."),
            ],
            BrowserOptions::default(),
        );
        let out = tool
            .execute(
                json!({"instruction": "find the list page", "return_url_only": true}),
                &ctx("t"),
            )
            .await
            .unwrap();
        assert_eq!(out, "https://c.test/list");
        assert!(llm.requests()[0].last_user_text().ends_with(URL_ONLY_SUFFIX));
    }

    #[tokio::test]
    async fn test_keep_alive_disabled_releases_after_call() {
        let options = BrowserOptions {
            keep_alive: false,
            ..Default::default()
        };
        let (tool, browser, launcher, _llm) = setup(vec![text("ok")], options);
        let args = json!({"instruction": "x", "keep_session_alive": true});
        tool.execute(args, &ctx("t")).await.unwrap();
        assert!(matches!(browser.state().await, BrowserState::Idle));
        assert_eq!(launcher.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_step_budget_reports_partial() {
        let responses = (0..3)
            .map(|_| tool_call("read_page", json!({})))
            .collect();
        let launcher = Arc::new(FakeLauncher::default());
        let browser = Arc::new(SharedBrowser::new(launcher, BrowserOptions::default()));
        let llm = Arc::new(ScriptedLlm::new(responses));
        let tool = BrowseWeb::new(browser, llm.handle(), 3);

        let out = tool.execute(json!({"instruction": "loop"}), &ctx("t")).await.unwrap();
        assert!(out.starts_with(NO_RESULT));
        assert_eq!(llm.calls(), 3);
    }
}
