//! The one long-lived browser session and who holds it.
//!
//! At most one conversation holds the shared session at a time. A second
//! conversation asking for it gets [`LeaseError::Held`] immediately instead
//! of steering someone else's tabs. Callers that do not need continuity use
//! [`SharedBrowser::ephemeral`] and never touch the shared state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

use super::{BrowserLauncher, BrowserOptions, BrowserSession, TabSummary};

/// Shared access to a session.
pub type SessionHandle = Arc<Mutex<BrowserSession>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("shared browser session is held by another conversation ({holder})")]
    Held { holder: String },
    #[error("shared browser session is not held by {requested}")]
    NotHolder { requested: String },
    #[error("failed to launch browser: {0}")]
    Launch(String),
}

struct ActiveLease {
    holder: String,
    session: SessionHandle,
    acquired_at: DateTime<Utc>,
}

/// Observable state of the shared session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BrowserState {
    Idle,
    Active {
        holder: String,
        acquired_at: DateTime<Utc>,
        /// A browsing call is running right now.
        busy: bool,
        tabs: Vec<TabSummary>,
    },
}

/// Access to a held shared session.
#[derive(Clone)]
pub struct BrowserLease {
    holder: String,
    session: SessionHandle,
}

impl std::fmt::Debug for BrowserLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserLease")
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl BrowserLease {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn handle(&self) -> SessionHandle {
        self.session.clone()
    }

    pub async fn session(&self) -> MutexGuard<'_, BrowserSession> {
        self.session.lock().await
    }
}

/// Owner of the process-wide browser session.
pub struct SharedBrowser {
    launcher: Arc<dyn BrowserLauncher>,
    options: BrowserOptions,
    active: Mutex<Option<ActiveLease>>,
}

impl SharedBrowser {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, options: BrowserOptions) -> Self {
        Self {
            launcher,
            options,
            active: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &BrowserOptions {
        &self.options
    }

    /// Take (or re-enter) the shared session for `holder`.
    ///
    /// Launches a browser when idle. A holder that already owns the session
    /// gets it back with tabs and reading positions intact.
    pub async fn try_acquire(&self, holder: &str) -> Result<BrowserLease, LeaseError> {
        let mut active = self.active.lock().await;

        if let Some(lease) = active.as_ref() {
            // A session mid-action is locked and certainly not closed.
            let closed = lease
                .session
                .try_lock()
                .map(|s| s.is_closed())
                .unwrap_or(false);
            if !closed {
                if lease.holder != holder {
                    tracing::info!(holder = %lease.holder, requested = %holder, "Shared browser busy");
                    return Err(LeaseError::Held {
                        holder: lease.holder.clone(),
                    });
                }
                return Ok(BrowserLease {
                    holder: holder.to_string(),
                    session: lease.session.clone(),
                });
            }
            tracing::debug!(holder = %lease.holder, "Discarding closed shared session");
            *active = None;
        }

        let backend = self
            .launcher
            .launch(&self.options)
            .await
            .map_err(|e| LeaseError::Launch(e.to_string()))?;
        let session = Arc::new(Mutex::new(BrowserSession::new(backend)));
        *active = Some(ActiveLease {
            holder: holder.to_string(),
            session: session.clone(),
            acquired_at: Utc::now(),
        });
        tracing::info!(holder = %holder, "Shared browser session started");

        Ok(BrowserLease {
            holder: holder.to_string(),
            session,
        })
    }

    /// Close the shared session if `holder` owns it.
    pub async fn release(&self, holder: &str) -> Result<(), LeaseError> {
        let lease = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(lease) if lease.holder == holder => active.take(),
                _ => {
                    return Err(LeaseError::NotHolder {
                        requested: holder.to_string(),
                    })
                }
            }
        };
        if let Some(lease) = lease {
            close_session(&lease).await;
        }
        Ok(())
    }

    /// Close the shared session whoever holds it. Returns the former holder.
    pub async fn teardown(&self) -> Option<String> {
        let lease = self.active.lock().await.take()?;
        close_session(&lease).await;
        Some(lease.holder)
    }

    pub async fn state(&self) -> BrowserState {
        let active = self.active.lock().await;
        match active.as_ref() {
            None => BrowserState::Idle,
            Some(lease) => match lease.session.try_lock() {
                Ok(session) if session.is_closed() => BrowserState::Idle,
                Ok(session) => BrowserState::Active {
                    holder: lease.holder.clone(),
                    acquired_at: lease.acquired_at,
                    busy: false,
                    tabs: session.tabs(),
                },
                Err(_) => BrowserState::Active {
                    holder: lease.holder.clone(),
                    acquired_at: lease.acquired_at,
                    busy: true,
                    tabs: Vec::new(),
                },
            },
        }
    }

    /// A fresh session owned by the caller, independent of the shared one.
    /// The caller closes it when done.
    pub async fn ephemeral(&self) -> anyhow::Result<BrowserSession> {
        let backend = self.launcher.launch(&self.options).await?;
        Ok(BrowserSession::new(backend))
    }
}

async fn close_session(lease: &ActiveLease) {
    let mut session = lease.session.lock().await;
    if let Err(e) = session.close().await {
        tracing::warn!(holder = %lease.holder, "Failed to close browser session: {}", e);
    } else {
        tracing::info!(holder = %lease.holder, "Shared browser session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeLauncher;

    fn shared() -> (SharedBrowser, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::default());
        (
            SharedBrowser::new(launcher.clone(), BrowserOptions::default()),
            launcher,
        )
    }

    #[tokio::test]
    async fn test_second_holder_is_refused_without_side_effects() {
        let (browser, launcher) = shared();
        let lease = browser.try_acquire("thread-a").await.unwrap();
        lease.session().await.navigate("https://a.test/").await.unwrap();

        let err = browser.try_acquire("thread-b").await.unwrap_err();
        assert_eq!(
            err,
            LeaseError::Held {
                holder: "thread-a".to_string()
            }
        );
        assert_eq!(launcher.launches(), 1);
        assert_eq!(lease.session().await.tabs()[0].url, "https://a.test/");
    }

    #[tokio::test]
    async fn test_reentry_keeps_tabs_and_position() {
        let (browser, launcher) = shared();
        {
            let lease = browser.try_acquire("t").await.unwrap();
            let mut session = lease.session().await;
            session.navigate("https://a.test/long").await.unwrap();
            session.read(5);
        }
        let lease = browser.try_acquire("t").await.unwrap();
        let view = lease.session().await.read(5).unwrap();
        assert_eq!(view.offset, 5);
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_release_and_teardown() {
        let (browser, launcher) = shared();
        browser.try_acquire("a").await.unwrap();
        assert!(matches!(browser.state().await, BrowserState::Active { ref holder, .. } if holder == "a"));

        assert!(browser.release("b").await.is_err());
        browser.release("a").await.unwrap();
        assert!(matches!(browser.state().await, BrowserState::Idle));

        browser.try_acquire("b").await.unwrap();
        assert_eq!(browser.teardown().await.as_deref(), Some("b"));
        assert_eq!(browser.teardown().await, None);
        assert_eq!(launcher.launches(), 2);
        assert_eq!(launcher.shutdowns(), 2);
    }

    #[tokio::test]
    async fn test_ephemeral_sessions_do_not_touch_shared_state() {
        let (browser, launcher) = shared();
        let held = browser.try_acquire("owner").await.unwrap();

        let mut scratch = browser.ephemeral().await.unwrap();
        scratch.navigate("https://b.test/").await.unwrap();
        scratch.close().await.unwrap();

        assert_eq!(launcher.launches(), 2);
        assert!(held.session().await.tabs().is_empty());
        assert!(matches!(browser.state().await, BrowserState::Active { .. }));
    }

    #[tokio::test]
    async fn test_launch_failure_leaves_idle() {
        let launcher = Arc::new(FakeLauncher::failing());
        let browser = SharedBrowser::new(launcher, BrowserOptions::default());
        assert!(matches!(
            browser.try_acquire("a").await,
            Err(LeaseError::Launch(_))
        ));
        assert!(matches!(browser.state().await, BrowserState::Idle));
    }
}
