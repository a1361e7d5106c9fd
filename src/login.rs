use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};

use crate::browser::{BrowserSession, PageDriver};
use crate::config::PlatformConfig;
use crate::errors::{Result, ScrapeError};
use crate::session::{LoginFlow, StorageState};

/// Opens a visible browser on the platform's login page and waits for a
/// person to sign in, then captures the resulting storage state.
pub struct InteractiveLogin {
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// Extra wait after success so late cookies land.
    pub settle: Duration,
}

impl Default for InteractiveLogin {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::from_secs(1),
            settle: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl LoginFlow for InteractiveLogin {
    #[instrument(skip(self, config), fields(platform = %config.platform))]
    async fn login(&self, config: &PlatformConfig) -> Result<StorageState> {
        info!(login_url = config.login_url, "opening browser for manual login");
        let session = BrowserSession::launch(false).await?;
        let result = self.capture(&session, config).await;
        session.close().await;
        result
    }
}

impl InteractiveLogin {
    async fn capture(&self, session: &BrowserSession, config: &PlatformConfig) -> Result<StorageState> {
        let page = session.new_page(None).await?;
        page.goto(config.login_url).await?;
        page.dismiss_banners().await?;
        log_page_state(&page, "login_page").await;

        info!("please log in in the opened browser window");
        wait_for_login(&page, config, self.timeout, self.poll_interval).await?;

        info!("login detected, letting the page settle");
        sleep(self.settle).await;
        log_page_state(&page, "after_login").await;

        let state = page.capture_state().await?;
        page.close().await;
        if state.cookies.is_empty() {
            return Err(ScrapeError::LoginAborted {
                platform: config.platform,
                reason: "no cookies captured after login".to_string(),
            });
        }
        info!(cookies = state.cookies.len(), "session captured");
        Ok(state)
    }
}

async fn log_page_state(page: &dyn PageDriver, context: &str) {
    let url = page.current_url().await.unwrap_or_else(|_| "unknown".to_string());
    debug!("[{}] URL: {}", context, url);
}

/// Block until the page shows a signed-in state: a post-login URL, or a
/// signed-in marker on a page that is not part of the login flow. Errors
/// from the page (window closed) abort the login.
pub async fn wait_for_login(
    page: &dyn PageDriver,
    config: &PlatformConfig,
    timeout: Option<Duration>,
    poll_interval: Duration,
) -> Result<()> {
    let started = Instant::now();
    let aborted = |reason: String| ScrapeError::LoginAborted {
        platform: config.platform,
        reason,
    };

    loop {
        let url = page
            .current_url()
            .await
            .map_err(|e| aborted(format!("browser window closed: {e}")))?;

        if config.is_login_success_url(&url) {
            info!(url, "reached post-login page");
            return Ok(());
        }

        if !config.is_login_redirect(&url) {
            for marker in &config.login_markers {
                let present = page
                    .has_element(marker)
                    .await
                    .map_err(|e| aborted(format!("browser window closed: {e}")))?;
                if present {
                    info!(marker, "signed-in marker found");
                    return Ok(());
                }
            }
        }

        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                warn!(waited_secs = limit.as_secs(), "gave up waiting for manual login");
                return Err(aborted(format!("no login within {}s", limit.as_secs())));
            }
        }
        sleep(poll_interval).await;
    }
}
