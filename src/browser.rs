use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, CookieSameSite, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info, warn};

use crate::errors::{Result, ScrapeError};
use crate::session::{OriginState, SameSite, StorageState, StoredCookie, StoredItem};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36";

const EVASION_SCRIPT: &str = r#"
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
    Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3] });
    Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
    const originalQuery = window.navigator.permissions.query;
    window.navigator.permissions.query = (parameters) => (
        parameters.name === 'notifications' ?
        Promise.resolve({ state: Notification.permission }) :
        originalQuery(parameters)
    );
    try {
        const getParameter = WebGLRenderingContext.prototype.getParameter;
        WebGLRenderingContext.prototype.getParameter = function(parameter) {
            if (parameter === 37445) return 'Intel Open Source Technology Center';
            if (parameter === 37446) return 'Mesa DRI Intel(R) HD Graphics 4000 (IVB GT2)';
            return getParameter.call(this, parameter);
        };
    } catch (e) {}
"#;

const DISMISS_BANNERS_SCRIPT: &str = r#"
    (() => {
        const acceptTexts = [
            'accept all', 'allow all cookies', 'allow all', 'accept', 'agree',
            'only allow essential cookies', 'decline optional cookies', 'got it'
        ];
        const buttons = document.querySelectorAll('button, a[role="button"], div[role="button"]');
        for (const btn of buttons) {
            const text = (btn.textContent || btn.innerText || '').toLowerCase().trim();
            const aria = (btn.getAttribute('aria-label') || '').toLowerCase();
            const full = text + ' ' + aria;
            if (acceptTexts.some(t => full.includes(t)) && full.length < 80 && btn.offsetParent !== null) {
                btn.click();
                return true;
            }
        }
        return false;
    })()
"#;

/// The handful of page operations the scrape loop needs. Implemented over a
/// live Chrome tab by [`BrowserPage`] and by an in-memory DOM in tests.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    async fn scroll_height(&self) -> Result<i64>;

    async fn scroll_to_bottom(&self) -> Result<()>;

    /// Outer HTML of every element matching `selector`, in document order.
    async fn outer_html_all(&self, selector: &str) -> Result<Vec<String>>;

    async fn has_element(&self, selector: &str) -> Result<bool>;

    /// Click away cookie-consent banners. Returns whether anything was clicked.
    async fn dismiss_banners(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Starts a browser for one scrape attempt.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserHandle>>;
}

/// A running browser that hands out tabs. `close` must be called on every
/// path once the attempt is over.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn new_page(&self, state: Option<&StorageState>) -> Result<Box<dyn PageDriver>>;

    async fn close(&mut self);
}

/// Launches a local Chrome through chromiumoxide.
pub struct ChromeLauncher {
    pub headless: bool,
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserHandle>> {
        Ok(Box::new(BrowserSession::launch(self.headless).await?))
    }
}

/// One Chrome process. Close it with [`BrowserSession::close`]; dropping it
/// without closing still shuts the process down in the background.
pub struct BrowserSession {
    browser: Option<Browser>,
    _handler_handle: task::JoinHandle<()>,
}

impl BrowserSession {
    pub async fn launch(headless: bool) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .request_timeout(Duration::from_secs(30))
            .no_sandbox()
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-extensions")
            .arg("--disable-gpu")
            .arg("--disable-software-rasterizer");

        if headless {
            builder = builder.headless_mode(HeadlessMode::True);
        } else {
            builder = builder.headless_mode(HeadlessMode::False);
        }

        let config = builder.build().map_err(ScrapeError::BrowserLaunch)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScrapeError::BrowserLaunch(e.to_string()))?;

        let _handler_handle = task::spawn(async move {
            while handler.next().await.is_some() {}
        });

        info!(headless, "browser launched");
        Ok(Self {
            browser: Some(browser),
            _handler_handle,
        })
    }

    /// Open a tab with stealth overrides and, when given, a restored session.
    pub async fn new_page(&self, state: Option<&StorageState>) -> Result<BrowserPage> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| ScrapeError::PageCreation("browser already closed".to_string()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScrapeError::PageCreation(e.to_string()))?;

        let page = BrowserPage { page };
        page.setup_evasions().await?;
        if let Some(state) = state {
            page.restore_state(state).await?;
        }
        Ok(page)
    }

    pub async fn close(mut self) {
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "browser close failed");
            }
            let _ = browser.wait().await;
            debug!("browser closed");
        }
    }
}

#[async_trait]
impl BrowserHandle for BrowserSession {
    async fn new_page(&self, state: Option<&StorageState>) -> Result<Box<dyn PageDriver>> {
        Ok(Box::new(BrowserSession::new_page(self, state).await?))
    }

    async fn close(&mut self) {
        self.shutdown().await;
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = browser.close().await;
                    let _ = browser.wait().await;
                });
            }
        }
    }
}

pub struct BrowserPage {
    page: Page,
}

impl BrowserPage {
    async fn setup_evasions(&self) -> Result<()> {
        self.page
            .execute(SetUserAgentOverrideParams::new(USER_AGENT))
            .await
            .map_err(|e| ScrapeError::EvaluationFailed(format!("Set User Agent: {}", e)))?;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(1920)
            .height(1080)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(ScrapeError::EvaluationFailed)?;
        self.page
            .execute(metrics)
            .await
            .map_err(|e| ScrapeError::EvaluationFailed(format!("Set Viewport: {}", e)))?;

        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams {
                source: EVASION_SCRIPT.to_string(),
                world_name: None,
                include_command_line_api: None,
                run_immediately: None,
            })
            .await
            .map_err(|e| ScrapeError::EvaluationFailed(format!("Add Evasion Script: {}", e)))?;

        Ok(())
    }

    async fn eval<T: DeserializeOwned>(&self, script: impl Into<String>) -> Result<T> {
        let script = script.into();
        self.page
            .evaluate(script.as_str())
            .await
            .map_err(|e| ScrapeError::EvaluationFailed(e.to_string()))?
            .into_value::<T>()
            .map_err(|e| ScrapeError::EvaluationFailed(e.to_string()))
    }

    /// Cookies plus the local storage of the current origin.
    pub async fn capture_state(&self) -> Result<StorageState> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .map_err(|e| ScrapeError::EvaluationFailed(format!("Get cookies: {}", e)))?
            .into_iter()
            .map(|c| StoredCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                expires: if c.session { -1.0 } else { c.expires },
                http_only: c.http_only,
                secure: c.secure,
                same_site: match c.same_site {
                    Some(CookieSameSite::Strict) => SameSite::Strict,
                    Some(CookieSameSite::None) => SameSite::None,
                    _ => SameSite::Lax,
                },
            })
            .collect();

        let (origin, entries): (String, Vec<(String, String)>) = self
            .eval(
                "[window.location.origin, Object.keys(localStorage).map(k => [k, localStorage.getItem(k) || ''])]",
            )
            .await
            .unwrap_or_default();

        let origins = if origin.starts_with("http") {
            vec![OriginState {
                origin,
                local_storage: entries
                    .into_iter()
                    .map(|(name, value)| StoredItem { name, value })
                    .collect(),
            }]
        } else {
            Vec::new()
        };

        Ok(StorageState { cookies, origins })
    }

    async fn restore_state(&self, state: &StorageState) -> Result<()> {
        let params: Vec<CookieParam> = state.cookies.iter().map(cookie_param).collect();
        if !params.is_empty() {
            self.page
                .set_cookies(params)
                .await
                .map_err(|e| ScrapeError::EvaluationFailed(format!("Set cookies: {}", e)))?;
        }

        for origin in state.origins.iter().filter(|o| !o.local_storage.is_empty()) {
            self.goto(&origin.origin).await?;
            let entries: Vec<(&str, &str)> = origin
                .local_storage
                .iter()
                .map(|item| (item.name.as_str(), item.value.as_str()))
                .collect();
            let script = format!(
                "(() => {{ for (const [k, v] of {}) localStorage.setItem(k, v); return true; }})()",
                serde_json::to_string(&entries)?
            );
            if let Err(e) = self.eval::<bool>(script).await {
                warn!(origin = %origin.origin, error = %e, "failed to restore local storage");
            }
        }
        debug!(cookies = state.cookies.len(), "session state restored");
        Ok(())
    }

    pub async fn close(self) {
        if let Err(e) = self.page.close().await {
            debug!(error = %e, "page close failed");
        }
    }
}

fn cookie_param(cookie: &StoredCookie) -> CookieParam {
    let domain_clean = cookie.domain.trim_start_matches('.');
    let mut param = CookieParam::new(cookie.name.clone(), cookie.value.clone());
    param.url = Some(format!("https://{}{}", domain_clean, cookie.path));
    param.domain = Some(cookie.domain.clone());
    param.path = Some(cookie.path.clone());
    param.secure = Some(cookie.secure);
    param.http_only = Some(cookie.http_only);
    param.same_site = Some(match cookie.same_site {
        SameSite::Strict => CookieSameSite::Strict,
        SameSite::Lax => CookieSameSite::Lax,
        SameSite::None => CookieSameSite::None,
    });
    if cookie.expires > 0.0 {
        param.expires = Some(TimeSinceEpoch::new(cookie.expires));
    }
    param
}

#[async_trait]
impl PageDriver for BrowserPage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| ScrapeError::Navigation(format!("{url}: {e}")))?;
        let delay = 1500 + (rand::random::<u64>() % 1000);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        self.page
            .url()
            .await
            .map_err(|e| ScrapeError::EvaluationFailed(e.to_string()))
            .map(Option::unwrap_or_default)
    }

    async fn scroll_height(&self) -> Result<i64> {
        self.eval("document.body ? document.body.scrollHeight : 0").await
    }

    async fn scroll_to_bottom(&self) -> Result<()> {
        self.eval::<bool>("(() => { window.scrollTo(0, document.body.scrollHeight); return true; })()")
            .await
            .map(|_| ())
    }

    async fn outer_html_all(&self, selector: &str) -> Result<Vec<String>> {
        let script = format!(
            "Array.from(document.querySelectorAll({})).map(n => n.outerHTML)",
            serde_json::to_string(selector)?
        );
        self.eval(script).await
    }

    async fn has_element(&self, selector: &str) -> Result<bool> {
        let script = format!(
            "(() => {{ try {{ return document.querySelector({}) !== null; }} catch (e) {{ return false; }} }})()",
            serde_json::to_string(selector)?
        );
        self.eval(script).await
    }

    async fn dismiss_banners(&self) -> Result<bool> {
        let clicked = self.eval::<bool>(DISMISS_BANNERS_SCRIPT).await.unwrap_or(false);
        if clicked {
            info!("dismissed cookie banner");
            tokio::time::sleep(Duration::from_millis(1000)).await;
        }
        Ok(clicked)
    }
}
