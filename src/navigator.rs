use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::browser::PageDriver;
use crate::config::PlatformConfig;
use crate::errors::{Result, ScrapeError};

const READY_TIMEOUT: Duration = Duration::from_secs(15);
const READY_POLL: Duration = Duration::from_millis(500);

/// Load the search results for `keyword` and wait until the first result
/// node renders.
pub async fn open(
    page: &dyn PageDriver,
    config: &PlatformConfig,
    keyword: &str,
    since: Option<&str>,
    until: Option<&str>,
) -> Result<()> {
    let url = config.search_url(keyword, since, until);
    info!(platform = %config.platform, keyword, url, "opening search page");
    page.goto(&url).await?;
    page.dismiss_banners().await?;
    detect_challenge(page, config).await?;

    if wait_until_ready(page, config).await? {
        return Ok(());
    }

    let current = page.current_url().await?;
    if config.is_login_redirect(&current) {
        return Err(ScrapeError::SessionExpired(config.platform));
    }
    detect_challenge(page, config).await?;
    warn!(platform = %config.platform, keyword, "no result nodes rendered");
    Ok(())
}

async fn wait_until_ready(page: &dyn PageDriver, config: &PlatformConfig) -> Result<bool> {
    let deadline = Instant::now() + READY_TIMEOUT;
    loop {
        for selector in &config.ready_selectors {
            if page.has_element(selector).await? {
                debug!(selector, "result page ready");
                return Ok(true);
            }
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(READY_POLL).await;
    }
}

/// Fail with [`ScrapeError::Blocked`] when the page is a captcha or checkpoint.
pub async fn detect_challenge(page: &dyn PageDriver, config: &PlatformConfig) -> Result<()> {
    let url = page.current_url().await?;
    if let Some(fragment) = config.challenge_in_url(&url) {
        return Err(ScrapeError::Blocked {
            platform: config.platform,
            marker: fragment.to_string(),
        });
    }
    for selector in &config.challenge_selectors {
        if page.has_element(selector).await? {
            return Err(ScrapeError::Blocked {
                platform: config.platform,
                marker: selector.to_string(),
            });
        }
    }
    Ok(())
}

/// Scroll to the bottom, wait `per_scroll_delay`, and compare page heights.
/// Returns `true` as soon as a scroll leaves the height unchanged, `false` if
/// the page was still growing after `max_attempts` scrolls.
pub async fn scroll_until_stable(
    page: &dyn PageDriver,
    max_attempts: u32,
    per_scroll_delay: Duration,
) -> Result<bool> {
    for attempt in 1..=max_attempts {
        let before = page.scroll_height().await?;
        page.scroll_to_bottom().await?;
        sleep(per_scroll_delay).await;
        let after = page.scroll_height().await?;
        debug!(attempt, before, after, "scrolled");
        if after == before {
            return Ok(true);
        }
    }
    Ok(false)
}
