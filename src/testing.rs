//! In-memory stand-ins for Chrome, a login and the search backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::browser::{BrowserHandle, BrowserLauncher, PageDriver};
use crate::config::PlatformConfig;
use crate::errors::{Result, ScrapeError};
use crate::model::{ScrapedPost, SearchRequest};
use crate::scraper::SearchService;
use crate::session::{LoginFlow, OriginState, SameSite, StorageState, StoredCookie};

#[derive(Debug, Default)]
struct MockState {
    batches: Vec<Vec<String>>,
    revealed: usize,
    elements: HashSet<String>,
    visited: Vec<String>,
    redirect: Option<String>,
    failing_gotos: u32,
    scrolls: u32,
}

/// Each scroll reveals the next batch of result nodes and grows the page by
/// 1000px; once every batch is shown the height stops changing.
#[derive(Debug, Default)]
pub struct MockPage {
    state: Mutex<MockState>,
}

impl MockPage {
    pub fn new(batches: Vec<Vec<String>>) -> Self {
        Self {
            state: Mutex::new(MockState {
                revealed: batches.len().min(1),
                batches,
                ..MockState::default()
            }),
        }
    }

    pub fn with_element(self, selector: &str) -> Self {
        self.state.lock().unwrap().elements.insert(selector.to_string());
        self
    }

    pub fn redirect_to(self, url: &str) -> Self {
        self.state.lock().unwrap().redirect = Some(url.to_string());
        self
    }

    pub fn failing_gotos(self, count: u32) -> Self {
        self.state.lock().unwrap().failing_gotos = count;
        self
    }

    pub fn visited(&self) -> Vec<String> {
        self.state.lock().unwrap().visited.clone()
    }

    pub fn scrolls(&self) -> u32 {
        self.state.lock().unwrap().scrolls
    }
}

#[async_trait]
impl PageDriver for MockPage {
    async fn goto(&self, url: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_gotos > 0 {
            state.failing_gotos -= 1;
            return Err(ScrapeError::Navigation(format!("{url}: net::ERR_TIMED_OUT")));
        }
        state.visited.push(url.to_string());
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let state = self.state.lock().unwrap();
        Ok(state
            .redirect
            .clone()
            .or_else(|| state.visited.last().cloned())
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn scroll_height(&self) -> Result<i64> {
        Ok(self.state.lock().unwrap().revealed as i64 * 1000)
    }

    async fn scroll_to_bottom(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.scrolls += 1;
        if state.revealed < state.batches.len() {
            state.revealed += 1;
        }
        Ok(())
    }

    async fn outer_html_all(&self, _selector: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.batches[..state.revealed].iter().flatten().cloned().collect())
    }

    async fn has_element(&self, selector: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().elements.contains(selector))
    }
}

#[async_trait]
impl PageDriver for Arc<MockPage> {
    async fn goto(&self, url: &str) -> Result<()> {
        self.as_ref().goto(url).await
    }

    async fn current_url(&self) -> Result<String> {
        self.as_ref().current_url().await
    }

    async fn scroll_height(&self) -> Result<i64> {
        self.as_ref().scroll_height().await
    }

    async fn scroll_to_bottom(&self) -> Result<()> {
        self.as_ref().scroll_to_bottom().await
    }

    async fn outer_html_all(&self, selector: &str) -> Result<Vec<String>> {
        self.as_ref().outer_html_all(selector).await
    }

    async fn has_element(&self, selector: &str) -> Result<bool> {
        self.as_ref().has_element(selector).await
    }
}

/// Every launched "browser" hands out tabs backed by the same [`MockPage`].
#[derive(Debug)]
pub struct MockLauncher {
    page: Arc<MockPage>,
    launches: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl MockLauncher {
    pub fn new(page: MockPage) -> Self {
        Self {
            page: Arc::new(page),
            launches: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn page(&self) -> &MockPage {
        &self.page
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserHandle>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockBrowser {
            page: Arc::clone(&self.page),
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct MockBrowser {
    page: Arc<MockPage>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserHandle for MockBrowser {
    async fn new_page(&self, _state: Option<&StorageState>) -> Result<Box<dyn PageDriver>> {
        Ok(Box::new(Arc::clone(&self.page)))
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Login that succeeds at once with a single auth cookie.
#[derive(Debug, Default)]
pub struct StubLogin {
    calls: AtomicUsize,
}

impl StubLogin {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoginFlow for StubLogin {
    async fn login(&self, config: &PlatformConfig) -> Result<StorageState> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(signed_in_state(config))
    }
}

pub fn signed_in_state(config: &PlatformConfig) -> StorageState {
    StorageState {
        cookies: vec![StoredCookie {
            name: "auth_token".to_string(),
            value: "stub".to_string(),
            domain: config.base_url.trim_start_matches("https://").to_string(),
            path: "/".to_string(),
            expires: -1.0,
            http_only: true,
            secure: true,
            same_site: SameSite::Lax,
        }],
        origins: vec![OriginState {
            origin: config.base_url.to_string(),
            local_storage: vec![],
        }],
    }
}

/// A tweet-shaped `<article>` node.
pub fn tweet(author: &str, text: &str, id: u64) -> String {
    format!(
        r#"<article>
             <div data-testid="User-Name"><span>{author}</span></div>
             <div data-testid="tweetText">{text}</div>
             <a role="link" href="/{author}/status/{id}">now</a>
           </article>"#
    )
}

/// Search backend that fabricates `per_call` fresh posts per request and
/// remembers what it was asked.
#[derive(Debug, Default)]
pub struct StubSearch {
    requests: Mutex<Vec<SearchRequest>>,
    next_id: AtomicU64,
    per_call: usize,
    blocked: bool,
}

impl StubSearch {
    pub fn new(per_call: usize) -> Self {
        Self {
            per_call,
            ..Self::default()
        }
    }

    pub fn blocked() -> Self {
        Self {
            blocked: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<SearchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchService for StubSearch {
    async fn search(&self, request: SearchRequest) -> Result<Vec<ScrapedPost>> {
        self.requests.lock().unwrap().push(request.clone());
        if self.blocked {
            return Err(ScrapeError::Blocked {
                platform: request.platform,
                marker: "/account/access".to_string(),
            });
        }
        let posts = (0..self.per_call.min(request.limit))
            .map(|_| {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                ScrapedPost {
                    author: "stub".to_string(),
                    text: format!("{} post {id}", request.keyword_label()),
                    permalink: format!("https://example.com/{}/{id}", request.platform),
                    sentiment: None,
                    platform: request.platform,
                }
            })
            .collect();
        Ok(posts)
    }
}
