use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::browser::{BrowserHandle, BrowserLauncher, PageDriver};
use crate::collector::SharedCollector;
use crate::config::{AppConfig, KeywordMode, PlatformConfig, SessionCheck, get_platform_config};
use crate::errors::{Result, ScrapeError};
use crate::extractor;
use crate::model::{Platform, ScrapedPost, SearchRequest, Sentiment};
use crate::navigator;
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryPolicy, default_classifier, with_retry};
use crate::sentiment::SentimentClassifier;
use crate::session::{self, LoginFlow, SessionStore, StorageState};

/// Upper bound on extract/scroll rounds for one keyword, whatever the page does.
const MAX_ROUNDS: u32 = 60;

/// Anything that can answer a search request. The HTTP layer and the
/// scheduler only see this.
#[async_trait]
pub trait SearchService: Send + Sync {
    async fn search(&self, request: SearchRequest) -> Result<Vec<ScrapedPost>>;
}

/// Browser-backed search: session restore, rate limiting, retries and the
/// scroll/extract loop for every platform.
pub struct ScrapeService {
    sessions: Arc<SessionStore>,
    login: Arc<dyn LoginFlow>,
    launcher: Arc<dyn BrowserLauncher>,
    limiters: HashMap<Platform, RateLimiter>,
    retry: RetryPolicy,
    sentiment: Option<Arc<dyn SentimentClassifier>>,
    session_check: SessionCheck,
    keyword_mode: KeywordMode,
    keyword_delay: Duration,
}

impl ScrapeService {
    pub fn new(
        config: &AppConfig,
        sessions: Arc<SessionStore>,
        login: Arc<dyn LoginFlow>,
        launcher: Arc<dyn BrowserLauncher>,
        sentiment: Option<Arc<dyn SentimentClassifier>>,
    ) -> Self {
        let limiters = Platform::ALL
            .iter()
            .map(|p| (*p, RateLimiter::new(config.bucket_size, config.tokens_per_second)))
            .collect();

        Self {
            sessions,
            login,
            launcher,
            limiters,
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                base_delay: config.retry_base_delay,
                max_delay: config.retry_max_delay,
                block_cooldown: config.block_cooldown,
            },
            sentiment,
            session_check: config.session_check,
            keyword_mode: config.keyword_mode,
            keyword_delay: config.keyword_delay,
        }
    }

    pub fn limiter(&self, platform: Platform) -> Option<&RateLimiter> {
        self.limiters.get(&platform)
    }

    async fn scrape_once(&self, config: &PlatformConfig, request: &SearchRequest) -> Result<Vec<ScrapedPost>> {
        let state = self.sessions.load_or_login(config, self.login.as_ref()).await?;
        let mut browser = self.launcher.launch().await?;
        let result = self.scrape_with_browser(browser.as_ref(), config, request, &state).await;
        browser.close().await;
        result
    }

    async fn scrape_with_browser(
        &self,
        browser: &dyn BrowserHandle,
        config: &PlatformConfig,
        request: &SearchRequest,
        state: &StorageState,
    ) -> Result<Vec<ScrapedPost>> {
        let page = browser.new_page(Some(state)).await?;

        if self.session_check == SessionCheck::Always && !session::is_valid(page.as_ref(), config).await {
            return Err(ScrapeError::SessionExpired(config.platform));
        }

        let collector = SharedCollector::new(request.limit);
        let sentiment = if config.sentiment_filter {
            self.sentiment.as_deref()
        } else {
            None
        };

        match self.keyword_mode {
            KeywordMode::Sequential => {
                scrape_keywords(page.as_ref(), config, request, &collector, sentiment, self.keyword_delay).await?;
            }
            KeywordMode::Concurrent => {
                let mut pages = vec![page];
                for _ in 1..request.keywords.len() {
                    pages.push(browser.new_page(Some(state)).await?);
                }
                let runs = request
                    .keywords
                    .iter()
                    .zip(pages.iter())
                    .map(|(keyword, page)| scrape_keyword(page.as_ref(), config, keyword, request, &collector, sentiment));
                for (keyword, outcome) in request.keywords.iter().zip(join_all(runs).await) {
                    match outcome {
                        Ok(()) => {}
                        Err(e) if e.is_blocked() || matches!(e, ScrapeError::SessionExpired(_)) => return Err(e),
                        Err(e) => warn!(keyword, error = %e, "keyword failed, keeping other results"),
                    }
                }
            }
        }

        Ok(collector.snapshot())
    }
}

#[async_trait]
impl SearchService for ScrapeService {
    #[instrument(skip(self, request), fields(platform = %request.platform, keyword = %request.keyword_label(), limit = request.limit))]
    async fn search(&self, request: SearchRequest) -> Result<Vec<ScrapedPost>> {
        let config = get_platform_config(request.platform);
        let limiter = self.limiter(request.platform);
        if let Some(limiter) = limiter {
            limiter.acquire().await?;
        }
        info!("🔎 search started");

        let config = &config;
        let request = &request;
        let mut relogged = false;
        loop {
            let outcome = with_retry(&self.retry, limiter, default_classifier, move |attempt| {
                debug!(attempt, "scrape attempt");
                self.scrape_once(config, request)
            })
            .await;

            match outcome {
                Err(ScrapeError::SessionExpired(platform)) if !relogged => {
                    warn!(%platform, "session no longer valid, logging in again");
                    self.sessions.invalidate_async(config).await?;
                    relogged = true;
                }
                Ok(posts) => {
                    info!(total = posts.len(), "✅ search finished");
                    return Ok(posts);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Search each keyword in turn on one page, pausing between keywords.
pub async fn scrape_keywords(
    page: &dyn PageDriver,
    config: &PlatformConfig,
    request: &SearchRequest,
    collector: &SharedCollector,
    sentiment: Option<&dyn SentimentClassifier>,
    keyword_delay: Duration,
) -> Result<()> {
    for (index, keyword) in request.keywords.iter().enumerate() {
        if collector.is_full() {
            break;
        }
        if index > 0 {
            sleep(keyword_delay).await;
        }
        scrape_keyword(page, config, keyword, request, collector, sentiment).await?;
    }
    Ok(())
}

pub async fn scrape_keyword(
    page: &dyn PageDriver,
    config: &PlatformConfig,
    keyword: &str,
    request: &SearchRequest,
    collector: &SharedCollector,
    sentiment: Option<&dyn SentimentClassifier>,
) -> Result<()> {
    navigator::open(page, config, keyword, request.since.as_deref(), request.until.as_deref()).await?;
    collect_posts(page, config, collector, sentiment).await
}

/// Extract every rendered result node, then scroll for more until the
/// collector is full or `max_scroll_attempts` scrolls in a row brought
/// nothing new.
pub async fn collect_posts(
    page: &dyn PageDriver,
    config: &PlatformConfig,
    collector: &SharedCollector,
    sentiment: Option<&dyn SentimentClassifier>,
) -> Result<()> {
    let mut rejected: HashSet<String> = HashSet::new();
    let mut stalled = 0;

    for round in 1..=MAX_ROUNDS {
        let nodes = page.outer_html_all(config.result_selector).await?;
        let mut added = 0;

        for html in &nodes {
            if collector.is_full() {
                break;
            }
            let post = extractor::extract(html, config);
            if !extractor::is_usable(&post, config)
                || collector.contains(&post.permalink)
                || rejected.contains(&post.permalink)
            {
                continue;
            }

            let post = match sentiment {
                Some(classifier) => {
                    let label = classifier.classify(&post.text).await;
                    if label != Sentiment::Negative {
                        rejected.insert(post.permalink);
                        continue;
                    }
                    post.with_sentiment(label)
                }
                None => post,
            };

            if collector.add_if_new(post) {
                added += 1;
            }
        }

        debug!(round, nodes = nodes.len(), added, total = collector.len(), "extracted");
        if collector.is_full() {
            return Ok(());
        }

        navigator::detect_challenge(page, config).await?;
        let height_unchanged = navigator::scroll_until_stable(page, 1, config.scroll_delay).await?;
        if height_unchanged && added == 0 {
            stalled += 1;
        } else {
            stalled = 0;
        }
        if collector.is_complete(stalled, config.max_scroll_attempts) {
            info!(total = collector.len(), stalled, "no more content");
            return Ok(());
        }
    }

    warn!(rounds = MAX_ROUNDS, total = collector.len(), "stopped after max rounds");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockLauncher, MockPage, StubLogin, signed_in_state, tweet};

    fn request(platform: Platform, keywords: &[&str], limit: usize) -> SearchRequest {
        SearchRequest {
            platform,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            limit,
            since: None,
            until: None,
        }
    }

    fn fb_post(author: &str, text: &str, id: u32) -> String {
        fb_linked_post(author, text, &format!("https://www.facebook.com/{author}/posts/{id}?__cft__=x"))
    }

    fn fb_linked_post(author: &str, text: &str, href: &str) -> String {
        format!(
            r#"<div role="article">
                 <strong><a href="/{author}">{author}</a></strong>
                 <div dir="auto">{text}</div>
                 <a tabindex="0" href="{href}">1h</a>
               </div>"#
        )
    }

    fn service(
        sessions: &Arc<SessionStore>,
        launcher: &Arc<MockLauncher>,
        login: &Arc<StubLogin>,
        session_check: SessionCheck,
    ) -> ScrapeService {
        let config = AppConfig {
            tokens_per_second: 0.001,
            session_check,
            ..AppConfig::default()
        };
        ScrapeService::new(&config, sessions.clone(), login.clone(), launcher.clone(), None)
    }

    fn twitter_fixture(
        page: MockPage,
        session_check: SessionCheck,
        signed_in: bool,
    ) -> (ScrapeService, Arc<SessionStore>, Arc<MockLauncher>, Arc<StubLogin>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path()));
        if signed_in {
            let config = get_platform_config(Platform::Twitter);
            sessions.save(&config, &signed_in_state(&config)).unwrap();
        }
        let launcher = Arc::new(MockLauncher::new(page));
        let login = Arc::new(StubLogin::default());
        let service = service(&sessions, &launcher, &login, session_check);
        (service, sessions, launcher, login, dir)
    }

    struct KeywordClassifier;

    #[async_trait]
    impl SentimentClassifier for KeywordClassifier {
        async fn classify(&self, text: &str) -> Sentiment {
            if text.contains("awful") {
                Sentiment::Negative
            } else if text.contains("lovely") {
                Sentiment::Positive
            } else {
                Sentiment::Unknown
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fewer_nodes_than_limit_returns_all_of_them() {
        let config = get_platform_config(Platform::Twitter);
        let page = MockPage::new(vec![vec![
            tweet("alice", "first", 1),
            tweet("bob", "second", 2),
            tweet("carol", "third", 3),
        ]])
        .with_element("article");
        let req = request(Platform::Twitter, &["test"], 5);
        let collector = SharedCollector::new(req.limit);

        scrape_keyword(&page, &config, "test", &req, &collector, None).await.unwrap();

        let results = collector.snapshot();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].permalink, "https://x.com/alice/status/1");
        assert_eq!(results[0].author, "alice");
        assert_eq!(results[2].text, "third");
        // the round that extracted the posts, then one per stalled scroll
        assert_eq!(page.scrolls(), config.max_scroll_attempts + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_stops_scrolling_early() {
        let config = get_platform_config(Platform::Twitter);
        let batches: Vec<Vec<String>> = (0..5)
            .map(|b| (0..3).map(|i| tweet("user", "text", b * 10 + i)).collect())
            .collect();
        let page = MockPage::new(batches);
        let collector = SharedCollector::new(4);

        collect_posts(&page, &config, &collector, None).await.unwrap();

        assert_eq!(collector.len(), 4);
        assert_eq!(page.scrolls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_nodes_are_collected_once() {
        let config = get_platform_config(Platform::Twitter);
        let page = MockPage::new(vec![
            vec![tweet("a", "one", 1), tweet("a", "one again", 1)],
            vec![tweet("b", "two", 2), tweet("a", "one", 1)],
        ]);
        let collector = SharedCollector::new(10);

        collect_posts(&page, &config, &collector, None).await.unwrap();

        let permalinks: Vec<_> = collector.snapshot().into_iter().map(|p| p.permalink).collect();
        assert_eq!(
            permalinks,
            vec!["https://x.com/a/status/1".to_string(), "https://x.com/b/status/2".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tweets_without_text_are_skipped() {
        let config = get_platform_config(Platform::Twitter);
        let page = MockPage::new(vec![vec![tweet("a", "", 1), tweet("b", "kept", 2)]]);
        let collector = SharedCollector::new(10);

        collect_posts(&page, &config, &collector, None).await.unwrap();

        let results = collector.snapshot();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].author, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn sentiment_filter_keeps_only_negative_posts() {
        let config = get_platform_config(Platform::Facebook);
        let page = MockPage::new(vec![vec![
            fb_post("ann", "an awful week", 1),
            fb_post("ben", "a lovely week", 2),
            fb_post("cat", "a week", 3),
        ]]);
        let collector = SharedCollector::new(10);

        let classifier = KeywordClassifier;
        collect_posts(&page, &config, &collector, Some(&classifier as &dyn SentimentClassifier))
            .await
            .unwrap();

        let results = collector.snapshot();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].author, "ann");
        assert_eq!(results[0].permalink, "https://www.facebook.com/ann/posts/1");
        assert_eq!(results[0].sentiment, Some(Sentiment::Negative));
    }

    #[tokio::test(start_paused = true)]
    async fn keywords_share_one_result_set() {
        let config = get_platform_config(Platform::Twitter);
        let page = MockPage::new(vec![vec![tweet("a", "one", 1), tweet("b", "two", 2)]]).with_element("article");
        let req = request(Platform::Twitter, &["cats", "dogs"], 10);
        let collector = SharedCollector::new(req.limit);

        scrape_keywords(&page, &config, &req, &collector, None, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(page.visited().len(), 2);
        assert!(page.visited()[1].contains("dogs"));
        assert_eq!(collector.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_during_scroll_aborts() {
        let config = get_platform_config(Platform::Twitter);
        let page = MockPage::new(vec![vec![tweet("a", "one", 1)]]).with_element("iframe#arkose_iframe");
        let collector = SharedCollector::new(10);

        let err = collect_posts(&page, &config, &collector, None).await.unwrap_err();
        assert!(err.is_blocked());
        assert_eq!(collector.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn query_string_permalinks_stay_distinct() {
        let config = get_platform_config(Platform::Facebook);
        let page = MockPage::new(vec![vec![
            fb_linked_post("ann", "one", "/permalink.php?story_fbid=111&amp;id=1&amp;__cft__[0]=AZ"),
            fb_linked_post("ben", "two", "/permalink.php?story_fbid=222&amp;id=2&amp;__tn__=%2CO"),
            fb_linked_post("cat", "three", "https://www.facebook.com/story.php?story_fbid=333&amp;id=3"),
            fb_linked_post("ann", "one again", "/permalink.php?story_fbid=111&amp;id=1&amp;__tn__=R"),
        ]]);
        let collector = SharedCollector::new(10);

        collect_posts(&page, &config, &collector, None).await.unwrap();

        let permalinks: Vec<_> = collector.snapshot().into_iter().map(|p| p.permalink).collect();
        assert_eq!(
            permalinks,
            vec![
                "https://www.facebook.com/permalink.php?story_fbid=111&id=1".to_string(),
                "https://www.facebook.com/permalink.php?story_fbid=222&id=2".to_string(),
                "https://www.facebook.com/story.php?story_fbid=333&id=3".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn search_takes_a_token_and_closes_the_browser() {
        let page = MockPage::new(vec![vec![tweet("a", "one", 1), tweet("b", "two", 2), tweet("c", "three", 3)]])
            .with_element("article");
        let (service, sessions, launcher, login, _dir) = twitter_fixture(page, SessionCheck::Always, false);

        let results = service.search(request(Platform::Twitter, &["cats"], 5)).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(login.calls(), 1);
        assert!(sessions.path_for(&get_platform_config(Platform::Twitter)).exists());
        assert_eq!((launcher.launches(), launcher.closes()), (1, 1));
        assert_eq!(launcher.page().visited()[0], "https://x.com/home");

        let tokens = service.limiter(Platform::Twitter).unwrap().available_tokens();
        assert!((2.0..2.1).contains(&tokens), "tokens left: {tokens}");
        let untouched = service.limiter(Platform::Tiktok).unwrap().available_tokens();
        assert_eq!(untouched, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_is_cleared_and_login_runs_once() {
        let page = MockPage::new(vec![vec![tweet("a", "one", 1)]]).redirect_to("https://x.com/i/flow/login");
        let (service, sessions, launcher, login, _dir) = twitter_fixture(page, SessionCheck::Always, true);

        let err = service.search(request(Platform::Twitter, &["cats"], 5)).await.unwrap_err();

        assert!(matches!(err, ScrapeError::SessionExpired(Platform::Twitter)));
        assert_eq!(login.calls(), 1);
        assert_eq!((launcher.launches(), launcher.closes()), (2, 2));
        // only the auth check was visited, never the search page
        assert_eq!(launcher.page().visited(), vec!["https://x.com/home", "https://x.com/home"]);
        // the re-login result was persisted
        let saved = sessions.load(&get_platform_config(Platform::Twitter)).unwrap();
        assert_eq!(saved.map(|s| s.cookies[0].value.clone()).as_deref(), Some("stub"));
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_puts_the_platform_into_cooldown() {
        let page = MockPage::new(vec![vec![tweet("a", "one", 1)]]).with_element("iframe#arkose_iframe");
        let (service, _sessions, launcher, login, _dir) = twitter_fixture(page, SessionCheck::OnFailure, true);

        let err = service.search(request(Platform::Twitter, &["cats"], 5)).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Blocked { platform: Platform::Twitter, .. }));
        assert_eq!(login.calls(), 0);
        assert_eq!((launcher.launches(), launcher.closes()), (1, 1));
        assert!(service.limiter(Platform::Twitter).unwrap().blocked_remaining().is_some());
        assert!(service.limiter(Platform::Tiktok).unwrap().blocked_remaining().is_none());

        let err = service.search(request(Platform::Twitter, &["cats"], 5)).await.unwrap_err();
        assert!(matches!(err, ScrapeError::CoolingDown { .. }));
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_relaunches_the_browser() {
        let page = MockPage::new(vec![vec![tweet("a", "one", 1)]])
            .with_element("article")
            .failing_gotos(1);
        let (service, _sessions, launcher, _login, _dir) = twitter_fixture(page, SessionCheck::OnFailure, true);

        let results = service.search(request(Platform::Twitter, &["cats"], 5)).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!((launcher.launches(), launcher.closes()), (2, 2));
    }
}
