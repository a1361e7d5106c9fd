use std::env;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::extractor::Strategy;
use crate::model::Platform;

/// Everything that is specific to one site. Selectors drift whenever the site
/// ships a new front-end, so they live here and nowhere else.
#[derive(Clone, Debug)]
pub struct PlatformConfig {
    pub platform: Platform,
    pub base_url: &'static str,
    pub login_url: &'static str,
    /// Exact URLs (query string ignored) that mean the interactive login finished.
    pub login_success_urls: Vec<&'static str>,
    /// Elements that only render for a signed-in user.
    pub login_markers: Vec<&'static str>,
    /// Authenticated page used to check a restored session.
    pub auth_check_url: &'static str,
    pub login_redirect_fragments: Vec<&'static str>,
    pub login_form_selectors: Vec<&'static str>,
    pub search: SearchUrl,
    /// Any of these appearing means the result page rendered.
    pub ready_selectors: Vec<&'static str>,
    pub result_selector: &'static str,
    pub author_strategies: Vec<Strategy>,
    pub text_strategies: Vec<Strategy>,
    pub permalink_strategies: Vec<Strategy>,
    pub require_text: bool,
    pub strip_hashtags: bool,
    pub max_text_chars: Option<usize>,
    pub scroll_delay: Duration,
    pub max_scroll_attempts: u32,
    pub challenge_url_fragments: Vec<&'static str>,
    pub challenge_selectors: Vec<&'static str>,
    pub session_file: &'static str,
    pub default_limit: usize,
    pub sentiment_filter: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchUrl {
    /// `https://www.facebook.com/search/posts/?q=<keyword>`
    FacebookPosts,
    /// `https://www.instagram.com/explore/tags/<keyword>/`
    InstagramTag,
    /// `https://www.tiktok.com/tag/<keyword>`
    TiktokTag,
    /// `https://x.com/search?q=<keyword since: until:>&f=live`
    TwitterLive,
}

impl PlatformConfig {
    pub fn search_url(&self, keyword: &str, since: Option<&str>, until: Option<&str>) -> String {
        let keyword = keyword.trim();
        match self.search {
            SearchUrl::FacebookPosts => {
                Url::parse_with_params("https://www.facebook.com/search/posts/", &[("q", keyword)])
                    .map(String::from)
                    .unwrap_or_default()
            }
            SearchUrl::InstagramTag => {
                path_url("https://www.instagram.com/explore/tags/", &[keyword, ""])
            }
            SearchUrl::TiktokTag => {
                path_url("https://www.tiktok.com/tag/", &[keyword.trim_start_matches('#')])
            }
            SearchUrl::TwitterLive => {
                let mut query = keyword.to_string();
                if let Some(since) = since {
                    query.push_str(&format!(" since:{since}"));
                }
                if let Some(until) = until {
                    query.push_str(&format!(" until:{until}"));
                }
                Url::parse_with_params("https://x.com/search", &[("q", query.as_str()), ("f", "live")])
                    .map(String::from)
                    .unwrap_or_default()
            }
        }
    }

    /// Whether `url` is one of the post-login landing pages.
    pub fn is_login_success_url(&self, url: &str) -> bool {
        let bare = strip_query(url);
        self.login_success_urls
            .iter()
            .any(|candidate| bare == *candidate || bare.trim_end_matches('/') == candidate.trim_end_matches('/'))
    }

    pub fn is_login_redirect(&self, url: &str) -> bool {
        let path = Url::parse(url).map(|u| u.path().to_string()).unwrap_or_else(|_| url.to_string());
        self.login_redirect_fragments.iter().any(|f| path.contains(f))
    }

    pub fn challenge_in_url(&self, url: &str) -> Option<&'static str> {
        self.challenge_url_fragments.iter().copied().find(|f| url.contains(f))
    }
}

fn strip_query(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

fn path_url(base: &str, segments: &[&str]) -> String {
    let Ok(mut url) = Url::parse(base) else {
        return String::new();
    };
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty();
        path.extend(segments);
    }
    url.into()
}

const COMMON_CHALLENGE_SELECTORS: [&str; 4] = [
    "iframe[src*='captcha']",
    "iframe[src*='recaptcha']",
    "[data-sitekey]",
    "#captcha-verify-image",
];

pub fn get_platform_config(platform: Platform) -> PlatformConfig {
    match platform {
        Platform::Facebook => PlatformConfig {
            platform,
            base_url: "https://www.facebook.com",
            login_url: "https://www.facebook.com/login",
            login_success_urls: vec!["https://www.facebook.com/"],
            login_markers: vec![
                "[aria-label='Your profile']",
                "[data-pagelet='LeftRail']",
            ],
            auth_check_url: "https://www.facebook.com/",
            login_redirect_fragments: vec!["/login", "/checkpoint/block"],
            login_form_selectors: vec!["#email", "input[name='pass']"],
            search: SearchUrl::FacebookPosts,
            ready_selectors: vec!["[role='article']"],
            result_selector: "[role='article']",
            author_strategies: vec![
                Strategy::Text("strong a"),
                Strategy::Text("h3 a, h3 span"),
                Strategy::Text("div[dir='auto'] span"),
            ],
            text_strategies: vec![Strategy::Text("div[dir='auto']")],
            permalink_strategies: vec![
                Strategy::Attr("a[tabindex='0']", "href"),
                Strategy::Attr("a[href*='/posts/']", "href"),
            ],
            require_text: true,
            strip_hashtags: false,
            max_text_chars: None,
            scroll_delay: Duration::from_secs(2),
            max_scroll_attempts: 5,
            challenge_url_fragments: vec!["/checkpoint", "/captcha"],
            challenge_selectors: COMMON_CHALLENGE_SELECTORS.to_vec(),
            session_file: "storageStateFacebook.json",
            default_limit: 10,
            sentiment_filter: true,
        },
        Platform::Instagram => PlatformConfig {
            platform,
            base_url: "https://www.instagram.com",
            login_url: "https://www.instagram.com/accounts/login/",
            login_success_urls: vec!["https://www.instagram.com/"],
            login_markers: vec!["svg[aria-label='Home']", "[aria-label='Home']"],
            auth_check_url: "https://www.instagram.com/",
            login_redirect_fragments: vec!["/accounts/login"],
            login_form_selectors: vec!["input[name='username']", "input[name='password']"],
            search: SearchUrl::InstagramTag,
            ready_selectors: vec!["article > div img", "main a[href*='/p/']"],
            result_selector: "article a[href*='/p/'], main a[href*='/p/'], main a[href*='/reel/']",
            author_strategies: vec![
                Strategy::Text("header a"),
                Strategy::OwnHrefSegment(0),
            ],
            text_strategies: vec![
                Strategy::Attr("img", "alt"),
                Strategy::Text("h1"),
                Strategy::Text("div.C4VMK > span"),
            ],
            permalink_strategies: vec![Strategy::OwnAttr("href")],
            require_text: false,
            strip_hashtags: false,
            max_text_chars: None,
            scroll_delay: Duration::from_secs(2),
            max_scroll_attempts: 5,
            challenge_url_fragments: vec!["/challenge", "/accounts/suspended"],
            challenge_selectors: COMMON_CHALLENGE_SELECTORS.to_vec(),
            session_file: "storageStateIG.json",
            default_limit: 20,
            sentiment_filter: false,
        },
        Platform::Tiktok => PlatformConfig {
            platform,
            base_url: "https://www.tiktok.com",
            login_url: "https://www.tiktok.com/login",
            login_success_urls: vec!["https://www.tiktok.com/", "https://www.tiktok.com/foryou"],
            login_markers: vec!["[data-e2e='profile-icon']"],
            auth_check_url: "https://www.tiktok.com/foryou",
            login_redirect_fragments: vec!["/login"],
            login_form_selectors: vec!["input[name='username']", "input[type='password']"],
            search: SearchUrl::TiktokTag,
            ready_selectors: vec![
                "div[data-e2e='search-video-card'] a",
                "div[data-e2e='challenge-item'] a",
            ],
            result_selector: "div[data-e2e='search-video-card'], div[data-e2e='challenge-item']",
            author_strategies: vec![
                Strategy::Text("[data-e2e='search-card-user-unique-id']"),
                Strategy::Text("[data-e2e='challenge-item-username']"),
                Strategy::Text("a[data-e2e='video-page-follower-username']"),
                Strategy::HrefSegment("a[href*='/video/']", 0),
            ],
            text_strategies: vec![
                Strategy::Text("[data-e2e='search-card-video-caption']"),
                Strategy::Text("h1[data-e2e='challenge-item-desc']"),
                Strategy::Text("div[data-e2e='video-desc']"),
                Strategy::Attr("img", "alt"),
            ],
            permalink_strategies: vec![
                Strategy::Attr("a[href*='/video/']", "href"),
                Strategy::Attr("a", "href"),
            ],
            require_text: false,
            strip_hashtags: true,
            max_text_chars: Some(200),
            scroll_delay: Duration::from_secs(2),
            max_scroll_attempts: 5,
            challenge_url_fragments: vec!["/verify", "captcha"],
            challenge_selectors: COMMON_CHALLENGE_SELECTORS
                .iter()
                .copied()
                .chain(["#tiktok-verify-ele", ".captcha_verify_container"])
                .collect(),
            session_file: "storageStateTikTok.json",
            default_limit: 10,
            sentiment_filter: false,
        },
        Platform::Twitter => PlatformConfig {
            platform,
            base_url: "https://x.com",
            login_url: "https://x.com/login",
            login_success_urls: vec!["https://x.com/home", "https://x.com/", "https://twitter.com/home"],
            login_markers: vec![
                "[data-testid='primaryColumn']",
                "nav[aria-label='Primary']",
                "[data-testid='SideNav_NewTweet_Button']",
                "[data-testid='SideNav_AccountSwitcher_Button']",
                "[data-testid='AppTabBar_Profile_Link']",
            ],
            auth_check_url: "https://x.com/home",
            login_redirect_fragments: vec!["/login", "/i/flow/login", "/i/flow/signup"],
            login_form_selectors: vec!["input[autocomplete='username']", "input[name='password']"],
            search: SearchUrl::TwitterLive,
            ready_selectors: vec!["article div[data-testid='tweetText']", "article"],
            result_selector: "article",
            author_strategies: vec![
                Strategy::Text("div[dir='ltr'] > span"),
                Strategy::Text("[data-testid='User-Name'] span"),
            ],
            text_strategies: vec![Strategy::Text("div[data-testid='tweetText']")],
            permalink_strategies: vec![Strategy::Attr("a[role='link'][href*='/status/']", "href")],
            require_text: true,
            strip_hashtags: false,
            max_text_chars: None,
            scroll_delay: Duration::from_secs(3),
            max_scroll_attempts: 10,
            challenge_url_fragments: vec!["/account/access", "/i/flow/consent"],
            challenge_selectors: COMMON_CHALLENGE_SELECTORS
                .iter()
                .copied()
                .chain(["iframe#arkose_iframe", "[data-testid='ocfEnterTextTextInput']"])
                .collect(),
            session_file: "storageStateTwitter.json",
            default_limit: 10,
            sentiment_filter: false,
        },
    }
}

/// When a restored session gets checked against `auth_check_url`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionCheck {
    /// Before every scrape.
    Always,
    /// Only after a scrape lands on a login page.
    OnFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeywordMode {
    Sequential,
    Concurrent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SentimentMode {
    /// `POST {base}/v1/chat/completions`
    Chat,
    /// `POST {base}/sentiment` with `{ text }`
    Simple,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub sessions_dir: PathBuf,
    pub store_path: PathBuf,
    pub static_dir: PathBuf,
    pub headless: bool,
    pub sentiment_url: Option<String>,
    pub sentiment_mode: SentimentMode,
    pub sentiment_model: String,
    pub bucket_size: f64,
    pub tokens_per_second: f64,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub block_cooldown: Duration,
    pub session_check: SessionCheck,
    pub keyword_mode: KeywordMode,
    pub keyword_delay: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            sessions_dir: PathBuf::from("./sessions"),
            store_path: PathBuf::from("./data/posts.jsonl"),
            static_dir: PathBuf::from("./static"),
            headless: true,
            sentiment_url: None,
            sentiment_mode: SentimentMode::Chat,
            sentiment_model: "pathumma-llm-text-1.0.0".to_string(),
            bucket_size: 3.0,
            tokens_per_second: 0.2,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(60),
            block_cooldown: Duration::from_secs(30 * 60),
            session_check: SessionCheck::Always,
            keyword_mode: KeywordMode::Sequential,
            keyword_delay: Duration::from_secs(5),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parse_env("PORT").unwrap_or(defaults.port),
            sessions_dir: env::var("SESSIONS_DIR").map(PathBuf::from).unwrap_or(defaults.sessions_dir),
            store_path: env::var("STORE_PATH").map(PathBuf::from).unwrap_or(defaults.store_path),
            static_dir: env::var("STATIC_DIR").map(PathBuf::from).unwrap_or(defaults.static_dir),
            headless: parse_bool_env("HEADLESS").unwrap_or(defaults.headless),
            sentiment_url: env::var("SENTIMENT_URL")
                .or_else(|_| env::var("LM_STUDIO_URL"))
                .ok()
                .filter(|u| !u.trim().is_empty()),
            sentiment_mode: match env::var("SENTIMENT_MODE").as_deref() {
                Ok("simple") => SentimentMode::Simple,
                _ => defaults.sentiment_mode,
            },
            sentiment_model: env::var("SENTIMENT_MODEL").unwrap_or(defaults.sentiment_model),
            bucket_size: parse_env("RATE_BUCKET_SIZE").unwrap_or(defaults.bucket_size),
            tokens_per_second: parse_env("RATE_TOKENS_PER_SEC").unwrap_or(defaults.tokens_per_second),
            retry_max_attempts: parse_env("RETRY_MAX_ATTEMPTS").unwrap_or(defaults.retry_max_attempts),
            retry_base_delay: defaults.retry_base_delay,
            retry_max_delay: defaults.retry_max_delay,
            block_cooldown: parse_env("BLOCK_COOLDOWN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.block_cooldown),
            session_check: match env::var("SESSION_CHECK").as_deref() {
                Ok("on_failure") => SessionCheck::OnFailure,
                _ => defaults.session_check,
            },
            keyword_mode: match env::var("KEYWORD_MODE").as_deref() {
                Ok("concurrent") => KeywordMode::Concurrent,
                _ => defaults.keyword_mode,
            },
            keyword_delay: parse_env("KEYWORD_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.keyword_delay),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_bool_env(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|v| match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    })
}
