use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::config::PlatformConfig;
use crate::model::ScrapedPost;

/// Value used for any field no strategy could fill.
pub const UNKNOWN: &str = "unknown";

/// Path segments that are routes rather than account names.
const RESERVED_SEGMENTS: [&str; 6] = ["p", "reel", "reels", "explore", "tag", "video"];

/// One way of reading a field out of a result node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Text content of the first descendant matching the selector.
    Text(&'static str),
    /// Attribute of the first descendant matching the selector.
    Attr(&'static str, &'static str),
    /// Attribute of the result node itself.
    OwnAttr(&'static str),
    /// The n-th path segment of a descendant link's `href`.
    HrefSegment(&'static str, usize),
    /// The n-th path segment of the result node's own `href`.
    OwnHrefSegment(usize),
}

impl Strategy {
    pub fn apply(&self, node: ElementRef<'_>) -> Option<String> {
        let value = match *self {
            Strategy::Text(selector) => first(node, selector).map(|el| collapse_whitespace(el.text())),
            Strategy::Attr(selector, attr) => {
                first(node, selector).and_then(|el| el.value().attr(attr).map(str::to_string))
            }
            Strategy::OwnAttr(attr) => node.value().attr(attr).map(str::to_string),
            Strategy::HrefSegment(selector, index) => first(node, selector)
                .and_then(|el| el.value().attr("href"))
                .and_then(|href| path_segment(href, index)),
            Strategy::OwnHrefSegment(index) => node
                .value()
                .attr("href")
                .and_then(|href| path_segment(href, index)),
        };
        value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }
}

fn first<'a>(node: ElementRef<'a>, selector: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(selector).ok()?;
    node.select(&selector).next()
}

fn collapse_whitespace<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn path_segment(href: &str, index: usize) -> Option<String> {
    let path = Url::parse(href)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| href.split(['?', '#']).next().unwrap_or_default().to_string());
    path.split('/')
        .filter(|s| !s.is_empty())
        .nth(index)
        .filter(|s| !RESERVED_SEGMENTS.contains(s))
        .map(|s| s.trim_start_matches('@').to_string())
}

/// Run strategies in order, returning the first non-empty value.
pub fn first_match(strategies: &[Strategy], node: ElementRef<'_>) -> Option<String> {
    strategies.iter().find_map(|strategy| strategy.apply(node))
}

/// Build a post from the outer HTML of one result node. Fields nothing matched
/// come back as [`UNKNOWN`].
pub fn extract(node_html: &str, config: &PlatformConfig) -> ScrapedPost {
    let fragment = Html::parse_fragment(node_html);
    let node = fragment
        .root_element()
        .children()
        .find_map(ElementRef::wrap)
        .unwrap_or_else(|| fragment.root_element());

    let author = first_match(&config.author_strategies, node).unwrap_or_else(|| UNKNOWN.to_string());
    let text = first_match(&config.text_strategies, node)
        .map(|t| clean_text(&t, config.strip_hashtags, config.max_text_chars))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string());
    let permalink = first_match(&config.permalink_strategies, node)
        .and_then(|href| absolutize(&href, config.base_url))
        .unwrap_or_else(|| UNKNOWN.to_string());

    ScrapedPost {
        author,
        text,
        permalink,
        sentiment: None,
        platform: config.platform,
    }
}

/// Whether an extracted post carries enough to be kept.
pub fn is_usable(post: &ScrapedPost, config: &PlatformConfig) -> bool {
    post.permalink != UNKNOWN && (!config.require_text || post.text != UNKNOWN)
}

/// Query keys that only carry share or click tracking.
const TRACKING_PARAMS: &[&str] = &[
    "s", "t", "ref", "refsrc", "igsh", "igshid", "is_from_webapp", "sender_device", "mibextid",
    "rdid", "_r", "_t", "paipv", "eav",
];
const TRACKING_PREFIXES: &[&str] = &["__cft__", "__tn__", "__xts__", "utm_"];

fn is_tracking_param(key: &str) -> bool {
    TRACKING_PARAMS.contains(&key) || TRACKING_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

/// Resolve a possibly relative link against the site origin. Tracking
/// parameters and the fragment are dropped so the same post always yields the
/// same permalink; parameters that identify the post (`story_fbid`, `id`, ...)
/// are kept in their original order.
pub fn absolutize(href: &str, base_url: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    let mut url = base.join(href.trim()).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.set_fragment(None);
    Some(url.into())
}

pub fn clean_text(text: &str, strip_hashtags: bool, max_chars: Option<usize>) -> String {
    let mut cleaned = if strip_hashtags {
        text.split_whitespace()
            .filter(|word| !(word.len() > 1 && word.starts_with('#')))
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        text.trim().to_string()
    };

    if let Some(max) = max_chars {
        if cleaned.chars().count() > max {
            cleaned = cleaned.chars().take(max).collect::<String>() + "...";
        }
    }
    cleaned
}
