use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ScrapeError;

/// Upper bound on a single search's `limit`.
pub const MAX_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Instagram,
    Tiktok,
    Twitter,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Facebook,
        Platform::Instagram,
        Platform::Tiktok,
        Platform::Twitter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Twitter => "twitter",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "facebook" | "fb" => Ok(Platform::Facebook),
            "instagram" | "ig" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::Tiktok),
            "twitter" | "x" => Ok(Platform::Twitter),
            other => Err(ScrapeError::InvalidInput(format!("Unknown platform: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Unknown,
}

/// One result node, as produced by the extractor. Never mutated after
/// extraction apart from attaching a sentiment label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedPost {
    pub author: String,
    pub text: String,
    pub permalink: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    pub platform: Platform,
}

impl ScrapedPost {
    pub fn with_sentiment(self, sentiment: Sentiment) -> Self {
        Self {
            sentiment: Some(sentiment),
            ..self
        }
    }
}

/// Raw query string of `GET /api/{platform}/search`.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub platform: Platform,
    pub keywords: Vec<String>,
    pub limit: usize,
    pub since: Option<String>,
    pub until: Option<String>,
}

impl SearchRequest {
    /// Validate a raw query. `q` may hold a comma-separated keyword list.
    pub fn from_query(
        platform: Platform,
        query: &SearchQuery,
        default_limit: usize,
    ) -> Result<Self, ScrapeError> {
        let raw = query
            .q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ScrapeError::InvalidInput("Missing ?q=keyword".to_string()))?;

        let keywords = split_keywords(raw);
        if keywords.is_empty() {
            return Err(ScrapeError::InvalidInput("Missing ?q=keyword".to_string()));
        }

        let limit = match query.limit.as_deref().map(str::trim) {
            None | Some("") => default_limit,
            Some(raw_limit) => raw_limit
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    ScrapeError::InvalidInput(format!("limit must be a positive integer, got {raw_limit}"))
                })?,
        };

        Ok(Self {
            platform,
            keywords,
            limit: limit.min(MAX_LIMIT),
            since: non_empty(query.since.as_deref()),
            until: non_empty(query.until.as_deref()),
        })
    }

    pub fn keyword_label(&self) -> String {
        self.keywords.join(", ")
    }
}

pub fn split_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(String::from)
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SearchResponse {
    pub keyword: String,
    pub total: usize,
    pub results: Vec<ScrapedPost>,
}

/// A row at the persistence boundary. Unique by `baseurl`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredPost {
    pub username: String,
    pub caption: String,
    pub platform: String,
    pub baseurl: String,
}

impl From<&ScrapedPost> for StoredPost {
    fn from(post: &ScrapedPost) -> Self {
        Self {
            username: post.author.clone(),
            caption: post.text.clone(),
            platform: post.platform.to_string(),
            baseurl: post.permalink.clone(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct BulkSaveRequest {
    pub results: Vec<StoredPost>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq)]
pub struct SaveReport {
    pub saved: usize,
    pub duplicates: usize,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStartRequest {
    pub keyword: String,
    pub interval_hours: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub keyword: String,
    pub interval_hours: f64,
    pub search_limit: usize,
    pub total_collected: usize,
    pub last_search_time: Option<DateTime<Utc>>,
    pub next_search_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug)]
pub struct SentimentRequest {
    #[serde(default)]
    pub message: String,
}

#[derive(Serialize, Debug)]
pub struct SentimentResponse {
    pub success: bool,
    pub message: String,
    pub sentiment: Sentiment,
}

/// A cookie as exported by browser cookie-editor extensions.
#[derive(Deserialize, Clone, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CookieData {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expiration_date: Option<f64>,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub http_only: Option<bool>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default)]
    pub same_site: Option<String>,
}
