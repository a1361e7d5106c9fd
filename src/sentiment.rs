use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::SentimentMode;
use crate::errors::{Result, ScrapeError};
use crate::model::Sentiment;

const SYSTEM_PROMPT: &str = "You classify social media posts. Answer with exactly one word: \
'positive' or 'negative'. Do not explain.";

#[async_trait]
pub trait SentimentClassifier: Send + Sync {
    /// Never fails; anything that goes wrong is [`Sentiment::Unknown`].
    async fn classify(&self, text: &str) -> Sentiment;
}

/// Map a free-form model answer onto a label. Thai answers are accepted too.
pub fn parse_label(raw: &str) -> Sentiment {
    let lowered = raw.trim().to_lowercase();
    if lowered.contains("positive") || lowered.contains("บวก") {
        Sentiment::Positive
    } else if lowered.contains("negative") || lowered.contains("ลบ") {
        Sentiment::Negative
    } else {
        Sentiment::Unknown
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Serialize)]
struct SimpleRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct SimpleResponse {
    sentiment: String,
}

/// Client for an external classification service, either an
/// OpenAI-compatible chat endpoint or a plain `/sentiment` endpoint.
pub struct HttpSentimentClient {
    client: reqwest::Client,
    base_url: String,
    mode: SentimentMode,
    model: String,
}

impl HttpSentimentClient {
    pub fn new(base_url: &str, mode: SentimentMode, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            mode,
            model: model.to_string(),
        })
    }

    /// Like [`SentimentClassifier::classify`] but surfaces transport errors.
    pub async fn try_classify(&self, text: &str) -> Result<Sentiment> {
        if text.trim().is_empty() {
            return Ok(Sentiment::Unknown);
        }
        let raw = match self.mode {
            SentimentMode::Chat => self.chat(text).await?,
            SentimentMode::Simple => self.simple(text).await?,
        };
        debug!(raw, "sentiment answer");
        Ok(parse_label(&raw))
    }

    async fn chat(&self, text: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": format!("Classify: \"{text}\"") },
            ],
            "temperature": 0.1,
            "max_tokens": 100,
            "stream": false,
        });
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ScrapeError::Sentiment(format!("HTTP {}", status.as_u16())));
        }
        let completion: ChatCompletion = resp.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ScrapeError::Sentiment("empty completion".to_string()))
    }

    async fn simple(&self, text: &str) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/sentiment", self.base_url))
            .json(&SimpleRequest { text })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ScrapeError::Sentiment(format!("HTTP {}", status.as_u16())));
        }
        let parsed: SimpleResponse = resp.json().await?;
        Ok(parsed.sentiment)
    }
}

#[async_trait]
impl SentimentClassifier for HttpSentimentClient {
    async fn classify(&self, text: &str) -> Sentiment {
        match self.try_classify(text).await {
            Ok(sentiment) => sentiment,
            Err(e) => {
                warn!(error = %e, "sentiment classification failed");
                Sentiment::Unknown
            }
        }
    }
}
