// src/errors.rs
use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

use crate::model::Platform;

pub type Result<T> = std::result::Result<T, ScrapeError>;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Failed to launch browser: {0}")]
    BrowserLaunch(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Failed to create new page: {0}")]
    PageCreation(String),

    #[error("JavaScript evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("Security challenge detected on {platform}: {marker}")]
    Blocked { platform: Platform, marker: String },

    #[error("Rate limiter is cooling down after a block ({remaining_secs}s left)")]
    CoolingDown { remaining_secs: u64 },

    #[error("Session for {0} expired, interactive login required")]
    SessionExpired(Platform),

    #[error("Interactive login for {platform} did not complete: {reason}")]
    LoginAborted { platform: Platform, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Sentiment request failed: {0}")]
    Sentiment(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScrapeError {
    /// Anti-bot responses. These abort a run immediately instead of retrying.
    pub fn is_blocked(&self) -> bool {
        matches!(self, ScrapeError::Blocked { .. } | ScrapeError::CoolingDown { .. })
    }

    /// Transient browser and network failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScrapeError::BrowserLaunch(_)
                | ScrapeError::Navigation(_)
                | ScrapeError::PageCreation(_)
                | ScrapeError::EvaluationFailed(_)
        )
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(err: reqwest::Error) -> Self {
        ScrapeError::Sentiment(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ScrapeError {
    fn from(err: tokio::task::JoinError) -> Self {
        ScrapeError::Storage(format!("blocking task failed: {err}"))
    }
}

impl From<actix_web::error::BlockingError> for ScrapeError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        ScrapeError::Storage(err.to_string())
    }
}

impl ResponseError for ScrapeError {
    fn status_code(&self) -> StatusCode {
        match self {
            ScrapeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ScrapeError::Blocked { .. } | ScrapeError::CoolingDown { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let error = match self {
            ScrapeError::InvalidInput(_) => "Invalid request",
            ScrapeError::Blocked { .. } | ScrapeError::CoolingDown { .. } => "Blocked by platform",
            ScrapeError::SessionExpired(_) | ScrapeError::LoginAborted { .. } => "Login required",
            _ => "Search failed",
        };
        HttpResponse::build(self.status_code()).json(json!({
            "error": error,
            "message": self.to_string(),
        }))
    }
}
