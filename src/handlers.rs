use std::str::FromStr;
use std::sync::Arc;

use actix_web::{HttpResponse, Responder, web};
use serde_json::json;
use tracing::info;
use url::Url;

use crate::config::get_platform_config;
use crate::errors::{Result, ScrapeError};
use crate::model::{
    BulkSaveRequest, CookieData, Platform, SchedulerStartRequest, SearchQuery, SearchRequest,
    SearchResponse, SentimentRequest, SentimentResponse, StoredPost,
};
use crate::scheduler::Scheduler;
use crate::scraper::SearchService;
use crate::sentiment::SentimentClassifier;
use crate::session::{SessionStore, StorageState};
use crate::store::PostStore;

pub struct AppState {
    pub search: Arc<dyn SearchService>,
    pub sessions: Arc<SessionStore>,
    pub store: Arc<PostStore>,
    pub scheduler: Scheduler,
    pub sentiment: Option<Arc<dyn SentimentClassifier>>,
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .service(
            web::scope("/api")
                .route("/save", web::post().to(save))
                .route("/save/bulk", web::post().to(save_bulk))
                .route("/sentiment", web::post().to(sentiment))
                .route("/scheduler/start", web::post().to(scheduler_start))
                .route("/scheduler/stop", web::post().to(scheduler_stop))
                .route("/scheduler/status", web::get().to(scheduler_status))
                .route("/{platform}/search", web::get().to(search))
                .route("/{platform}/session", web::delete().to(clear_session))
                .route("/{platform}/session/import", web::post().to(import_session)),
        );
}

pub async fn health() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

fn usage(platform: &str) -> String {
    format!("/api/{platform}/search?q=keyword[,keyword2]&limit=10&since=YYYY-MM-DD&until=YYYY-MM-DD")
}

pub async fn search(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse> {
    let platform = Platform::from_str(&path)?;
    let config = get_platform_config(platform);

    let request = match SearchRequest::from_query(platform, &query, config.default_limit) {
        Ok(request) => request,
        Err(e) => {
            return Ok(HttpResponse::BadRequest().json(json!({
                "error": "Invalid request",
                "message": e.to_string(),
                "usage": usage(platform.as_str()),
            })));
        }
    };

    let keyword = request.keyword_label();
    info!(%platform, keyword, limit = request.limit, "search requested");
    let results = state.search.search(request).await?;

    Ok(HttpResponse::Ok().json(SearchResponse {
        keyword,
        total: results.len(),
        results,
    }))
}

pub async fn clear_session(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let platform = Platform::from_str(&path)?;
    state.sessions.invalidate_async(&get_platform_config(platform)).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "platform": platform,
    })))
}

/// Accepts a cookie-editor export and stores it as the platform's session.
pub async fn import_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<Vec<CookieData>>,
) -> Result<HttpResponse> {
    let platform = Platform::from_str(&path)?;
    let cookies = body.into_inner();
    if cookies.is_empty() {
        return Err(ScrapeError::InvalidInput("cookie list is empty".to_string()));
    }

    let config = get_platform_config(platform);
    let storage = StorageState::from_cookie_export(cookies, config.base_url, &cookie_domain(config.base_url));
    state.sessions.save_async(&config, &storage).await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "platform": platform,
        "cookies": storage.cookies.len(),
    })))
}

/// `https://www.x.com` -> `.x.com`
fn cookie_domain(base_url: &str) -> String {
    let host = Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    format!(".{}", host.trim_start_matches("www."))
}

pub async fn save(state: web::Data<AppState>, body: web::Json<StoredPost>) -> Result<HttpResponse> {
    let store = Arc::clone(&state.store);
    let report = web::block(move || store.save(body.into_inner())).await??;
    Ok(HttpResponse::Ok().json(report))
}

pub async fn save_bulk(state: web::Data<AppState>, body: web::Json<BulkSaveRequest>) -> Result<HttpResponse> {
    let store = Arc::clone(&state.store);
    let rows = body.into_inner().results;
    let report = web::block(move || store.save_bulk(rows)).await??;
    Ok(HttpResponse::Ok().json(report))
}

pub async fn scheduler_start(
    state: web::Data<AppState>,
    body: web::Json<SchedulerStartRequest>,
) -> Result<HttpResponse> {
    let status = state.scheduler.start(&body.keyword, body.interval_hours)?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "status": status })))
}

pub async fn scheduler_stop(state: web::Data<AppState>) -> impl Responder {
    let status = state.scheduler.stop();
    HttpResponse::Ok().json(json!({ "success": true, "status": status }))
}

pub async fn scheduler_status(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.scheduler.status())
}

pub async fn sentiment(state: web::Data<AppState>, body: web::Json<SentimentRequest>) -> Result<HttpResponse> {
    let message = body.into_inner().message;
    if message.trim().is_empty() {
        return Err(ScrapeError::InvalidInput("message is required".to_string()));
    }
    let classifier = state
        .sentiment
        .as_ref()
        .ok_or_else(|| ScrapeError::Sentiment("no sentiment service configured".to_string()))?;

    let sentiment = classifier.classify(&message).await;
    Ok(HttpResponse::Ok().json(SentimentResponse {
        success: true,
        message,
        sentiment,
    }))
}
