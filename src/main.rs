// src/main.rs
use std::sync::Arc;

use actix_files::Files;
use actix_web::{App, HttpServer, middleware::Logger, web};
use anyhow::Context;
use tracing::{info, warn};

mod browser;
mod collector;
mod config;
mod errors;
mod extractor;
mod handlers;
mod login;
mod model;
mod navigator;
mod rate_limit;
mod retry;
mod scheduler;
mod scraper;
mod sentiment;
mod session;
mod store;
#[cfg(test)]
mod testing;

use browser::ChromeLauncher;
use config::AppConfig;
use handlers::AppState;
use login::InteractiveLogin;
use scheduler::Scheduler;
use scraper::{ScrapeService, SearchService};
use sentiment::{HttpSentimentClient, SentimentClassifier};
use session::SessionStore;
use store::PostStore;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env();
    info!("🚀 starting on port {}", config.port);

    let sessions = Arc::new(SessionStore::new(&config.sessions_dir));
    let store = Arc::new(
        PostStore::open(&config.store_path)
            .with_context(|| format!("opening post store at {}", config.store_path.display()))?,
    );
    info!(posts = store.len(), path = %config.store_path.display(), "post store loaded");

    let sentiment: Option<Arc<dyn SentimentClassifier>> = match &config.sentiment_url {
        Some(url) => {
            info!(url, "sentiment filtering enabled");
            Some(Arc::new(HttpSentimentClient::new(
                url,
                config.sentiment_mode,
                &config.sentiment_model,
            )?))
        }
        None => {
            warn!("SENTIMENT_URL not set, posts will not be classified");
            None
        }
    };

    let search: Arc<dyn SearchService> = Arc::new(ScrapeService::new(
        &config,
        sessions.clone(),
        Arc::new(InteractiveLogin::default()),
        Arc::new(ChromeLauncher {
            headless: config.headless,
        }),
        sentiment.clone(),
    ));

    let state = web::Data::new(AppState {
        search: search.clone(),
        sessions,
        store: store.clone(),
        scheduler: Scheduler::new(search, store),
        sentiment,
    });

    let static_dir = config.static_dir.clone();
    let serve_static = static_dir.is_dir();
    if !serve_static {
        info!(dir = %static_dir.display(), "no static directory, dashboard disabled");
    }

    let server = HttpServer::new(move || {
        let app = App::new()
            .wrap(Logger::default())
            .app_data(state.clone())
            .configure(handlers::routes);
        if serve_static {
            app.service(Files::new("/", &static_dir).index_file("index.html"))
        } else {
            app
        }
    })
    .bind(("0.0.0.0", config.port))
    .with_context(|| format!("binding 0.0.0.0:{}", config.port))?;

    info!("🎧 listening on 0.0.0.0:{}", config.port);
    server.run().await?;
    info!("👋 server shut down");
    Ok(())
}
