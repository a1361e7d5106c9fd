use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::task;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{Result, ScrapeError};
use crate::model::{Platform, SchedulerStatus, SearchRequest, StoredPost, split_keywords};
use crate::scraper::SearchService;
use crate::store::PostStore;

const PLATFORMS: [Platform; 2] = [Platform::Twitter, Platform::Tiktok];
const INITIAL_LIMIT: usize = 40;
const LIMIT_STEP: usize = 10;
const LIMIT_CEILING: usize = 60;

#[derive(Default)]
struct Shared {
    status: SchedulerStatus,
    cancel: Option<CancellationToken>,
    /// Bumped on every start so a replaced loop stops touching the status.
    generation: u64,
}

/// Periodic keyword collection across twitter and tiktok. Each run saves what
/// it finds to the post store; the per-run limit grows until it hits the
/// ceiling.
#[derive(Clone)]
pub struct Scheduler {
    search: Arc<dyn SearchService>,
    store: Arc<PostStore>,
    shared: Arc<Mutex<Shared>>,
}

impl Scheduler {
    pub fn new(search: Arc<dyn SearchService>, store: Arc<PostStore>) -> Self {
        Self {
            search,
            store,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Replace any running schedule, run once now, then every `interval_hours`.
    pub fn start(&self, keyword: &str, interval_hours: f64) -> Result<SchedulerStatus> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(ScrapeError::InvalidInput("keyword is required".to_string()));
        }
        if !interval_hours.is_finite() || interval_hours <= 0.0 {
            return Err(ScrapeError::InvalidInput(
                "intervalHours must be a positive number".to_string(),
            ));
        }
        let interval = Duration::try_from_secs_f64(interval_hours * 3600.0)
            .map_err(|_| ScrapeError::InvalidInput("intervalHours is too large".to_string()))?;
        let next_search_time = TimeDelta::from_std(interval)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta));

        let token = CancellationToken::new();
        let (generation, status) = {
            let mut shared = self.lock();
            if let Some(previous) = shared.cancel.take() {
                info!(keyword = %shared.status.keyword, "replacing running schedule");
                previous.cancel();
            }
            shared.generation += 1;
            shared.cancel = Some(token.clone());
            shared.status = SchedulerStatus {
                is_running: true,
                keyword: keyword.to_string(),
                interval_hours,
                search_limit: INITIAL_LIMIT,
                next_search_time,
                ..SchedulerStatus::default()
            };
            (shared.generation, shared.status.clone())
        };

        info!("⏰ scheduler started: '{}' every {}h", keyword, interval_hours);
        tokio::spawn(self.clone().run(generation, keyword.to_string(), interval, token));
        Ok(status)
    }

    /// Cancel the schedule. A search already in flight finishes first.
    /// Collected totals and the current limit stay visible.
    pub fn stop(&self) -> SchedulerStatus {
        let mut shared = self.lock();
        if let Some(token) = shared.cancel.take() {
            token.cancel();
            info!(keyword = %shared.status.keyword, "scheduler stopped");
        }
        let status = &mut shared.status;
        status.is_running = false;
        status.keyword.clear();
        status.interval_hours = 0.0;
        status.last_search_time = None;
        status.next_search_time = None;
        status.clone()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.lock().status.clone()
    }

    async fn run(self, generation: u64, keyword: String, interval: Duration, token: CancellationToken) {
        loop {
            self.run_once(generation, &keyword, &token).await;
            if token.is_cancelled() {
                break;
            }

            let next = TimeDelta::from_std(interval)
                .ok()
                .and_then(|delta| Utc::now().checked_add_signed(delta));
            self.update(generation, |status| status.next_search_time = next);

            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }
    }

    async fn run_once(&self, generation: u64, keyword: &str, token: &CancellationToken) {
        let limit = self.lock().status.search_limit;
        let mut saved = 0;

        for platform in PLATFORMS {
            if token.is_cancelled() {
                return;
            }
            let request = SearchRequest {
                platform,
                keywords: split_keywords(keyword),
                limit,
                since: None,
                until: None,
            };
            match self.search.search(request).await {
                Ok(posts) => {
                    let rows = posts.iter().map(StoredPost::from).collect();
                    let store = Arc::clone(&self.store);
                    match task::spawn_blocking(move || store.save_bulk(rows)).await {
                        Ok(Ok(report)) => saved += report.saved,
                        Ok(Err(e)) => warn!(%platform, error = %e, "could not save scheduled results"),
                        Err(e) => warn!(%platform, error = %e, "save task failed"),
                    }
                }
                Err(e) => warn!(%platform, error = %e, "scheduled search failed"),
            }
        }

        info!(keyword, limit, saved, "scheduled run finished");
        self.update(generation, |status| {
            status.total_collected += saved;
            status.last_search_time = Some(Utc::now());
            status.search_limit = (limit + LIMIT_STEP).min(LIMIT_CEILING);
        });
    }

    fn update(&self, generation: u64, apply: impl FnOnce(&mut SchedulerStatus)) {
        let mut shared = self.lock();
        if shared.generation == generation && shared.status.is_running {
            apply(&mut shared.status);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
