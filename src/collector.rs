use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::model::ScrapedPost;

/// `true` once `count` reached `limit`.
pub fn is_complete(count: usize, limit: usize) -> bool {
    count >= limit
}

/// Keeps the first post seen for each permalink, up to `limit`.
#[derive(Debug)]
pub struct Collector {
    limit: usize,
    seen: HashSet<String>,
    results: Vec<ScrapedPost>,
}

impl Collector {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            seen: HashSet::new(),
            results: Vec::new(),
        }
    }

    /// Record `post` unless its permalink was already collected or the
    /// limit is reached. Returns whether it was kept.
    pub fn add_if_new(&mut self, post: ScrapedPost) -> bool {
        if self.is_full() || self.seen.contains(&post.permalink) {
            return false;
        }
        self.seen.insert(post.permalink.clone());
        self.results.push(post);
        true
    }

    pub fn contains(&self, permalink: &str) -> bool {
        self.seen.contains(permalink)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_full(&self) -> bool {
        is_complete(self.results.len(), self.limit)
    }

    /// Done when the limit is reached or scrolling stopped producing content.
    pub fn is_complete(&self, stalled_scrolls: u32, max_scroll_attempts: u32) -> bool {
        self.is_full() || stalled_scrolls >= max_scroll_attempts
    }

    #[cfg(test)]
    pub fn into_results(self) -> Vec<ScrapedPost> {
        self.results
    }
}

/// A collector shared by concurrent per-keyword tasks. Whichever task inserts
/// a permalink first wins.
#[derive(Clone, Debug)]
pub struct SharedCollector(Arc<Mutex<Collector>>);

impl SharedCollector {
    pub fn new(limit: usize) -> Self {
        Self(Arc::new(Mutex::new(Collector::new(limit))))
    }

    pub fn add_if_new(&self, post: ScrapedPost) -> bool {
        match self.0.lock() {
            Ok(mut collector) => collector.add_if_new(post),
            Err(poisoned) => poisoned.into_inner().add_if_new(post),
        }
    }

    pub fn contains(&self, permalink: &str) -> bool {
        self.with(|c| c.contains(permalink))
    }

    pub fn len(&self) -> usize {
        self.with(|c| c.len())
    }

    pub fn is_full(&self) -> bool {
        self.with(|c| c.is_full())
    }

    pub fn is_complete(&self, stalled_scrolls: u32, max_scroll_attempts: u32) -> bool {
        self.with(|c| c.is_complete(stalled_scrolls, max_scroll_attempts))
    }

    pub fn snapshot(&self) -> Vec<ScrapedPost> {
        self.with(|c| c.results.clone())
    }

    fn with<T>(&self, f: impl FnOnce(&Collector) -> T) -> T {
        match self.0.lock() {
            Ok(collector) => f(&collector),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}
