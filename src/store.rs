use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::errors::{Result, ScrapeError};
use crate::model::{SaveReport, StoredPost};

struct StoreInner {
    file: File,
    seen: HashSet<String>,
}

/// Append-only JSON-lines file of saved posts, unique by `baseurl`.
pub struct PostStore {
    inner: Mutex<StoreInner>,
}

impl PostStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut seen = HashSet::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoredPost>(&line) {
                    Ok(post) => {
                        seen.insert(post.baseurl);
                    }
                    Err(e) => warn!(line = line_no + 1, error = %e, "skipping unreadable stored post"),
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), existing = seen.len(), "post store opened");
        Ok(Self {
            inner: Mutex::new(StoreInner { file, seen }),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    #[cfg(test)]
    pub fn contains(&self, baseurl: &str) -> bool {
        self.lock().seen.contains(baseurl)
    }

    pub fn save(&self, post: StoredPost) -> Result<SaveReport> {
        if post.baseurl.trim().is_empty() {
            return Err(ScrapeError::InvalidInput("baseurl is required".to_string()));
        }
        self.save_bulk(vec![post])
    }

    /// Insert every post whose `baseurl` is not stored yet.
    pub fn save_bulk(&self, posts: Vec<StoredPost>) -> Result<SaveReport> {
        let mut report = SaveReport::default();
        let mut inner = self.lock();
        for post in posts {
            if post.baseurl.trim().is_empty() {
                warn!(username = %post.username, "skipping post without baseurl");
                continue;
            }
            if inner.seen.contains(&post.baseurl) {
                report.duplicates += 1;
                continue;
            }
            let line = serde_json::to_string(&post)?;
            writeln!(inner.file, "{line}").map_err(|e| ScrapeError::Storage(e.to_string()))?;
            inner.seen.insert(post.baseurl);
            report.saved += 1;
        }
        inner.file.flush()?;
        info!(saved = report.saved, duplicates = report.duplicates, "posts saved");
        Ok(report)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(url: &str) -> StoredPost {
        StoredPost {
            username: "user".to_string(),
            caption: "caption".to_string(),
            platform: "twitter".to_string(),
            baseurl: url.to_string(),
        }
    }

    #[test]
    fn duplicates_are_skipped_within_and_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = PostStore::open(dir.path().join("posts.jsonl")).unwrap();

        let report = store
            .save_bulk(vec![row("https://x.com/a/status/1"), row("https://x.com/a/status/1"), row("https://x.com/a/status/2")])
            .unwrap();
        assert_eq!(report, SaveReport { saved: 2, duplicates: 1 });

        let report = store.save(row("https://x.com/a/status/2")).unwrap();
        assert_eq!(report, SaveReport { saved: 0, duplicates: 1 });
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn reopening_remembers_saved_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("posts.jsonl");
        {
            let store = PostStore::open(&path).unwrap();
            store.save(row("https://www.tiktok.com/@a/video/1")).unwrap();
        }
        let store = PostStore::open(&path).unwrap();
        assert!(store.contains("https://www.tiktok.com/@a/video/1"));
        let report = store.save(row("https://www.tiktok.com/@a/video/1")).unwrap();
        assert_eq!(report.saved, 0);
    }

    #[test]
    fn empty_baseurl_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PostStore::open(dir.path().join("posts.jsonl")).unwrap();
        assert!(matches!(store.save(row(" ")), Err(ScrapeError::InvalidInput(_))));
        let report = store.save_bulk(vec![row(""), row("https://x.com/b/status/9")]).unwrap();
        assert_eq!(report, SaveReport { saved: 1, duplicates: 0 });
    }
}
