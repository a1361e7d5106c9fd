//! Logged-in browser state per platform, persisted as storage-state JSON
//! (`{ cookies, origins }`) so existing session files stay interchangeable.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{info, instrument, warn};

use crate::browser::PageDriver;
use crate::config::PlatformConfig;
use crate::errors::Result;
use crate::model::{CookieData, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Unix seconds, `-1` for session cookies.
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: SameSite,
}

fn default_path() -> String {
    "/".to_string()
}

fn session_expiry() -> f64 {
    -1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginState {
    pub origin: String,
    #[serde(default)]
    pub local_storage: Vec<StoredItem>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub origins: Vec<OriginState>,
}

impl StorageState {
    /// Convert a cookie-editor export into storage state for `origin`.
    pub fn from_cookie_export(cookies: Vec<CookieData>, origin: &str, default_domain: &str) -> Self {
        let cookies = cookies
            .into_iter()
            .map(|cookie| {
                let same_site = match cookie.same_site.as_deref().map(str::to_lowercase).as_deref() {
                    Some("none") | Some("no_restriction") => SameSite::None,
                    Some("strict") => SameSite::Strict,
                    _ => SameSite::Lax,
                };
                let expires = cookie
                    .expiration_date
                    .map(f64::floor)
                    .or_else(|| {
                        cookie
                            .expires
                            .as_deref()
                            .and_then(|e| {
                                chrono::DateTime::parse_from_rfc3339(e)
                                    .or_else(|_| chrono::DateTime::parse_from_rfc2822(e))
                                    .ok()
                            })
                            .map(|dt| dt.timestamp() as f64)
                    })
                    .unwrap_or(-1.0);

                StoredCookie {
                    name: cookie.name,
                    value: cookie.value,
                    domain: cookie.domain.unwrap_or_else(|| default_domain.to_string()),
                    path: cookie.path.unwrap_or_else(default_path),
                    expires,
                    http_only: cookie.http_only.unwrap_or(false),
                    secure: cookie.secure.unwrap_or(false),
                    same_site,
                }
            })
            .collect();

        Self {
            cookies,
            origins: vec![OriginState {
                origin: origin.to_string(),
                local_storage: Vec::new(),
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.origins.iter().all(|o| o.local_storage.is_empty())
    }
}

/// Obtains a fresh session, normally by letting a person log in.
#[async_trait]
pub trait LoginFlow: Send + Sync {
    async fn login(&self, config: &PlatformConfig) -> Result<StorageState>;
}

/// Session files under one directory plus an in-memory cache of what was
/// loaded. The only writer of those files.
#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
    cache: Mutex<HashMap<Platform, StorageState>>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, config: &PlatformConfig) -> PathBuf {
        self.dir.join(config.session_file)
    }

    /// Cached state, else the session file. A corrupt file is removed and
    /// treated as missing.
    pub fn load(&self, config: &PlatformConfig) -> Result<Option<StorageState>> {
        if let Some(state) = self.cache_lock().get(&config.platform) {
            return Ok(Some(state.clone()));
        }

        let path = self.path_for(config);
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&path)?;
        match serde_json::from_str::<StorageState>(&raw) {
            Ok(state) => {
                info!(platform = %config.platform, path = %path.display(), "session loaded from file");
                self.cache_lock().insert(config.platform, state.clone());
                Ok(Some(state))
            }
            Err(e) => {
                warn!(platform = %config.platform, error = %e, "session file corrupt, removing");
                fs::remove_file(&path)?;
                Ok(None)
            }
        }
    }

    pub fn save(&self, config: &PlatformConfig, state: &StorageState) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(config);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        fs::rename(&tmp, &path)?;
        self.cache_lock().insert(config.platform, state.clone());
        info!(
            platform = %config.platform,
            cookies = state.cookies.len(),
            path = %path.display(),
            "session saved"
        );
        Ok(())
    }

    /// Forget the cached state and delete the session file.
    pub fn invalidate(&self, config: &PlatformConfig) -> Result<()> {
        self.cache_lock().remove(&config.platform);
        let path = self.path_for(config);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        info!(platform = %config.platform, "session cleared");
        Ok(())
    }

    pub async fn load_async(self: &Arc<Self>, config: &PlatformConfig) -> Result<Option<StorageState>> {
        let config = config.clone();
        self.blocking(move |store| store.load(&config)).await
    }

    pub async fn save_async(self: &Arc<Self>, config: &PlatformConfig, state: &StorageState) -> Result<()> {
        let (config, state) = (config.clone(), state.clone());
        self.blocking(move |store| store.save(&config, &state)).await
    }

    pub async fn invalidate_async(self: &Arc<Self>, config: &PlatformConfig) -> Result<()> {
        let config = config.clone();
        self.blocking(move |store| store.invalidate(&config)).await
    }

    /// Existing session if there is one, otherwise run `flow` and persist
    /// what it returns. A file holding no cookies and no storage counts as
    /// missing.
    #[instrument(skip(self, config, flow), fields(platform = %config.platform))]
    pub async fn load_or_login(
        self: &Arc<Self>,
        config: &PlatformConfig,
        flow: &dyn LoginFlow,
    ) -> Result<StorageState> {
        if let Some(state) = self.load_async(config).await?.filter(|s| !s.is_empty()) {
            return Ok(state);
        }
        info!("no usable session, starting interactive login");
        let state = flow.login(config).await?;
        self.save_async(config, &state).await?;
        Ok(state)
    }

    async fn blocking<T, F>(self: &Arc<Self>, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SessionStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(self);
        task::spawn_blocking(move || work(&store)).await?
    }

    fn cache_lock(&self) -> std::sync::MutexGuard<'_, HashMap<Platform, StorageState>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Load an authenticated page. A redirect to the login flow or a visible
/// login form means the session is gone; navigation failures count as invalid.
pub async fn is_valid(page: &dyn PageDriver, config: &PlatformConfig) -> bool {
    if let Err(e) = page.goto(config.auth_check_url).await {
        warn!(platform = %config.platform, error = %e, "session validation navigation failed");
        return false;
    }
    let url = match page.current_url().await {
        Ok(url) => url,
        Err(_) => return false,
    };
    if config.is_login_redirect(&url) {
        info!(platform = %config.platform, url, "session redirected to login");
        return false;
    }
    for selector in &config.login_form_selectors {
        if page.has_element(selector).await.unwrap_or(false) {
            info!(platform = %config.platform, selector, "login form visible, session invalid");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::get_platform_config;
    use crate::testing::MockPage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLogin {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LoginFlow for CountingLogin {
        async fn login(&self, _config: &PlatformConfig) -> Result<StorageState> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(sample_state())
        }
    }

    fn sample_state() -> StorageState {
        StorageState {
            cookies: vec![StoredCookie {
                name: "auth_token".to_string(),
                value: "abc".to_string(),
                domain: ".x.com".to_string(),
                path: "/".to_string(),
                expires: 1_900_000_000.0,
                http_only: true,
                secure: true,
                same_site: SameSite::None,
            }],
            origins: vec![OriginState {
                origin: "https://x.com".to_string(),
                local_storage: vec![],
            }],
        }
    }

    #[test]
    fn storage_state_uses_playwright_field_names() {
        let json = serde_json::to_value(sample_state()).unwrap();
        let cookie = &json["cookies"][0];
        assert_eq!(cookie["httpOnly"], true);
        assert_eq!(cookie["sameSite"], "None");
        assert_eq!(json["origins"][0]["localStorage"], serde_json::json!([]));
    }

    #[test]
    fn save_then_load_from_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = get_platform_config(Platform::Twitter);

        SessionStore::new(dir.path()).save(&config, &sample_state()).unwrap();
        assert!(dir.path().join("storageStateTwitter.json").exists());

        let reloaded = SessionStore::new(dir.path()).load(&config).unwrap();
        assert_eq!(reloaded, Some(sample_state()));
    }

    #[test]
    fn corrupt_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let config = get_platform_config(Platform::Facebook);
        let path = dir.path().join(config.session_file);
        fs::write(&path, "{not json").unwrap();

        let store = SessionStore::new(dir.path());
        assert_eq!(store.load(&config).unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn invalidate_clears_cache_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = get_platform_config(Platform::Instagram);
        let store = SessionStore::new(dir.path());
        store.save(&config, &sample_state()).unwrap();

        store.invalidate(&config).unwrap();
        assert!(!store.path_for(&config).exists());
        assert_eq!(store.load(&config).unwrap(), None);
    }

    #[tokio::test]
    async fn cached_session_short_circuits_login() {
        let dir = tempfile::tempdir().unwrap();
        let config = get_platform_config(Platform::Twitter);
        let store = Arc::new(SessionStore::new(dir.path()));
        store.save(&config, &sample_state()).unwrap();

        let flow = CountingLogin { calls: AtomicUsize::new(0) };
        let state = store.load_or_login(&config, &flow).await.unwrap();
        assert_eq!(state, sample_state());
        assert_eq!(flow.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_session_triggers_login_once_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = get_platform_config(Platform::Tiktok);
        let store = Arc::new(SessionStore::new(dir.path()));
        let flow = CountingLogin { calls: AtomicUsize::new(0) };

        store.load_or_login(&config, &flow).await.unwrap();
        store.load_or_login(&config, &flow).await.unwrap();

        assert_eq!(flow.calls.load(Ordering::SeqCst), 1);
        assert!(store.path_for(&config).exists());
    }

    #[test]
    fn cookie_export_conversion() {
        let export: Vec<CookieData> = serde_json::from_value(serde_json::json!([
            {
                "name": "auth_token",
                "value": "secret",
                "domain": ".x.com",
                "expirationDate": 1893456000.75,
                "httpOnly": true,
                "secure": true,
                "sameSite": "no_restriction"
            },
            { "name": "lang", "value": "en" }
        ]))
        .unwrap();

        let state = StorageState::from_cookie_export(export, "https://x.com", ".x.com");
        assert_eq!(state.cookies[0].expires, 1893456000.0);
        assert_eq!(state.cookies[0].same_site, SameSite::None);
        assert_eq!(state.cookies[1].domain, ".x.com");
        assert_eq!(state.cookies[1].path, "/");
        assert_eq!(state.cookies[1].expires, -1.0);
        assert_eq!(state.cookies[1].same_site, SameSite::Lax);
        assert_eq!(state.origins[0].origin, "https://x.com");
    }

    #[test]
    fn cookie_export_accepts_http_date_expiry() {
        let export: Vec<CookieData> = serde_json::from_value(serde_json::json!([
            { "name": "a", "value": "1", "expires": "Wed, 01 Jan 2031 00:00:00 GMT" },
            { "name": "b", "value": "2", "expires": "2031-01-01T00:00:00Z" },
            { "name": "c", "value": "3", "expires": "next tuesday" }
        ]))
        .unwrap();

        let state = StorageState::from_cookie_export(export, "https://x.com", ".x.com");
        assert_eq!(state.cookies[0].expires, 1_924_992_000.0);
        assert_eq!(state.cookies[1].expires, 1_924_992_000.0);
        assert_eq!(state.cookies[2].expires, -1.0);
    }

    #[tokio::test]
    async fn async_writes_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = get_platform_config(Platform::Instagram);
        let store = Arc::new(SessionStore::new(dir.path()));

        store.save_async(&config, &sample_state()).await.unwrap();
        assert!(store.path_for(&config).exists());
        assert_eq!(store.load_async(&config).await.unwrap(), Some(sample_state()));

        store.invalidate_async(&config).await.unwrap();
        assert!(!store.path_for(&config).exists());
        assert_eq!(SessionStore::new(dir.path()).load(&config).unwrap(), None);
    }

    #[tokio::test]
    async fn validation_detects_login_redirect() {
        let config = get_platform_config(Platform::Twitter);

        let page = MockPage::new(vec![]).redirect_to("https://x.com/i/flow/login");
        assert!(!is_valid(&page, &config).await);

        let page = MockPage::new(vec![]);
        assert!(is_valid(&page, &config).await);

        let page = MockPage::new(vec![]).with_element("input[name='password']");
        assert!(!is_valid(&page, &config).await);

        let page = MockPage::new(vec![]).failing_gotos(1);
        assert!(!is_valid(&page, &config).await);
    }

    #[tokio::test]
    async fn empty_session_file_triggers_login() {
        let dir = tempfile::tempdir().unwrap();
        let config = get_platform_config(Platform::Facebook);
        let store = Arc::new(SessionStore::new(dir.path()));
        store.save(&config, &StorageState::default()).unwrap();

        let flow = CountingLogin { calls: AtomicUsize::new(0) };
        let state = store.load_or_login(&config, &flow).await.unwrap();
        assert_eq!(flow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state, sample_state());
    }
}
