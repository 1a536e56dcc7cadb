//! Session cookies shared by all acquisition tasks.
//!
//! The store lazily loads cookies from a local cache file, accepts the
//! site's age gate once, and re-authenticates on demand within a per-run
//! budget. State is guarded by a single mutex that is never held across
//! a network call.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ScrapeError;

/// Cookie name → value
pub type CookieSet = BTreeMap<String, String>;

/// Cookie the site sets once the visitor confirms their age
pub const AGE_GATE_COOKIE: &str = "i_am_18_or_over";

/// Render cookies as a `Cookie` request header value
pub fn cookie_header(cookies: &CookieSet) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Credential exchange with the source site
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Log in from scratch and return the resulting cookie set
    async fn login(&self) -> Result<CookieSet, ScrapeError>;

    /// Accept the age gate for an existing session.
    ///
    /// Returns the gate cookie value if the site issued one.
    async fn pass_age_gate(&self, cookies: &CookieSet) -> Result<Option<String>, ScrapeError>;
}

/// JSON cookie cache readable only by the owner
#[derive(Debug, Clone)]
pub struct CookieCache {
    path: PathBuf,
}

impl CookieCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load cached cookies; a missing or unreadable cache yields an empty set
    pub fn load(&self) -> CookieSet {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return CookieSet::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(cookies) => cookies,
            Err(e) => {
                warn!("Ignoring unreadable cookie cache {}: {}", self.path.display(), e);
                CookieSet::new()
            }
        }
    }

    pub fn save(&self, cookies: &CookieSet) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(cookies)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(json.as_bytes())?;

        // mode() only applies on creation
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Session {
    cookies: CookieSet,
    loaded: bool,
    age_gate_passed: bool,
    relogin_attempts: u32,
}

/// Owner of the current session for one run
pub struct SessionStore {
    auth: Arc<dyn Authenticator>,
    cache: CookieCache,
    max_relogins: u32,
    state: Mutex<Session>,
}

impl SessionStore {
    pub fn new(auth: Arc<dyn Authenticator>, cache: CookieCache, max_relogins: u32) -> Self {
        Self {
            auth,
            cache,
            max_relogins,
            state: Mutex::new(Session::default()),
        }
    }

    /// Current cookie set, bootstrapped from the cache on first use
    pub async fn credentials(&self) -> CookieSet {
        {
            let state = self.state.lock().await;
            if state.loaded {
                return state.cookies.clone();
            }
        }

        let mut cookies = self.cache.load();
        if cookies.is_empty() {
            warn!(
                "No cached session in {}; requests will fail until a login succeeds",
                self.cache.path().display()
            );
        } else if !cookies.contains_key(AGE_GATE_COOKIE) {
            self.accept_age_gate(&mut cookies).await;
        }

        let mut state = self.state.lock().await;
        if !state.loaded {
            state.age_gate_passed = cookies.contains_key(AGE_GATE_COOKIE);
            state.cookies = cookies;
            state.loaded = true;
            debug!("Session loaded with {} cookies", state.cookies.len());
        }
        state.cookies.clone()
    }

    /// Discard the session and log in again.
    ///
    /// Fails without any network I/O once the run's re-login budget is spent.
    pub async fn refresh(&self) -> Result<CookieSet, ScrapeError> {
        let attempt = {
            let mut state = self.state.lock().await;
            if state.relogin_attempts >= self.max_relogins {
                return Err(ScrapeError::ReloginBudgetExhausted {
                    attempts: state.relogin_attempts,
                });
            }
            state.relogin_attempts += 1;
            state.cookies.clear();
            state.loaded = false;
            state.age_gate_passed = false;
            state.relogin_attempts
        };

        info!("Re-authenticating (attempt {}/{})", attempt, self.max_relogins);

        let cookies = match self.authenticate().await {
            Ok(cookies) => {
                if let Err(e) = self.cache.save(&cookies) {
                    warn!("Failed to write cookie cache {}: {}", self.cache.path().display(), e);
                }
                info!("Re-authentication succeeded");
                cookies
            }
            Err(e) => {
                warn!("Login failed: {}; falling back to cookie cache", e);
                let cached = self.cache.load();
                if cached.is_empty() {
                    return Err(e);
                }
                cached
            }
        };

        self.install(cookies.clone()).await;
        Ok(cookies)
    }

    /// Log in and write the cookie cache.
    ///
    /// Unlike [`refresh`](Self::refresh) this neither counts against the
    /// re-login budget nor falls back to cached cookies: a rejected login or
    /// an unwritable cache is an error.
    pub async fn login(&self) -> Result<CookieSet, ScrapeError> {
        let cookies = self.authenticate().await?;
        self.cache.save(&cookies).map_err(|e| {
            ScrapeError::LoginFailed(format!(
                "cannot write cookie cache {}: {}",
                self.cache.path().display(),
                e
            ))
        })?;
        self.install(cookies.clone()).await;
        Ok(cookies)
    }

    async fn authenticate(&self) -> Result<CookieSet, ScrapeError> {
        let mut cookies = self.auth.login().await?;
        if !cookies.contains_key(AGE_GATE_COOKIE) {
            self.accept_age_gate(&mut cookies).await;
        }
        Ok(cookies)
    }

    async fn install(&self, cookies: CookieSet) {
        let mut state = self.state.lock().await;
        state.age_gate_passed = cookies.contains_key(AGE_GATE_COOKIE);
        state.cookies = cookies;
        state.loaded = true;
    }

    /// Restore the full re-login budget; called once at the start of a run
    pub async fn reset_attempt_counter(&self) {
        self.state.lock().await.relogin_attempts = 0;
    }

    pub async fn relogin_attempts(&self) -> u32 {
        self.state.lock().await.relogin_attempts
    }

    pub async fn age_gate_passed(&self) -> bool {
        self.state.lock().await.age_gate_passed
    }

    async fn accept_age_gate(&self, cookies: &mut CookieSet) {
        let value = match self.auth.pass_age_gate(cookies).await {
            Ok(Some(value)) => value,
            Ok(None) => "1".to_string(),
            Err(e) => {
                debug!("Age gate call failed ({}), setting cookie locally", e);
                "1".to_string()
            }
        };
        cookies.insert(AGE_GATE_COOKIE.to_string(), value);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Authenticator double that counts calls
    pub(crate) struct FakeAuthenticator {
        pub logins: AtomicU32,
        pub gate_calls: AtomicU32,
        pub login_ok: bool,
        pub gate_ok: bool,
    }

    impl FakeAuthenticator {
        pub fn new(login_ok: bool) -> Self {
            Self {
                logins: AtomicU32::new(0),
                gate_calls: AtomicU32::new(0),
                login_ok,
                gate_ok: true,
            }
        }
    }

    #[async_trait]
    impl Authenticator for FakeAuthenticator {
        async fn login(&self) -> Result<CookieSet, ScrapeError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.login_ok {
                return Err(ScrapeError::LoginFailed("rejected".into()));
            }
            let mut cookies = CookieSet::new();
            cookies.insert("PHPSESSID".into(), format!("session-{}", n));
            Ok(cookies)
        }

        async fn pass_age_gate(&self, _cookies: &CookieSet) -> Result<Option<String>, ScrapeError> {
            self.gate_calls.fetch_add(1, Ordering::SeqCst);
            if self.gate_ok {
                Ok(Some("yes".into()))
            } else {
                Err(ScrapeError::TransientNetwork("reset".into()))
            }
        }
    }

    pub(crate) fn store_with(auth: Arc<FakeAuthenticator>, dir: &Path, max: u32) -> SessionStore {
        SessionStore::new(auth, CookieCache::new(dir.join("cookies.json")), max)
    }

    pub(crate) fn seed_cache(dir: &Path) {
        let mut cookies = CookieSet::new();
        cookies.insert("PHPSESSID".into(), "cached".into());
        CookieCache::new(dir.join("cookies.json")).save(&cookies).unwrap();
    }

    #[test]
    fn test_cookie_header() {
        let mut cookies = CookieSet::new();
        cookies.insert("b".into(), "2".into());
        cookies.insert("a".into(), "1".into());
        assert_eq!(cookie_header(&cookies), "a=1; b=2");
    }

    #[tokio::test]
    async fn test_credentials_bootstrap_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(dir.path());
        let auth = Arc::new(FakeAuthenticator::new(true));
        let store = store_with(auth.clone(), dir.path(), 3);

        let cookies = store.credentials().await;
        assert_eq!(cookies.get("PHPSESSID").map(String::as_str), Some("cached"));
        assert_eq!(cookies.get(AGE_GATE_COOKIE).map(String::as_str), Some("yes"));
        assert!(store.age_gate_passed().await);

        // Second call is served from memory
        store.credentials().await;
        assert_eq!(auth.gate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(auth.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_age_gate_failure_sets_cookie_locally() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(dir.path());
        let auth = Arc::new(FakeAuthenticator {
            gate_ok: false,
            ..FakeAuthenticator::new(true)
        });
        let store = store_with(auth, dir.path(), 3);

        let cookies = store.credentials().await;
        assert_eq!(cookies.get(AGE_GATE_COOKIE).map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_missing_cache_gives_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(FakeAuthenticator::new(true));
        let store = store_with(auth.clone(), dir.path(), 3);

        assert!(store.credentials().await.is_empty());
        assert_eq!(auth.gate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_persists_cookies() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(FakeAuthenticator::new(true));
        let store = store_with(auth.clone(), dir.path(), 3);

        let cookies = store.refresh().await.unwrap();
        assert_eq!(cookies.get("PHPSESSID").map(String::as_str), Some("session-1"));
        assert_eq!(store.relogin_attempts().await, 1);
        assert_eq!(store.credentials().await, cookies);

        let cached = CookieCache::new(dir.path().join("cookies.json")).load();
        assert_eq!(cached, cookies);
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cache = CookieCache::new(dir.path().join("nested").join("cookies.json"));
        cache.save(&CookieSet::new()).unwrap();

        let mode = fs::metadata(cache.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_refresh_budget_is_enforced_without_io() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(FakeAuthenticator::new(true));
        let store = store_with(auth.clone(), dir.path(), 2);

        store.refresh().await.unwrap();
        store.refresh().await.unwrap();
        let err = store.refresh().await.unwrap_err();

        assert!(matches!(err, ScrapeError::ReloginBudgetExhausted { attempts: 2 }));
        assert_eq!(auth.logins.load(Ordering::SeqCst), 2);

        store.reset_attempt_counter().await;
        assert!(store.refresh().await.is_ok());
        assert_eq!(auth.logins.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_login_falls_back_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(dir.path());
        let auth = Arc::new(FakeAuthenticator::new(false));
        let store = store_with(auth, dir.path(), 3);

        let cookies = store.refresh().await.unwrap();
        assert_eq!(cookies.get("PHPSESSID").map(String::as_str), Some("cached"));
    }

    #[tokio::test]
    async fn test_login_ignores_stale_cache() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(dir.path());
        let auth = Arc::new(FakeAuthenticator::new(false));
        let store = store_with(auth, dir.path(), 3);

        assert!(matches!(store.login().await, Err(ScrapeError::LoginFailed(_))));
        assert_eq!(store.relogin_attempts().await, 0);

        // The stale cache is left as it was
        let cached = CookieCache::new(dir.path().join("cookies.json")).load();
        assert_eq!(cached.get("PHPSESSID").map(String::as_str), Some("cached"));
    }

    #[tokio::test]
    async fn test_login_writes_cache() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(dir.path());
        let auth = Arc::new(FakeAuthenticator::new(true));
        let store = store_with(auth, dir.path(), 3);

        let cookies = store.login().await.unwrap();
        assert_eq!(cookies.get("PHPSESSID").map(String::as_str), Some("session-1"));
        assert!(store.age_gate_passed().await);

        let cached = CookieCache::new(dir.path().join("cookies.json")).load();
        assert_eq!(cached, cookies);
    }

    #[tokio::test]
    async fn test_failed_login_without_cache_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(FakeAuthenticator::new(false));
        let store = store_with(auth, dir.path(), 3);

        assert!(matches!(
            store.refresh().await,
            Err(ScrapeError::LoginFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_respects_budget() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(FakeAuthenticator::new(true));
        let store = Arc::new(store_with(auth.clone(), dir.path(), 3));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.refresh().await.is_ok() })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 3);
        assert_eq!(auth.logins.load(Ordering::SeqCst), 3);
    }
}
