//! Failure classification and recovery around a single page fetch.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

use super::http::FetchedPage;
use super::session::SessionStore;
use crate::error::ScrapeError;

/// Bytes of body scanned for a login form marker
const LOGIN_SCAN_BYTES: usize = 2000;
const LOGIN_PAGE_MARKER: &str = "login-register";

/// Retry limits and backoffs per failure class
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub throttle_max_retries: u32,
    pub throttle_backoff: Duration,
    pub network_max_retries: u32,
    /// Wait after the n-th network failure is `base × n`
    pub network_backoff_base: Duration,
    /// Pause after a successful re-login before retrying
    pub relogin_pause: Duration,
}

/// Whether a response is, or redirects to, the login page
pub fn is_login_page(page: &FetchedPage) -> bool {
    if let Some(location) = &page.redirect_location {
        if location.to_ascii_lowercase().contains("login") {
            return true;
        }
    }
    if page.final_url.to_ascii_lowercase().contains(LOGIN_PAGE_MARKER) {
        return true;
    }
    body_prefix(&page.body, LOGIN_SCAN_BYTES).contains(LOGIN_PAGE_MARKER)
}

fn body_prefix(body: &str, max: usize) -> &str {
    if body.len() <= max {
        return body;
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Map a raw response to success or a classified failure
pub fn classify_response(page: FetchedPage) -> Result<FetchedPage, ScrapeError> {
    match page.status {
        429 => Err(ScrapeError::Throttled { url: page.url }),
        403 => Err(ScrapeError::AuthExpired { url: page.url }),
        _ if is_login_page(&page) => Err(ScrapeError::AuthExpired { url: page.url }),
        status if status >= 400 => Err(ScrapeError::Http {
            status,
            url: page.url,
        }),
        _ => Ok(page),
    }
}

/// Wraps one acquisition call with backoff and session recovery
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    config: RecoveryConfig,
}

impl RecoveryPolicy {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds or a failure is not recoverable.
    ///
    /// Throttling and network failures are retried with their own budgets.
    /// An expired session triggers `session.refresh()`; a refresh failure
    /// propagates at once, otherwise the operation is retried with the new
    /// cookies.
    pub async fn execute<T, F, Fut>(
        &self,
        session: &SessionStore,
        label: &str,
        mut operation: F,
    ) -> Result<T, ScrapeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScrapeError>>,
    {
        let mut throttled = 0u32;
        let mut network = 0u32;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match &err {
                ScrapeError::Throttled { .. } => {
                    throttled += 1;
                    if throttled > self.config.throttle_max_retries {
                        error!("{}: still throttled after {} retries", label, throttled - 1);
                        return Err(err);
                    }
                    warn!(
                        "{}: throttled (429), backing off {:?} ({}/{})",
                        label, self.config.throttle_backoff, throttled, self.config.throttle_max_retries
                    );
                    sleep(self.config.throttle_backoff).await;
                }
                ScrapeError::TransientNetwork(reason) => {
                    network += 1;
                    if network > self.config.network_max_retries {
                        error!("{}: network failure after {} retries: {}", label, network - 1, reason);
                        return Err(err);
                    }
                    let wait = self.config.network_backoff_base * network;
                    warn!(
                        "{}: {}, retrying in {:?} ({}/{})",
                        label, reason, wait, network, self.config.network_max_retries
                    );
                    sleep(wait).await;
                }
                ScrapeError::AuthExpired { .. } => {
                    warn!("{}: session expired, re-authenticating", label);
                    if let Err(refresh_err) = session.refresh().await {
                        error!("{}: session refresh failed: {}", label, refresh_err);
                        return Err(refresh_err);
                    }
                    sleep(self.config.relogin_pause).await;
                }
                _ => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::session::tests::{store_with, FakeAuthenticator};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RecoveryPolicy {
        RecoveryPolicy::new(RecoveryConfig {
            throttle_max_retries: 3,
            throttle_backoff: Duration::from_secs(15),
            network_max_retries: 3,
            network_backoff_base: Duration::from_secs(15),
            relogin_pause: Duration::from_secs(2),
        })
    }

    fn page(status: u16, final_url: &str, body: &str) -> FetchedPage {
        FetchedPage {
            url: "https://horse.hk33.com/analysis/x".to_string(),
            final_url: final_url.to_string(),
            status,
            redirect_location: None,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_login_page_detection() {
        let mut redirected = page(302, "https://horse.hk33.com/analysis/x", "");
        redirected.redirect_location = Some("https://www.hk33.com/user/Login-Register".into());
        assert!(is_login_page(&redirected));

        assert!(is_login_page(&page(200, "https://www.hk33.com/user/login-register", "")));
        assert!(is_login_page(&page(
            200,
            "https://horse.hk33.com/analysis/x",
            "<a href=\"/user/login-register\">Sign in</a>"
        )));

        let late_marker = format!("{}login-register", "x".repeat(LOGIN_SCAN_BYTES));
        assert!(!is_login_page(&page(200, "https://horse.hk33.com/analysis/x", &late_marker)));
        assert!(!is_login_page(&page(200, "https://horse.hk33.com/analysis/x", "<table></table>")));
    }

    #[test]
    fn test_body_prefix_respects_char_boundaries() {
        let body = "賽馬".repeat(1000);
        let prefix = body_prefix(&body, LOGIN_SCAN_BYTES);
        assert!(prefix.len() <= LOGIN_SCAN_BYTES);
        assert!(body.starts_with(prefix));
    }

    #[test]
    fn test_classify_response() {
        assert!(matches!(
            classify_response(page(429, "", "")),
            Err(ScrapeError::Throttled { .. })
        ));
        assert!(matches!(
            classify_response(page(403, "", "")),
            Err(ScrapeError::AuthExpired { .. })
        ));
        assert!(matches!(
            classify_response(page(200, "https://www.hk33.com/user/login-register", "")),
            Err(ScrapeError::AuthExpired { .. })
        ));
        assert!(matches!(
            classify_response(page(500, "", "")),
            Err(ScrapeError::Http { status: 500, .. })
        ));
        assert!(classify_response(page(200, "https://horse.hk33.com/analysis/x", "<table>")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_retries_then_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let session = store_with(Arc::new(FakeAuthenticator::new(true)), dir.path(), 3);
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = policy()
            .execute(&session, "race 1", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ScrapeError::Throttled { url: "u".into() })
            })
            .await;

        assert!(matches!(result, Err(ScrapeError::Throttled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_backoff_grows_linearly() {
        let dir = tempfile::tempdir().unwrap();
        let session = store_with(Arc::new(FakeAuthenticator::new(true)), dir.path(), 3);
        let calls = &AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result = policy()
            .execute(&session, "race 1", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ScrapeError::TransientNetwork("connection reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        // 15s after the first failure, 30s after the second
        assert_eq!(start.elapsed(), Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_expired_refreshes_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(FakeAuthenticator::new(true));
        let session = store_with(auth.clone(), dir.path(), 3);
        let calls = &AtomicU32::new(0);

        let result = policy()
            .execute(&session, "race 1", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ScrapeError::AuthExpired { url: "u".into() })
                } else {
                    Ok("page")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "page");
        assert_eq!(auth.logins.load(Ordering::SeqCst), 1);
        assert_eq!(session.relogin_attempts().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_expired_stops_when_budget_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(FakeAuthenticator::new(true));
        let session = store_with(auth.clone(), dir.path(), 2);
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = policy()
            .execute(&session, "race 1", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ScrapeError::AuthExpired { url: "u".into() })
            })
            .await;

        assert!(matches!(
            result,
            Err(ScrapeError::ReloginBudgetExhausted { attempts: 2 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(auth.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failures_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let session = store_with(Arc::new(FakeAuthenticator::new(true)), dir.path(), 3);
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = policy()
            .execute(&session, "race 1", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ScrapeError::Http { status: 500, url: "u".into() })
            })
            .await;

        assert!(matches!(result, Err(ScrapeError::Http { status: 500, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
