//! Path-aware rate limiter.
//!
//! Requests that stay on the same endpoint path are spaced by a short
//! delay; switching to a different path costs a much longer one. The
//! state lock is held across the wait so concurrent callers queue up
//! behind each other instead of all waking at once.

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

/// Shared limiter for all acquisition tasks
pub struct AdaptiveRateLimiter {
    same_path_delay: Duration,
    path_change_delay: Duration,
    jitter: f64,
    state: Mutex<RateLimiterState>,
}

#[derive(Default)]
struct RateLimiterState {
    last_path: Option<String>,
    last_request: Option<Instant>,
}

impl AdaptiveRateLimiter {
    /// Create a limiter
    ///
    /// # Arguments
    /// * `same_path_delay` - Minimum gap between requests to the same path
    /// * `path_change_delay` - Minimum gap when the path changes
    /// * `jitter` - Random fraction applied to each gap (0.2 = ±20%)
    pub fn new(same_path_delay: Duration, path_change_delay: Duration, jitter: f64) -> Self {
        Self {
            same_path_delay,
            path_change_delay,
            jitter: jitter.clamp(0.0, 0.9),
            state: Mutex::new(RateLimiterState::default()),
        }
    }

    /// Wait until a request to `url` is allowed, then record it.
    ///
    /// Returns the time spent waiting.
    pub async fn wait_if_needed(&self, url: &str) -> Duration {
        let path = request_path(url);
        let mut state = self.state.lock().await;

        let required = match state.last_path.as_deref() {
            None => Duration::ZERO,
            Some(last) if last == path => self.same_path_delay,
            Some(last) => {
                info!("Endpoint changed {} -> {}, applying longer delay", last, path);
                self.path_change_delay
            }
        };

        let elapsed = state
            .last_request
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);
        let wait = self.with_jitter(required).saturating_sub(elapsed);

        if !wait.is_zero() {
            debug!("Rate limit: sleeping {:?} before {}", wait, path);
            tokio::time::sleep(wait).await;
        }

        state.last_path = Some(path);
        state.last_request = Some(Instant::now());
        wait
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if delay.is_zero() || self.jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor)
    }
}

/// Path component of a URL, without query string
fn request_path(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split('?').next().unwrap_or(url).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const RACE_1: &str = "https://horse.hk33.com/analysis/jc-wp-trends-history?date=2026-01-14&race=1&type=w";
    const RACE_2: &str = "https://horse.hk33.com/analysis/jc-wp-trends-history?date=2026-01-14&race=2&type=w";
    const MARKET: &str = "https://horse.hk33.com/analysis/offshore-market-trends-history?date=2026-01-14&race=1&type=bet-w";

    fn limiter(jitter: f64) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(Duration::from_millis(300), Duration::from_secs(15), jitter)
    }

    #[test]
    fn test_request_path() {
        assert_eq!(request_path(RACE_1), "/analysis/jc-wp-trends-history");
        assert_eq!(request_path(RACE_1), request_path(RACE_2));
        assert_ne!(request_path(RACE_1), request_path(MARKET));
        assert_eq!(request_path("not a url?x=1"), "not a url");
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_does_not_wait() {
        let limiter = limiter(0.0);
        assert_eq!(limiter.wait_if_needed(RACE_1).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_path_uses_short_delay() {
        let limiter = limiter(0.0);
        limiter.wait_if_needed(RACE_1).await;

        let start = Instant::now();
        let waited = limiter.wait_if_needed(RACE_2).await;
        assert_eq!(waited, Duration::from_millis(300));
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_path_change_uses_long_delay() {
        let limiter = limiter(0.0);
        limiter.wait_if_needed(RACE_1).await;

        let waited = limiter.wait_if_needed(MARKET).await;
        assert_eq!(waited, Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_time_counts_toward_delay() {
        let limiter = limiter(0.0);
        limiter.wait_if_needed(RACE_1).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let waited = limiter.wait_if_needed(MARKET).await;
        assert_eq!(waited, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_stays_in_band() {
        let limiter = limiter(0.2);
        limiter.wait_if_needed(RACE_1).await;

        for _ in 0..20 {
            let waited = limiter.wait_if_needed(RACE_2).await;
            assert!(waited >= Duration::from_millis(239), "{:?}", waited);
            assert!(waited <= Duration::from_millis(361), "{:?}", waited);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_serialized() {
        let limiter = Arc::new(limiter(0.0));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.wait_if_needed(RACE_1).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        // First is free, the other three each wait the short delay
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
