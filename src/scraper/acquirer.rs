//! Fetch, parse and resolve one (race, category) slice of odds history.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::http::{FetchedPage, PageFetcher};
use super::parsers::OddsTableParser;
use super::rate_limiter::AdaptiveRateLimiter;
use super::recovery::{classify_response, RecoveryPolicy};
use super::scheduler::{AcquiredSlice, SliceSource};
use super::session::SessionStore;
use super::timestamps::TimestampResolver;
use super::Endpoints;
use crate::error::ScrapeError;
use crate::types::{OddsCategory, RawOddsRecord, ResolvedOddsRecord};

/// Acquires odds history pages through the shared session and limiter
pub struct OddsAcquirer {
    fetcher: Arc<dyn PageFetcher>,
    session: Arc<SessionStore>,
    limiter: Arc<AdaptiveRateLimiter>,
    recovery: RecoveryPolicy,
    endpoints: Endpoints,
}

impl OddsAcquirer {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        session: Arc<SessionStore>,
        limiter: Arc<AdaptiveRateLimiter>,
        recovery: RecoveryPolicy,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            fetcher,
            session,
            limiter,
            recovery,
            endpoints,
        }
    }

    /// Fetch and resolve the odds history of one race for one category
    pub async fn acquire(
        &self,
        date: NaiveDate,
        race_no: u8,
        category: OddsCategory,
    ) -> Result<AcquiredSlice, ScrapeError> {
        let url = self.endpoints.history_url(date, race_no, category);
        let label = format!("R{} {}", race_no, category);

        let this = self;
        let target = url.as_str();
        let page = self
            .recovery
            .execute(&self.session, &label, move || this.fetch_once(target))
            .await?;

        let raw = OddsTableParser::parse(&page.body)?;
        let slice = resolve_records(date, raw, category, &url);
        debug!(
            "{}: {} records, {} unresolved",
            label,
            slice.records.len(),
            slice.unresolved
        );
        Ok(slice)
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
        self.limiter.wait_if_needed(url).await;
        let cookies = self.session.credentials().await;
        let page = self.fetcher.get(url, &cookies).await?;
        classify_response(page)
    }
}

#[async_trait]
impl SliceSource for OddsAcquirer {
    async fn acquire(
        &self,
        date: NaiveDate,
        race_no: u8,
        category: OddsCategory,
    ) -> Result<AcquiredSlice, ScrapeError> {
        OddsAcquirer::acquire(self, date, race_no, category).await
    }
}

/// Stamp raw records with their category and absolute time.
///
/// Each distinct timestamp string is resolved once, in table order (oldest
/// first), and the result shared by every record carrying it. Records whose
/// time cannot be resolved are dropped and counted as unresolved.
pub fn resolve_records(
    date: NaiveDate,
    raw: Vec<RawOddsRecord>,
    category: OddsCategory,
    source_url: &str,
) -> AcquiredSlice {
    let mut unique: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for record in &raw {
        if seen.insert(record.timestamp_str.as_str()) {
            unique.push(record.timestamp_str.clone());
        }
    }

    let resolved = TimestampResolver::resolve(date, &unique);
    let by_stamp: HashMap<&str, Option<DateTime<FixedOffset>>> =
        unique.iter().map(String::as_str).zip(resolved).collect();

    let total = raw.len();
    let records: Vec<ResolvedOddsRecord> = raw
        .into_iter()
        .filter_map(|record| {
            let recorded_at = by_stamp.get(record.timestamp_str.as_str()).copied().flatten()?;
            Some(ResolvedOddsRecord {
                horse_no: record.horse_no,
                recorded_at,
                value: record.value,
                category,
                source_url: source_url.to_string(),
            })
        })
        .collect();

    let unresolved = total - records.len();
    if unresolved > 0 {
        warn!(
            "{}: dropped {} records with unparseable timestamps",
            source_url, unresolved
        );
    }
    AcquiredSlice { records, unresolved }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScraperConfig;
    use crate::scraper::recovery::RecoveryConfig;
    use crate::scraper::session::tests::{store_with, FakeAuthenticator};
    use crate::scraper::session::CookieSet;
    use crate::types::BetType;
    use rust_decimal::Decimal;
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves queued pages and records the cookies of each request
    struct ScriptedFetcher {
        pages: Mutex<VecDeque<Result<FetchedPage, ScrapeError>>>,
        seen_cookies: Mutex<Vec<CookieSet>>,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<Result<FetchedPage, ScrapeError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                seen_cookies: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn get(&self, url: &str, cookies: &CookieSet) -> Result<FetchedPage, ScrapeError> {
            self.seen_cookies.lock().unwrap().push(cookies.clone());
            let mut page = self
                .pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ScrapeError::Http { status: 404, url: url.into() }))?;
            page.url = url.to_string();
            Ok(page)
        }
    }

    const HISTORY: &str = r#"
        <table id="odds_table">
          <tr><th>Time</th><th>1</th><th>2</th></tr>
          <tr><td>23:55</td><td>3.4</td><td>-</td></tr>
          <tr><td>00:05</td><td>3.1</td><td>7.0</td></tr>
        </table>
    "#;

    fn acquirer(fetcher: Arc<ScriptedFetcher>, dir: &std::path::Path) -> (OddsAcquirer, Arc<FakeAuthenticator>) {
        let auth = Arc::new(FakeAuthenticator::new(true));
        let session = Arc::new(store_with(auth.clone(), dir, 3));
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            Duration::from_millis(300),
            Duration::from_secs(15),
            0.0,
        ));
        let recovery = RecoveryPolicy::new(RecoveryConfig {
            throttle_max_retries: 3,
            throttle_backoff: Duration::from_secs(15),
            network_max_retries: 3,
            network_backoff_base: Duration::from_secs(15),
            relogin_pause: Duration::from_secs(2),
        });
        let acquirer = OddsAcquirer::new(
            fetcher,
            session,
            limiter,
            recovery,
            Endpoints::new(&ScraperConfig::default()),
        );
        (acquirer, auth)
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 14).unwrap()
    }

    #[test]
    fn test_resolve_records_shares_timestamps() {
        let raw = vec![
            RawOddsRecord { horse_no: 1, timestamp_str: "23:55".into(), value: Decimal::new(34, 1) },
            RawOddsRecord { horse_no: 2, timestamp_str: "??".into(), value: Decimal::new(80, 1) },
            RawOddsRecord { horse_no: 1, timestamp_str: "00:05".into(), value: Decimal::new(31, 1) },
            RawOddsRecord { horse_no: 2, timestamp_str: "00:05".into(), value: Decimal::new(70, 1) },
        ];
        let category = OddsCategory::Official(BetType::Win);
        let slice = resolve_records(date(), raw, category, "https://src/x");
        assert_eq!(slice.unresolved, 1);

        let records = slice.records;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].recorded_at.to_rfc3339(), "2026-01-13T23:55:00+08:00");
        assert_eq!(records[1].recorded_at, records[2].recorded_at);
        assert_eq!(records[1].recorded_at.to_rfc3339(), "2026-01-14T00:05:00+08:00");
        assert!(records.iter().all(|r| r.category == category && r.source_url == "https://src/x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_parses_and_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchedPage::ok("", HISTORY))]));
        let (acquirer, _) = acquirer(fetcher, dir.path());

        let slice = acquirer
            .acquire(date(), 4, OddsCategory::Official(BetType::Win))
            .await
            .unwrap();

        assert_eq!(slice.records.len(), 3);
        assert_eq!(slice.unresolved, 0);
        assert!(slice.records[0].source_url.ends_with("race=4&type=w"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_counts_malformed_time_rows() {
        let dir = tempfile::tempdir().unwrap();
        let page = r#"
            <table id="odds_table">
              <tr><th>Time</th><th>1</th><th>2</th></tr>
              <tr><td>12:00</td><td>3.4</td><td>5.0</td></tr>
              <tr><td>99:99</td><td>3.3</td><td>5.1</td></tr>
            </table>
        "#;
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchedPage::ok("", page))]));
        let (acquirer, _) = acquirer(fetcher, dir.path());

        let slice = acquirer
            .acquire(date(), 2, OddsCategory::Official(BetType::Win))
            .await
            .unwrap();

        assert_eq!(slice.records.len(), 2);
        assert_eq!(slice.unresolved, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_recovers_from_login_page() {
        let dir = tempfile::tempdir().unwrap();
        let login_page = FetchedPage {
            final_url: "https://www.hk33.com/user/login-register".into(),
            ..FetchedPage::ok("", "<form>sign in</form>")
        };
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Ok(login_page),
            Ok(FetchedPage::ok("", HISTORY)),
        ]));
        let (acquirer, auth) = acquirer(fetcher.clone(), dir.path());

        let slice = acquirer
            .acquire(date(), 1, OddsCategory::Official(BetType::Place))
            .await
            .unwrap();

        assert_eq!(slice.records.len(), 3);
        assert_eq!(auth.logins.load(Ordering::SeqCst), 1);

        // Retry carries the cookies from the fresh login
        let seen = fetcher.seen_cookies.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].get("PHPSESSID").map(String::as_str), Some("session-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_without_table_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchedPage::ok(
            "",
            "<p>maintenance</p>",
        ))]));
        let (acquirer, _) = acquirer(fetcher.clone(), dir.path());

        let err = acquirer
            .acquire(date(), 1, OddsCategory::Official(BetType::Win))
            .await
            .unwrap_err();

        assert!(matches!(err, ScrapeError::Parse(_)));
        assert_eq!(fetcher.seen_cookies.lock().unwrap().len(), 1);
    }
}
