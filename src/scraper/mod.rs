//! Odds history acquisition for horse.hk33.com
//!
//! Provides session handling, rate limiting, failure recovery, HTML parsing
//! and the concurrent scheduler that drives them.

pub mod acquirer;
pub mod http;
pub mod login;
pub mod parsers;
pub mod rate_limiter;
pub mod recovery;
pub mod scheduler;
pub mod session;
pub mod timestamps;

pub use acquirer::OddsAcquirer;
pub use rate_limiter::AdaptiveRateLimiter;
pub use recovery::RecoveryPolicy;
pub use scheduler::{ConcurrentScheduler, ScheduleOutcome};
pub use session::SessionStore;

use chrono::NaiveDate;

use crate::config::ScraperConfig;
use crate::types::OddsCategory;

/// Referer sent with page and AJAX requests
pub const SITE_REFERER: &str = "https://horse.hk33.com/";

/// URL builder for the two history pages
#[derive(Debug, Clone)]
pub struct Endpoints {
    base_url: String,
    official_path: String,
    market_path: String,
}

impl Endpoints {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            official_path: config.official_path.trim_matches('/').to_string(),
            market_path: config.market_path.trim_matches('/').to_string(),
        }
    }

    /// Build the history URL for one race and category
    ///
    /// URL: {base}/jc-wp-trends-history?date=YYYY-MM-DD&race=N&type=w
    pub fn history_url(&self, date: NaiveDate, race_no: u8, category: OddsCategory) -> String {
        let path = match category {
            OddsCategory::Official(_) => &self.official_path,
            OddsCategory::Market(_) => &self.market_path,
        };
        format!(
            "{}/{}?date={}&race={}&type={}",
            self.base_url,
            path,
            date.format("%Y-%m-%d"),
            race_no,
            category.code()
        )
    }
}
