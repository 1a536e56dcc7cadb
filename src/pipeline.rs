//! End-to-end runs: odds acquisition for a meeting, and result imports.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ScraperConfig;
use crate::scraper::http::HttpFetcher;
use crate::scraper::login::HttpAuthenticator;
use crate::scraper::scheduler::ScheduleOutcome;
use crate::scraper::session::CookieCache;
use crate::scraper::{
    AdaptiveRateLimiter, ConcurrentScheduler, Endpoints, OddsAcquirer, RecoveryPolicy,
    SessionStore,
};
use crate::storage::{Database, OddsRow, PersistBatch, PersistCounts, RaceResultUnit, RunnerMap};
use crate::types::{OddsCategory, ResolvedOddsRecord};
use crate::validation::{filter_odds, validate_unit};

/// Session store backed by the live login exchange and the cookie cache
pub fn build_session(config: &ScraperConfig) -> Result<Arc<SessionStore>> {
    let auth = Arc::new(HttpAuthenticator::new(config)?);
    Ok(Arc::new(SessionStore::new(
        auth,
        CookieCache::new(&config.cookie_file),
        config.max_relogins,
    )))
}

/// Outcome of one odds run
#[derive(Debug, Default)]
pub struct RunSummary {
    pub date: Option<NaiveDate>,
    pub races: Vec<u8>,
    /// Races left out because no runners are stored for them yet
    pub unmapped_races: Vec<u8>,
    pub units_persisted: usize,
    pub units_failed: usize,
    pub official_odds: usize,
    pub market_prices: usize,
    /// Records dropped for a bad timestamp, failed validation or no matching runner
    pub dropped: usize,
    pub tasks_completed: usize,
    pub tasks_failed: BTreeMap<&'static str, usize>,
    pub tasks_skipped: usize,
    pub relogins: u32,
    /// The re-login budget ran out and remaining work was skipped
    pub halted: bool,
    /// Nothing was written; counts are what would have been saved
    pub dry_run: bool,
    pub duration: Duration,
}

impl RunSummary {
    fn absorb_schedule(&mut self, outcome: &ScheduleOutcome) {
        self.tasks_completed = outcome.completed.len();
        self.tasks_skipped = outcome.skipped.len();
        self.halted = outcome.halted;
        self.dropped += outcome.unresolved;
        for (_, err) in &outcome.failed {
            *self.tasks_failed.entry(err.kind()).or_default() += 1;
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Odds Run Summary ===")?;
        if self.dry_run {
            writeln!(f, "  Mode:            dry run, nothing saved")?;
        }
        if let Some(date) = self.date {
            writeln!(f, "  Date:            {}", date)?;
        }
        writeln!(f, "  Races:           {:?}", self.races)?;
        if !self.unmapped_races.is_empty() {
            writeln!(f, "  Without runners: {:?}", self.unmapped_races)?;
        }
        writeln!(
            f,
            "  Units:           {} persisted, {} failed",
            self.units_persisted, self.units_failed
        )?;
        writeln!(f, "  Official odds:   {}", self.official_odds)?;
        writeln!(f, "  Market prices:   {}", self.market_prices)?;
        writeln!(f, "  Dropped:         {}", self.dropped)?;
        writeln!(
            f,
            "  Tasks:           {} completed, {} failed, {} skipped",
            self.tasks_completed,
            self.tasks_failed.values().sum::<usize>(),
            self.tasks_skipped
        )?;
        for (kind, count) in &self.tasks_failed {
            writeln!(f, "    {:<18} {}", kind, count)?;
        }
        writeln!(f, "  Re-logins:       {}", self.relogins)?;
        if self.halted {
            writeln!(f, "  HALTED: re-login budget exhausted")?;
        }
        write!(f, "  Duration:        {:.1}s", self.duration.as_secs_f64())
    }
}

/// Acquires odds for a meeting and stores them against known runners
pub struct OddsPipeline {
    session: Arc<SessionStore>,
    scheduler: ConcurrentScheduler,
    db: Database,
    dry_run: bool,
}

impl OddsPipeline {
    pub fn new(session: Arc<SessionStore>, scheduler: ConcurrentScheduler, db: Database) -> Self {
        Self {
            session,
            scheduler,
            db,
            dry_run: false,
        }
    }

    /// Acquire and validate as usual but write nothing
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Wire the live HTTP stack from configuration
    pub fn from_config(config: &ScraperConfig, db: Database) -> Result<Self> {
        config.validate()?;
        let session = build_session(config)?;
        let fetcher = Arc::new(HttpFetcher::new(config.request_timeout())?);
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            config.same_path_delay(),
            config.path_change_delay(),
            config.jitter,
        ));
        let acquirer = OddsAcquirer::new(
            fetcher,
            Arc::clone(&session),
            limiter,
            RecoveryPolicy::new(config.recovery()),
            Endpoints::new(config),
        );
        let scheduler = ConcurrentScheduler::new(
            Arc::new(acquirer),
            config.race_workers,
            config.odds_workers,
            config.grouping,
        );
        Ok(Self::new(session, scheduler, db))
    }

    /// Acquire and persist odds history for one meeting date
    ///
    /// With no races given, every race stored for the date is used.
    pub async fn run(
        &self,
        date: NaiveDate,
        races: Option<Vec<u8>>,
        categories: &[OddsCategory],
    ) -> Result<RunSummary> {
        self.session.reset_attempt_counter().await;

        let races = match races {
            Some(races) => races,
            None => self.db.race_numbers(date).await?,
        };
        if races.is_empty() {
            bail!("No races stored for {}; import results first", date);
        }
        self.run_date(date, races, categories).await
    }

    /// Run every date in turn under one re-login budget.
    ///
    /// Dates without stored races are passed over and a failed date does not
    /// stop the rest. An exhausted re-login budget stops the whole run.
    pub async fn run_dates(
        &self,
        dates: &[NaiveDate],
        races: Option<Vec<u8>>,
        categories: &[OddsCategory],
    ) -> RangeSummary {
        let start = Instant::now();
        self.session.reset_attempt_counter().await;
        let mut range = RangeSummary {
            requested: dates.len(),
            dry_run: self.dry_run,
            ..RangeSummary::default()
        };

        for (idx, &date) in dates.iter().enumerate() {
            let stored = match &races {
                Some(races) => races.clone(),
                None => match self.db.race_numbers(date).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        error!("{}: {:#}", date, e);
                        range.failed.push((date, format!("{:#}", e)));
                        continue;
                    }
                },
            };
            if stored.is_empty() {
                debug!("No races stored for {}", date);
                range.without_races.push(date);
                continue;
            }

            match self.run_date(date, stored, categories).await {
                Ok(summary) => {
                    info!("{}: {} odds, {} market prices", date, summary.official_odds, summary.market_prices);
                    let halted = summary.halted;
                    range.runs.push(summary);
                    if halted {
                        range.halted = true;
                        range.skipped = dates[idx + 1..].to_vec();
                        error!("Re-login budget exhausted; {} dates not attempted", range.skipped.len());
                        break;
                    }
                }
                Err(e) => {
                    error!("{}: {:#}", date, e);
                    range.failed.push((date, format!("{:#}", e)));
                }
            }
        }

        range.relogins = self.session.relogin_attempts().await;
        range.duration = start.elapsed();
        range
    }

    async fn run_date(
        &self,
        date: NaiveDate,
        races: Vec<u8>,
        categories: &[OddsCategory],
    ) -> Result<RunSummary> {
        let start = Instant::now();
        let mut summary = RunSummary {
            date: Some(date),
            races: races.clone(),
            dry_run: self.dry_run,
            ..RunSummary::default()
        };

        let mut runner_maps: BTreeMap<u8, RunnerMap> = BTreeMap::new();
        for &race_no in &races {
            let map = self
                .db
                .resolve_runners(date, race_no)
                .await
                .with_context(|| format!("Failed to resolve runners for race {}", race_no))?;
            if map.is_empty() {
                warn!("Race {} has no stored runners; skipping its odds", race_no);
                summary.unmapped_races.push(race_no);
            } else {
                runner_maps.insert(race_no, map);
            }
        }

        let scheduled: Vec<u8> = runner_maps.keys().copied().collect();
        info!(
            "Acquiring {} categories for {} races on {}",
            categories.len(),
            scheduled.len(),
            date
        );
        let mut outcome = self.scheduler.run(date, &scheduled, categories).await;
        info!("Acquired {} records", outcome.record_count());
        summary.absorb_schedule(&outcome);
        summary.relogins = self.session.relogin_attempts().await;

        for (race_no, map) in &runner_maps {
            let records = outcome.records.remove(race_no).unwrap_or_default();
            if records.is_empty() {
                continue;
            }
            let (rows, dropped) = odds_rows(records, map);
            summary.dropped += dropped;
            if rows.is_empty() {
                continue;
            }

            let label = format!("{} R{} odds", date, race_no);
            if self.dry_run {
                let official = rows.iter().filter(|row| row.category.is_official()).count();
                info!("{}: {} rows not saved (dry run)", label, rows.len());
                summary.official_odds += official;
                summary.market_prices += rows.len() - official;
                continue;
            }
            match self.db.persist(PersistBatch::from_odds(label.clone(), rows)).await {
                Ok(counts) => {
                    info!("{}: {}", label, counts);
                    summary.units_persisted += 1;
                    summary.official_odds += counts.official_odds;
                    summary.market_prices += counts.market_prices;
                }
                Err(e) => {
                    error!("{}: {}", label, e);
                    summary.units_failed += 1;
                }
            }
        }

        summary.duration = start.elapsed();
        Ok(summary)
    }
}

/// Outcome of a multi-date odds run
#[derive(Debug, Default)]
pub struct RangeSummary {
    pub requested: usize,
    pub runs: Vec<RunSummary>,
    pub without_races: Vec<NaiveDate>,
    pub failed: Vec<(NaiveDate, String)>,
    /// Dates not attempted after the re-login budget ran out
    pub skipped: Vec<NaiveDate>,
    pub relogins: u32,
    pub halted: bool,
    pub dry_run: bool,
    pub duration: Duration,
}

impl fmt::Display for RangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Odds Range Summary ===")?;
        if self.dry_run {
            writeln!(f, "  Mode:            dry run, nothing saved")?;
        }
        writeln!(
            f,
            "  Dates:           {} requested, {} run, {} without races, {} failed, {} skipped",
            self.requested,
            self.runs.len(),
            self.without_races.len(),
            self.failed.len(),
            self.skipped.len()
        )?;
        for run in &self.runs {
            let Some(date) = run.date else { continue };
            writeln!(
                f,
                "    {}  races={:?} odds={} market={} dropped={} failed_tasks={}",
                date,
                run.races,
                run.official_odds,
                run.market_prices,
                run.dropped,
                run.tasks_failed.values().sum::<usize>()
            )?;
        }
        for (date, reason) in &self.failed {
            writeln!(f, "    {}  FAILED: {}", date, reason)?;
        }
        writeln!(
            f,
            "  Official odds:   {}",
            self.runs.iter().map(|r| r.official_odds).sum::<usize>()
        )?;
        writeln!(
            f,
            "  Market prices:   {}",
            self.runs.iter().map(|r| r.market_prices).sum::<usize>()
        )?;
        writeln!(f, "  Re-logins:       {}", self.relogins)?;
        if self.halted {
            writeln!(f, "  HALTED: re-login budget exhausted")?;
        }
        write!(f, "  Duration:        {:.1}s", self.duration.as_secs_f64())
    }
}

/// Every date from `start` to `end`, inclusive
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
    if start > end {
        bail!("Start date {} is after end date {}", start, end);
    }
    Ok(start.iter_days().take_while(|d| *d <= end).collect())
}

/// Dates after the last one with stored odds, up to `today`
///
/// Empty when the store is already current.
pub async fn update_dates(db: &Database, today: NaiveDate) -> Result<Vec<NaiveDate>> {
    let Some(last) = db.last_odds_date().await? else {
        bail!("No odds stored yet; run a date or --date-range first");
    };
    let Some(first) = last.succ_opt() else {
        return Ok(Vec::new());
    };
    if first > today {
        info!("Odds are up to date (last stored {})", last);
        return Ok(Vec::new());
    }
    info!("Updating odds from {} to {}", first, today);
    date_range(first, today)
}

/// Validate records and attach stored runner ids
fn odds_rows(records: Vec<ResolvedOddsRecord>, map: &RunnerMap) -> (Vec<OddsRow>, usize) {
    let (records, mut dropped) = filter_odds(records);
    let Some(race_id) = map.race_id else {
        return (Vec::new(), dropped + records.len());
    };

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        match map.get(record.horse_no) {
            Some((runner_id, horse_id)) => rows.push(OddsRow {
                race_id,
                runner_id,
                horse_id,
                category: record.category,
                value: record.value,
                recorded_at: record.recorded_at,
                source_url: record.source_url,
            }),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        warn!("Race {}: {} odds records dropped", race_id, dropped);
    }
    (rows, dropped)
}

/// Outcome of a result import
#[derive(Debug, Default)]
pub struct ImportSummary {
    pub units: usize,
    pub rejected: usize,
    pub persisted: usize,
    pub already_present: usize,
    pub failed: usize,
    pub counts: PersistCounts,
}

impl fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Import Summary ===")?;
        writeln!(f, "  Units read:      {}", self.units)?;
        writeln!(f, "  Rejected:        {}", self.rejected)?;
        writeln!(
            f,
            "  Persisted:       {} ({} already present)",
            self.persisted, self.already_present
        )?;
        writeln!(f, "  Failed:          {}", self.failed)?;
        write!(f, "  Rows:            {}", self.counts)
    }
}

/// Read a JSON array of race result units
pub fn load_results(path: &Path) -> Result<Vec<RaceResultUnit>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let units: Vec<RaceResultUnit> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid result units in {}", path.display()))?;
    Ok(units)
}

/// Validate and persist result units, one race per transaction or the
/// whole meeting in one
pub async fn import_results(db: &Database, units: Vec<RaceResultUnit>, as_meeting: bool) -> ImportSummary {
    let mut summary = ImportSummary {
        units: units.len(),
        ..ImportSummary::default()
    };

    let mut valid = Vec::with_capacity(units.len());
    for unit in units {
        let key = unit.race_key();
        match validate_unit(unit) {
            Ok((unit, dropped)) => {
                summary.counts.dropped += dropped;
                valid.push(unit);
            }
            Err(e) => {
                warn!("{}: rejected: {}", key, e);
                summary.rejected += 1;
            }
        }
    }

    let batches: Vec<PersistBatch> = if as_meeting {
        if valid.is_empty() {
            Vec::new()
        } else {
            vec![PersistBatch::from_results("meeting", valid.iter())]
        }
    } else {
        valid
            .iter()
            .map(|unit| PersistBatch::from_results(unit.race_key().to_string(), [unit]))
            .collect()
    };

    for batch in batches {
        let label = batch.label.clone();
        match db.persist(batch).await {
            Ok(counts) => {
                if counts.already_present {
                    summary.already_present += 1;
                }
                info!("{}: {}", label, counts);
                summary.persisted += 1;
                summary.counts.merge(&counts);
            }
            Err(e) => {
                error!("{}: {}", label, e);
                summary.failed += 1;
            }
        }
    }

    summary
}
