//! Bounded fan-out of acquisitions across races and odds categories.
//!
//! Work runs in waves. With the default subtype grouping each wave is one
//! category across all races, which keeps consecutive requests on the same
//! endpoint path and avoids the limiter's path-change penalty. A failed
//! slice is logged and left out of the result; it never stops its siblings.
//! The one exception is an exhausted re-login budget, after which no further
//! slice can succeed and the rest are skipped.

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::error::ScrapeError;
use crate::types::{OddsCategory, ResolvedOddsRecord};

/// Records of one slice and how many rows had no usable timestamp
#[derive(Debug, Default)]
pub struct AcquiredSlice {
    pub records: Vec<ResolvedOddsRecord>,
    pub unresolved: usize,
}

/// Anything that can acquire one (race, category) slice
#[async_trait]
pub trait SliceSource: Send + Sync {
    async fn acquire(
        &self,
        date: NaiveDate,
        race_no: u8,
        category: OddsCategory,
    ) -> Result<AcquiredSlice, ScrapeError>;
}

/// Order in which the cross-product is walked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grouping {
    /// One category at a time, races in parallel (`race_workers`)
    #[default]
    Subtype,
    /// One race at a time, categories in parallel (`odds_workers`)
    Race,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceTask {
    pub race_no: u8,
    pub category: OddsCategory,
}

impl fmt::Display for SliceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{} {}", self.race_no, self.category)
    }
}

enum SliceResult {
    Done(AcquiredSlice),
    Failed(ScrapeError),
    Skipped,
}

/// Aggregate result of one scheduler run
#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    /// Resolved records per race, across all completed categories
    pub records: BTreeMap<u8, Vec<ResolvedOddsRecord>>,
    pub completed: Vec<SliceTask>,
    pub failed: Vec<(SliceTask, ScrapeError)>,
    pub skipped: Vec<SliceTask>,
    /// Rows left out because their timestamp did not resolve
    pub unresolved: usize,
    /// Set when the re-login budget ran out mid-run
    pub halted: bool,
}

impl ScheduleOutcome {
    fn absorb(&mut self, task: SliceTask, result: SliceResult) {
        match result {
            SliceResult::Done(slice) => {
                self.unresolved += slice.unresolved;
                self.records.entry(task.race_no).or_default().extend(slice.records);
                self.completed.push(task);
            }
            SliceResult::Failed(err) => self.failed.push((task, err)),
            SliceResult::Skipped => self.skipped.push(task),
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}

/// Drives a [`SliceSource`] over races × categories with bounded concurrency
pub struct ConcurrentScheduler {
    source: Arc<dyn SliceSource>,
    race_workers: usize,
    odds_workers: usize,
    grouping: Grouping,
}

impl ConcurrentScheduler {
    pub fn new(
        source: Arc<dyn SliceSource>,
        race_workers: usize,
        odds_workers: usize,
        grouping: Grouping,
    ) -> Self {
        Self {
            source,
            race_workers: race_workers.max(1),
            odds_workers: odds_workers.max(1),
            grouping,
        }
    }

    /// Acquire every (race, category) pair for `date`
    pub async fn run(
        &self,
        date: NaiveDate,
        races: &[u8],
        categories: &[OddsCategory],
    ) -> ScheduleOutcome {
        let waves: Vec<(Vec<SliceTask>, usize)> = match self.grouping {
            Grouping::Subtype => categories
                .iter()
                .map(|&category| {
                    let tasks = races
                        .iter()
                        .map(|&race_no| SliceTask { race_no, category })
                        .collect();
                    (tasks, self.race_workers)
                })
                .collect(),
            Grouping::Race => races
                .iter()
                .map(|&race_no| {
                    let tasks = categories
                        .iter()
                        .map(|&category| SliceTask { race_no, category })
                        .collect();
                    (tasks, self.odds_workers)
                })
                .collect(),
        };

        info!(
            "Scheduling {} races x {} categories ({:?} grouping)",
            races.len(),
            categories.len(),
            self.grouping
        );

        let halted = AtomicBool::new(false);
        let mut outcome = ScheduleOutcome::default();

        for (tasks, workers) in waves {
            let semaphore = Semaphore::new(workers);
            let results = join_all(
                tasks
                    .into_iter()
                    .map(|task| self.run_slice(date, task, &semaphore, &halted)),
            )
            .await;
            for (task, result) in results {
                outcome.absorb(task, result);
            }
        }

        outcome.halted = halted.load(Ordering::SeqCst);
        if !outcome.failed.is_empty() {
            warn!("{} slices failed", outcome.failed.len());
        }
        outcome
    }

    async fn run_slice(
        &self,
        date: NaiveDate,
        task: SliceTask,
        semaphore: &Semaphore,
        halted: &AtomicBool,
    ) -> (SliceTask, SliceResult) {
        let Ok(_permit) = semaphore.acquire().await else {
            return (task, SliceResult::Skipped);
        };
        if halted.load(Ordering::SeqCst) {
            return (task, SliceResult::Skipped);
        }

        match self.source.acquire(date, task.race_no, task.category).await {
            Ok(slice) => (task, SliceResult::Done(slice)),
            Err(err) => {
                if err.is_hard_stop() {
                    if !halted.swap(true, Ordering::SeqCst) {
                        error!("{}: {}; skipping remaining slices", task, err);
                    }
                } else {
                    error!("{} failed: {}", task, err);
                }
                (task, SliceResult::Failed(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{hong_kong, BetType, MarketType};
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Source that returns one record per slice, with scripted failures
    #[derive(Default)]
    struct FakeSource {
        calls: Mutex<Vec<SliceTask>>,
        fail: Vec<SliceTask>,
        exhaust_on: Option<SliceTask>,
        unresolved: usize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SliceSource for FakeSource {
        async fn acquire(
            &self,
            _date: NaiveDate,
            race_no: u8,
            category: OddsCategory,
        ) -> Result<AcquiredSlice, ScrapeError> {
            let task = SliceTask { race_no, category };
            self.calls.lock().unwrap().push(task);

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.exhaust_on == Some(task) {
                return Err(ScrapeError::ReloginBudgetExhausted { attempts: 3 });
            }
            if self.fail.contains(&task) {
                return Err(ScrapeError::Parse("no odds table found".into()));
            }
            Ok(AcquiredSlice {
                records: vec![ResolvedOddsRecord {
                    horse_no: 1,
                    recorded_at: hong_kong().with_ymd_and_hms(2026, 1, 14, 12, 0, 0).unwrap(),
                    value: Decimal::new(25, 1),
                    category,
                    source_url: format!("fake://{}", task),
                }],
                unresolved: self.unresolved,
            })
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 14).unwrap()
    }

    const WIN: OddsCategory = OddsCategory::Official(BetType::Win);
    const PLACE: OddsCategory = OddsCategory::Official(BetType::Place);
    const BET_WIN: OddsCategory = OddsCategory::Market(MarketType::BetWin);

    #[tokio::test(start_paused = true)]
    async fn test_subtype_grouping_order() {
        let source = Arc::new(FakeSource::default());
        let scheduler = ConcurrentScheduler::new(source.clone(), 1, 6, Grouping::Subtype);

        let outcome = scheduler.run(date(), &[1, 2], &[WIN, BET_WIN]).await;

        let calls = source.calls.lock().unwrap().clone();
        let categories: Vec<OddsCategory> = calls.iter().map(|t| t.category).collect();
        assert_eq!(categories, vec![WIN, WIN, BET_WIN, BET_WIN]);
        assert_eq!(outcome.completed.len(), 4);
        assert_eq!(outcome.records[&1].len(), 2);
        assert_eq!(outcome.record_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_grouping_order() {
        let source = Arc::new(FakeSource::default());
        let scheduler = ConcurrentScheduler::new(source.clone(), 2, 1, Grouping::Race);

        scheduler.run(date(), &[1, 2], &[WIN, PLACE]).await;

        let races: Vec<u8> = source.calls.lock().unwrap().iter().map(|t| t.race_no).collect();
        assert_eq!(races, vec![1, 1, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_bound_is_respected() {
        let source = Arc::new(FakeSource::default());
        let scheduler = ConcurrentScheduler::new(source.clone(), 2, 6, Grouping::Subtype);

        let races: Vec<u8> = (1..=10).collect();
        scheduler.run(date(), &races, &[WIN]).await;

        assert_eq!(source.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_slice_does_not_abort_siblings() {
        let source = Arc::new(FakeSource {
            fail: vec![SliceTask { race_no: 2, category: PLACE }],
            ..FakeSource::default()
        });
        let scheduler = ConcurrentScheduler::new(source, 2, 6, Grouping::Subtype);

        let outcome = scheduler.run(date(), &[1, 2, 3], &[WIN, PLACE]).await;

        assert_eq!(outcome.completed.len(), 5);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, SliceTask { race_no: 2, category: PLACE });
        assert!(!outcome.halted);
        assert_eq!(outcome.records[&2].len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_rows_are_summed() {
        let source = Arc::new(FakeSource {
            unresolved: 2,
            fail: vec![SliceTask { race_no: 1, category: PLACE }],
            ..FakeSource::default()
        });
        let scheduler = ConcurrentScheduler::new(source, 2, 6, Grouping::Subtype);

        let outcome = scheduler.run(date(), &[1, 2], &[WIN, PLACE]).await;

        // Three completed slices, two unresolved rows each
        assert_eq!(outcome.unresolved, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_skips_remaining_slices() {
        let source = Arc::new(FakeSource {
            exhaust_on: Some(SliceTask { race_no: 1, category: WIN }),
            ..FakeSource::default()
        });
        let scheduler = ConcurrentScheduler::new(source.clone(), 1, 6, Grouping::Subtype);

        let outcome = scheduler.run(date(), &[1, 2, 3], &[WIN, PLACE]).await;

        assert!(outcome.halted);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.skipped.len(), 5);
        assert!(outcome.completed.is_empty());
        assert_eq!(source.calls.lock().unwrap().len(), 1);
    }
}
