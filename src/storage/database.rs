//! Async handle over the blocking repository
//!
//! Every call runs on the blocking pool. A unit that hits lock contention is
//! retried as a whole with backoff.

use chrono::NaiveDate;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::models::{PersistBatch, PersistCounts};
use super::repository::{RaceRepository, RunnerMap};
use crate::config::DatabaseConfig;
use crate::error::PersistError;
use crate::retry::{retry_if, RetryConfig};

#[derive(Clone)]
pub struct Database {
    repo: Arc<Mutex<RaceRepository>>,
    retry: RetryConfig,
}

impl Database {
    pub fn open(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let repo = RaceRepository::new(
            Path::new(&config.path),
            Duration::from_millis(config.busy_timeout_ms),
        )?;
        Ok(Self {
            repo: Arc::new(Mutex::new(repo)),
            retry: config.unit_retry(),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            repo: Arc::new(Mutex::new(RaceRepository::in_memory().unwrap())),
            retry: RetryConfig {
                initial_delay: Duration::from_millis(1),
                ..RetryConfig::database()
            },
        }
    }

    /// Persist one unit, retrying the whole unit while the database is busy
    pub async fn persist(&self, batch: PersistBatch) -> Result<PersistCounts, PersistError> {
        let batch = Arc::new(batch);
        let label = batch.label.clone();
        retry_if(&self.retry, &label, PersistError::is_retryable, || {
            let batch = Arc::clone(&batch);
            self.with_repo(move |repo| repo.persist(&batch))
        })
        .await
    }

    pub async fn resolve_runners(&self, date: NaiveDate, race_no: u8) -> anyhow::Result<RunnerMap> {
        self.with_repo(move |repo| repo.resolve_runners(date, race_no))
            .await
    }

    pub async fn race_numbers(&self, date: NaiveDate) -> anyhow::Result<Vec<u8>> {
        self.with_repo(move |repo| repo.race_numbers(date)).await
    }

    pub async fn last_meeting_date(&self) -> anyhow::Result<Option<NaiveDate>> {
        self.with_repo(|repo| repo.last_meeting_date()).await
    }

    pub async fn last_odds_date(&self) -> anyhow::Result<Option<NaiveDate>> {
        self.with_repo(|repo| repo.last_odds_date()).await
    }

    pub async fn table_counts(&self) -> anyhow::Result<Vec<(&'static str, i64)>> {
        self.with_repo(|repo| repo.table_counts()).await
    }

    pub async fn odds_counts(&self, date: NaiveDate) -> anyhow::Result<(i64, i64)> {
        self.with_repo(move |repo| repo.odds_counts(date)).await
    }

    async fn with_repo<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut RaceRepository) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<PersistError> + Send + 'static,
    {
        let repo = Arc::clone(&self.repo);
        tokio::task::spawn_blocking(move || {
            let mut guard = repo
                .lock()
                .map_err(|_| PersistError::Fatal("repository lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| PersistError::Fatal(format!("database task failed: {e}")))?
    }
}
