//! SQLite repository for race results and odds history
//!
//! `persist` writes one unit of work in a single transaction, in foreign-key
//! order. `resolve_runners` maps a race's displayed horse numbers back to
//! stored runner and horse ids.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::batch::{
    decimal, dedup_last_wins, insert_ignore, opt_decimal, opt_id, opt_int, opt_text, text, upsert,
    upsert_returning_ids, UpsertTarget,
};
use super::models::{MeetingKey, OddsRow, PersistBatch, PersistCounts, RaceKey};
use super::schema::{create_tables, TABLES};
use crate::error::PersistError;
use crate::types::hong_kong;

const MEETING: UpsertTarget = UpsertTarget {
    table: "meeting",
    columns: &["date", "venue_code", "venue_name", "source_url", "season", "updated_at"],
    conflict: &["date", "venue_code"],
};

const RACE: UpsertTarget = UpsertTarget {
    table: "race",
    columns: &[
        "meeting_id",
        "race_no",
        "race_code",
        "name_cn",
        "class_text",
        "distance_m",
        "track_type",
        "track_course",
        "going",
        "prize_total",
        "final_time_str",
        "localresults_url",
        "sectional_url",
    ],
    conflict: &["meeting_id", "race_no"],
};

const HORSE: UpsertTarget = UpsertTarget {
    table: "horse",
    columns: &["code", "name_cn", "name_en", "hkjc_horse_id", "profile_url"],
    conflict: &["code"],
};

const HORSE_HISTORY: UpsertTarget = UpsertTarget {
    table: "horse_history",
    columns: &[
        "horse_id",
        "captured_at",
        "origin",
        "age",
        "colour",
        "sex",
        "import_type",
        "season_prize_hkd",
        "lifetime_prize_hkd",
        "record_wins",
        "record_seconds",
        "record_thirds",
        "record_starts",
        "current_rating",
        "season_start_rating",
        "owner_name",
        "sire_name",
        "dam_name",
        "dam_sire_name",
    ],
    conflict: &["horse_id", "captured_at"],
};

const JOCKEY: UpsertTarget = UpsertTarget {
    table: "jockey",
    columns: &["code", "name_cn", "name_en"],
    conflict: &["code"],
};

const TRAINER: UpsertTarget = UpsertTarget {
    table: "trainer",
    columns: &["code", "name_cn", "name_en"],
    conflict: &["code"],
};

const RUNNER: UpsertTarget = UpsertTarget {
    table: "runner",
    columns: &[
        "race_id",
        "horse_id",
        "jockey_id",
        "trainer_id",
        "horse_no",
        "draw",
        "actual_weight",
        "declared_weight",
        "finish_position_raw",
        "finish_position_num",
        "margin_raw",
        "running_pos_raw",
        "finish_time_str",
        "win_odds",
    ],
    conflict: &["race_id", "horse_id"],
};

const SECTIONAL: UpsertTarget = UpsertTarget {
    table: "horse_sectional",
    columns: &[
        "runner_id",
        "section_no",
        "position",
        "margin_raw",
        "time_main",
        "time_sub1",
        "time_sub2",
        "time_sub3",
        "finish_time_str",
        "raw_cell",
    ],
    conflict: &["runner_id", "section_no"],
};

const HKJC_ODDS: UpsertTarget = UpsertTarget {
    table: "hkjc_odds",
    columns: &[
        "race_id",
        "runner_id",
        "horse_id",
        "bet_type",
        "odds_value",
        "recorded_at",
        "source_url",
        "scraped_at",
    ],
    conflict: &["runner_id", "bet_type", "recorded_at"],
};

const OFFSHORE_MARKET: UpsertTarget = UpsertTarget {
    table: "offshore_market",
    columns: &[
        "race_id",
        "runner_id",
        "horse_id",
        "market_type",
        "price",
        "recorded_at",
        "source_url",
        "scraped_at",
    ],
    conflict: &["runner_id", "market_type", "recorded_at"],
};

/// Runners of one race keyed by displayed horse number
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerMap {
    /// None when the race has not been stored yet
    pub race_id: Option<i64>,
    /// horse_no -> (runner_id, horse_id)
    pub by_horse_no: HashMap<u8, (i64, i64)>,
}

impl RunnerMap {
    pub fn is_empty(&self) -> bool {
        self.by_horse_no.is_empty()
    }

    pub fn get(&self, horse_no: u8) -> Option<(i64, i64)> {
        self.by_horse_no.get(&horse_no).copied()
    }
}

/// Repository for race results and odds history
pub struct RaceRepository {
    conn: Connection,
}

impl RaceRepository {
    /// Open (or create) the database and make sure the schema exists
    pub fn new(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(db_path).context("Failed to open database")?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_tables(&conn).context("Failed to create schema")?;

        Ok(Self { conn })
    }

    /// Create an in-memory repository (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_tables(&conn)?;
        Ok(Self { conn })
    }

    // ==================== Write Path ====================

    /// Write one unit atomically
    ///
    /// A uniqueness violation outside the upsert keys means the unit is
    /// already in the store; it is rolled back and reported as zero-effect.
    pub fn persist(&mut self, batch: &PersistBatch) -> Result<PersistCounts, PersistError> {
        if batch.is_empty() {
            return Ok(PersistCounts::default());
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        match write_unit(&tx, batch) {
            Ok(counts) => {
                tx.commit()?;
                debug!("{}: committed {}", batch.label, counts);
                Ok(counts)
            }
            // Dropping the transaction rolls it back
            Err(PersistError::Conflict(msg)) => {
                info!("{}: already persisted ({})", batch.label, msg);
                Ok(PersistCounts {
                    already_present: true,
                    ..PersistCounts::default()
                })
            }
            Err(e) => Err(e),
        }
    }

    // ==================== Query Operations ====================

    /// Map displayed horse numbers of a race to runner and horse ids
    ///
    /// Returns an empty map when the race is not stored yet.
    pub fn resolve_runners(&self, date: NaiveDate, race_no: u8) -> Result<RunnerMap> {
        let race_id: Option<i64> = self
            .conn
            .query_row(
                r#"
                SELECT r.id FROM race r
                JOIN meeting m ON m.id = r.meeting_id
                WHERE m.date = ?1 AND r.race_no = ?2
                ORDER BY m.id
                LIMIT 1
                "#,
                params![date.to_string(), race_no],
                |row| row.get(0),
            )
            .optional()?;

        let Some(race_id) = race_id else {
            return Ok(RunnerMap::default());
        };

        let mut stmt = self.conn.prepare(
            "SELECT horse_no, id, horse_id FROM runner WHERE race_id = ?1 AND horse_no IS NOT NULL",
        )?;
        let by_horse_no = stmt
            .query_map([race_id], |row| {
                Ok((row.get::<_, u8>(0)?, (row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;

        Ok(RunnerMap {
            race_id: Some(race_id),
            by_horse_no,
        })
    }

    /// Race numbers stored for a meeting date
    pub fn race_numbers(&self, date: NaiveDate) -> Result<Vec<u8>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT DISTINCT r.race_no FROM race r
            JOIN meeting m ON m.id = r.meeting_id
            WHERE m.date = ?1
            ORDER BY r.race_no
            "#,
        )?;
        let races = stmt
            .query_map([date.to_string()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<u8>>>()?;
        Ok(races)
    }

    /// Get the most recent meeting date
    pub fn last_meeting_date(&self) -> Result<Option<NaiveDate>> {
        let result: Option<String> =
            self.conn
                .query_row("SELECT MAX(date) FROM meeting", [], |row| row.get(0))?;

        Ok(result.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()))
    }

    /// Most recent meeting date with any official odds or market prices
    pub fn last_odds_date(&self) -> Result<Option<NaiveDate>> {
        let result: Option<String> = self.conn.query_row(
            r#"
            SELECT MAX(m.date) FROM meeting m
            JOIN race r ON r.meeting_id = m.id
            WHERE EXISTS (SELECT 1 FROM hkjc_odds o WHERE o.race_id = r.id)
               OR EXISTS (SELECT 1 FROM offshore_market o WHERE o.race_id = r.id)
            "#,
            [],
            |row| row.get(0),
        )?;

        Ok(result.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()))
    }

    /// Row count of every table
    pub fn table_counts(&self) -> Result<Vec<(&'static str, i64)>> {
        TABLES
            .iter()
            .map(|&table| -> Result<(&'static str, i64)> {
                let count: i64 = self
                    .conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
                Ok((table, count))
            })
            .collect()
    }

    /// Odds and market rows stored for a meeting date
    pub fn odds_counts(&self, date: NaiveDate) -> Result<(i64, i64)> {
        let count_for = |table: &str| -> Result<i64> {
            let count = self.conn.query_row(
                &format!(
                    r#"
                    SELECT COUNT(*) FROM {} o
                    JOIN race r ON r.id = o.race_id
                    JOIN meeting m ON m.id = r.meeting_id
                    WHERE m.date = ?1
                    "#,
                    table
                ),
                [date.to_string()],
                |row| row.get(0),
            )?;
            Ok(count)
        };
        Ok((count_for("hkjc_odds")?, count_for("offshore_market")?))
    }
}

/// Perform every write of a unit inside `tx`
fn write_unit(tx: &Transaction<'_>, batch: &PersistBatch) -> Result<PersistCounts, PersistError> {
    let mut counts = PersistCounts::default();
    let now = Utc::now().with_timezone(&hong_kong()).to_rfc3339();

    // Meeting
    let meetings = dedup_last_wins(batch.meetings.iter(), |m| m.key());
    let rows: Vec<Vec<Value>> = meetings
        .iter()
        .map(|m| {
            vec![
                text(m.date.to_string()),
                text(m.venue_code.clone()),
                opt_text(&m.venue_name),
                opt_text(&m.source_url),
                opt_int(m.season),
                text(now.clone()),
            ]
        })
        .collect();
    let meeting_ids = upsert_returning_ids(tx, &MEETING, &rows, |row| {
        let date: String = row.get(1)?;
        let venue_code: String = row.get(2)?;
        Ok((date, venue_code))
    })?;
    counts.meetings = meeting_ids.len();
    let mut ids = IdLookup::new(tx, meeting_ids);

    // Race
    let mut race_rows = Vec::new();
    for (meeting, race) in &batch.races {
        let Some(meeting_id) = ids.meeting(meeting)? else {
            warn!("{}: no meeting {} {} for race {}", batch.label, meeting.date, meeting.venue_code, race.race_no);
            counts.dropped += 1;
            continue;
        };
        race_rows.push((meeting_id, race));
    }
    let race_rows = dedup_last_wins(race_rows, |(meeting_id, race)| (*meeting_id, race.race_no));
    let rows: Vec<Vec<Value>> = race_rows
        .iter()
        .map(|(meeting_id, race)| {
            vec![
                Value::Integer(*meeting_id),
                Value::Integer(race.race_no.into()),
                opt_id(race.race_code),
                opt_text(&race.name_cn),
                opt_text(&race.class_text),
                opt_int(race.distance_m),
                opt_text(&race.track_type),
                opt_text(&race.track_course),
                opt_text(&race.going),
                opt_id(race.prize_total),
                opt_text(&race.final_time_str),
                opt_text(&race.localresults_url),
                opt_text(&race.sectional_url),
            ]
        })
        .collect();
    let race_ids = upsert_returning_ids(tx, &RACE, &rows, |row| {
        Ok((row.get::<_, i64>(1)?, row.get::<_, u8>(2)?))
    })?;
    counts.races = race_ids.len();
    ids.races.extend(race_ids);

    // Horse, with profile snapshots
    let horses = dedup_last_wins(batch.horses.iter(), |h| h.code.clone());
    let rows: Vec<Vec<Value>> = horses
        .iter()
        .map(|h| {
            vec![
                text(h.code.clone()),
                opt_text(&h.name_cn),
                opt_text(&h.name_en),
                opt_text(&h.hkjc_horse_id),
                opt_text(&h.profile_url),
            ]
        })
        .collect();
    let horse_ids = upsert_returning_ids(tx, &HORSE, &rows, |row| row.get::<_, String>(1))?;
    counts.horses = horse_ids.len();
    ids.horses.extend(horse_ids);

    let snapshots = dedup_last_wins(batch.history.iter(), |s| (s.horse_code.clone(), s.captured_at));
    let mut rows: Vec<Vec<Value>> = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        let Some(horse_id) = ids.horse(&snapshot.horse_code)? else {
            counts.dropped += 1;
            continue;
        };
        let p = &snapshot.profile;
        rows.push(vec![
            Value::Integer(horse_id),
            text(snapshot.captured_at.to_rfc3339()),
            opt_text(&p.origin),
            opt_int(p.age),
            opt_text(&p.colour),
            opt_text(&p.sex),
            opt_text(&p.import_type),
            opt_id(p.season_prize_hkd),
            opt_id(p.lifetime_prize_hkd),
            opt_int(p.record_wins),
            opt_int(p.record_seconds),
            opt_int(p.record_thirds),
            opt_int(p.record_starts),
            opt_int(p.current_rating),
            opt_int(p.season_start_rating),
            opt_text(&p.owner_name),
            opt_text(&p.sire_name),
            opt_text(&p.dam_name),
            opt_text(&p.dam_sire_name),
        ]);
    }
    counts.history = insert_ignore(tx, &HORSE_HISTORY, &rows)?;

    // Jockey and trainer
    for (target, people, count, cache) in [
        (&JOCKEY, &batch.jockeys, &mut counts.jockeys, &mut ids.jockeys),
        (&TRAINER, &batch.trainers, &mut counts.trainers, &mut ids.trainers),
    ] {
        let people = dedup_last_wins(people.iter(), |p| p.code.clone());
        let rows: Vec<Vec<Value>> = people
            .iter()
            .map(|p| vec![text(p.code.clone()), opt_text(&p.name_cn), opt_text(&p.name_en)])
            .collect();
        let person_ids = upsert_returning_ids(tx, target, &rows, |row| row.get::<_, String>(1))?;
        *count = person_ids.len();
        cache.extend(person_ids);
    }

    // Runner
    let mut runner_rows = Vec::new();
    for (race_key, runner) in &batch.runners {
        let (Some(race_id), Some(horse_id)) = (ids.race(race_key)?, ids.horse(&runner.horse_code)?) else {
            warn!("{}: cannot place runner {} in {}", batch.label, runner.horse_code, race_key);
            counts.dropped += 1;
            continue;
        };
        let jockey_id = match &runner.jockey_code {
            Some(code) => ids.person("jockey", code)?,
            None => None,
        };
        let trainer_id = match &runner.trainer_code {
            Some(code) => ids.person("trainer", code)?,
            None => None,
        };
        runner_rows.push(((race_id, horse_id), jockey_id, trainer_id, runner));
    }
    let runner_rows = dedup_last_wins(runner_rows, |(key, ..)| *key);
    let rows: Vec<Vec<Value>> = runner_rows
        .iter()
        .map(|((race_id, horse_id), jockey_id, trainer_id, r)| {
            vec![
                Value::Integer(*race_id),
                Value::Integer(*horse_id),
                opt_id(*jockey_id),
                opt_id(*trainer_id),
                opt_int(r.horse_no),
                opt_int(r.draw),
                opt_int(r.actual_weight),
                opt_int(r.declared_weight),
                opt_text(&r.finish_position_raw),
                opt_int(r.finish_position_num),
                opt_text(&r.margin_raw),
                opt_text(&r.running_pos_raw),
                opt_text(&r.finish_time_str),
                opt_decimal(&r.win_odds),
            ]
        })
        .collect();
    let runner_ids = upsert_returning_ids(tx, &RUNNER, &rows, |row| {
        Ok((row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
    })?;
    counts.runners = runner_ids.len();
    ids.runners.extend(runner_ids);

    // Sectional times
    let mut sectional_rows = Vec::new();
    for (race_key, sectional) in &batch.sectionals {
        let runner_id = match (ids.race(race_key)?, ids.horse(&sectional.horse_code)?) {
            (Some(race_id), Some(horse_id)) => ids.runner(race_id, horse_id)?,
            _ => None,
        };
        let Some(runner_id) = runner_id else {
            counts.dropped += 1;
            continue;
        };
        sectional_rows.push((runner_id, sectional));
    }
    let sectional_rows = dedup_last_wins(sectional_rows, |(runner_id, s)| (*runner_id, s.section_no));
    let rows: Vec<Vec<Value>> = sectional_rows
        .iter()
        .map(|(runner_id, s)| {
            vec![
                Value::Integer(*runner_id),
                Value::Integer(s.section_no.into()),
                opt_int(s.position),
                opt_text(&s.margin_raw),
                opt_decimal(&s.time_main),
                opt_decimal(&s.time_sub1),
                opt_decimal(&s.time_sub2),
                opt_decimal(&s.time_sub3),
                opt_text(&s.finish_time_str),
                opt_text(&s.raw_cell),
            ]
        })
        .collect();
    counts.sectionals = upsert(tx, &SECTIONAL, &rows)?;

    // Odds history
    counts.official_odds = upsert(tx, &HKJC_ODDS, &odds_rows(&batch.official_odds, &now))?;
    counts.market_prices = upsert(tx, &OFFSHORE_MARKET, &odds_rows(&batch.market_prices, &now))?;

    Ok(counts)
}

fn odds_rows(odds: &[OddsRow], scraped_at: &str) -> Vec<Vec<Value>> {
    dedup_last_wins(odds.iter(), |o| (o.runner_id, o.category, o.recorded_at))
        .into_iter()
        .map(|o| {
            vec![
                Value::Integer(o.race_id),
                Value::Integer(o.runner_id),
                Value::Integer(o.horse_id),
                text(o.category.code()),
                decimal(&o.value),
                text(o.recorded_at.to_rfc3339()),
                text(o.source_url.clone()),
                text(scraped_at),
            ]
        })
        .collect()
}

/// Ids written in this unit, falling back to rows already in the store
struct IdLookup<'a> {
    tx: &'a Transaction<'a>,
    meetings: HashMap<(String, String), i64>,
    races: HashMap<(i64, u8), i64>,
    horses: HashMap<String, i64>,
    jockeys: HashMap<String, i64>,
    trainers: HashMap<String, i64>,
    runners: HashMap<(i64, i64), i64>,
}

impl<'a> IdLookup<'a> {
    fn new(tx: &'a Transaction<'a>, meetings: HashMap<(String, String), i64>) -> Self {
        Self {
            tx,
            meetings,
            races: HashMap::new(),
            horses: HashMap::new(),
            jockeys: HashMap::new(),
            trainers: HashMap::new(),
            runners: HashMap::new(),
        }
    }

    fn meeting(&mut self, key: &MeetingKey) -> rusqlite::Result<Option<i64>> {
        let lookup = (key.date.to_string(), key.venue_code.clone());
        if let Some(&id) = self.meetings.get(&lookup) {
            return Ok(Some(id));
        }
        let found: Option<i64> = self
            .tx
            .query_row(
                "SELECT id FROM meeting WHERE date = ?1 AND venue_code = ?2",
                params![lookup.0, lookup.1],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = found {
            self.meetings.insert(lookup, id);
        }
        Ok(found)
    }

    fn race(&mut self, key: &RaceKey) -> rusqlite::Result<Option<i64>> {
        let Some(meeting_id) = self.meeting(&key.meeting)? else {
            return Ok(None);
        };
        if let Some(&id) = self.races.get(&(meeting_id, key.race_no)) {
            return Ok(Some(id));
        }
        let found: Option<i64> = self
            .tx
            .query_row(
                "SELECT id FROM race WHERE meeting_id = ?1 AND race_no = ?2",
                params![meeting_id, key.race_no],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = found {
            self.races.insert((meeting_id, key.race_no), id);
        }
        Ok(found)
    }

    fn horse(&mut self, code: &str) -> rusqlite::Result<Option<i64>> {
        if let Some(&id) = self.horses.get(code) {
            return Ok(Some(id));
        }
        let found = by_code(self.tx, "horse", code)?;
        if let Some(id) = found {
            self.horses.insert(code.to_string(), id);
        }
        Ok(found)
    }

    /// Jockey or trainer id by code
    fn person(&mut self, table: &'static str, code: &str) -> rusqlite::Result<Option<i64>> {
        let cache = if table == "jockey" {
            &mut self.jockeys
        } else {
            &mut self.trainers
        };
        if let Some(&id) = cache.get(code) {
            return Ok(Some(id));
        }
        let found = by_code(self.tx, table, code)?;
        if let Some(id) = found {
            cache.insert(code.to_string(), id);
        }
        Ok(found)
    }

    fn runner(&mut self, race_id: i64, horse_id: i64) -> rusqlite::Result<Option<i64>> {
        if let Some(&id) = self.runners.get(&(race_id, horse_id)) {
            return Ok(Some(id));
        }
        let found: Option<i64> = self
            .tx
            .query_row(
                "SELECT id FROM runner WHERE race_id = ?1 AND horse_id = ?2",
                params![race_id, horse_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = found {
            self.runners.insert((race_id, horse_id), id);
        }
        Ok(found)
    }
}

fn by_code(tx: &Transaction<'_>, table: &str, code: &str) -> rusqlite::Result<Option<i64>> {
    tx.query_row(
        &format!("SELECT id FROM {} WHERE code = ?1", table),
        [code],
        |row| row.get(0),
    )
    .optional()
}
