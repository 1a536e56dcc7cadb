//! Records accepted by the persistence engine.
//!
//! Race-result units arrive as JSON from the results collector. Odds rows
//! are built by the odds pipeline once runner ids are known.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::types::{hong_kong, OddsCategory};

/// Accepts both `2026-01-14` and `2026/01/14`
fn flexible_date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_meeting_date(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_meeting_date(raw: &str) -> Result<NaiveDate, String> {
    let normalized = raw.trim().replace('/', "-");
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .map_err(|e| format!("invalid date {:?}: {}", raw, e))
}

fn now_hkt() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&hong_kong())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeetingKey {
    pub date: NaiveDate,
    pub venue_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RaceKey {
    pub meeting: MeetingKey,
    pub race_no: u8,
}

impl fmt::Display for RaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} R{}", self.meeting.date, self.meeting.venue_code, self.race_no)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingRecord {
    #[serde(deserialize_with = "flexible_date")]
    pub date: NaiveDate,
    /// ST (Sha Tin) or HV (Happy Valley)
    pub venue_code: String,
    #[serde(default)]
    pub venue_name: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub season: Option<i32>,
}

impl MeetingRecord {
    pub fn key(&self) -> MeetingKey {
        MeetingKey {
            date: self.date,
            venue_code: self.venue_code.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaceRecord {
    pub race_no: u8,
    #[serde(default)]
    pub race_code: Option<i64>,
    #[serde(default)]
    pub name_cn: Option<String>,
    #[serde(default)]
    pub class_text: Option<String>,
    #[serde(default)]
    pub distance_m: Option<u32>,
    #[serde(default)]
    pub track_type: Option<String>,
    #[serde(default)]
    pub track_course: Option<String>,
    #[serde(default)]
    pub going: Option<String>,
    #[serde(default)]
    pub prize_total: Option<i64>,
    #[serde(default)]
    pub final_time_str: Option<String>,
    #[serde(default)]
    pub localresults_url: Option<String>,
    #[serde(default)]
    pub sectional_url: Option<String>,
}

/// Profile fields captured from the horse's page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HorseProfile {
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub age: Option<u8>,
    #[serde(default)]
    pub colour: Option<String>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub import_type: Option<String>,
    #[serde(default)]
    pub season_prize_hkd: Option<i64>,
    #[serde(default)]
    pub lifetime_prize_hkd: Option<i64>,
    #[serde(default)]
    pub record_wins: Option<u32>,
    #[serde(default)]
    pub record_seconds: Option<u32>,
    #[serde(default)]
    pub record_thirds: Option<u32>,
    #[serde(default)]
    pub record_starts: Option<u32>,
    #[serde(default)]
    pub current_rating: Option<i32>,
    #[serde(default)]
    pub season_start_rating: Option<i32>,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub sire_name: Option<String>,
    #[serde(default)]
    pub dam_name: Option<String>,
    #[serde(default)]
    pub dam_sire_name: Option<String>,
}

impl HorseProfile {
    pub fn is_empty(&self) -> bool {
        *self == HorseProfile::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HorseRecord {
    /// HKJC brand code, e.g. "H432"
    pub code: String,
    #[serde(default)]
    pub name_cn: Option<String>,
    #[serde(default)]
    pub name_en: Option<String>,
    #[serde(default)]
    pub hkjc_horse_id: Option<String>,
    #[serde(default)]
    pub profile_url: Option<String>,
    #[serde(flatten)]
    pub profile: HorseProfile,
}

/// Jockey or trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonRecord {
    pub code: String,
    #[serde(default)]
    pub name_cn: Option<String>,
    #[serde(default)]
    pub name_en: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerRecord {
    pub horse_code: String,
    #[serde(default)]
    pub jockey_code: Option<String>,
    #[serde(default)]
    pub trainer_code: Option<String>,
    #[serde(default)]
    pub horse_no: Option<u8>,
    #[serde(default)]
    pub draw: Option<u8>,
    #[serde(default)]
    pub actual_weight: Option<i32>,
    #[serde(default)]
    pub declared_weight: Option<i32>,
    #[serde(default)]
    pub finish_position_raw: Option<String>,
    #[serde(default)]
    pub finish_position_num: Option<u8>,
    #[serde(default)]
    pub margin_raw: Option<String>,
    #[serde(default)]
    pub running_pos_raw: Option<String>,
    #[serde(default)]
    pub finish_time_str: Option<String>,
    #[serde(default)]
    pub win_odds: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectionalRecord {
    pub horse_code: String,
    pub section_no: u8,
    #[serde(default)]
    pub position: Option<u8>,
    #[serde(default)]
    pub margin_raw: Option<String>,
    #[serde(default)]
    pub time_main: Option<Decimal>,
    #[serde(default)]
    pub time_sub1: Option<Decimal>,
    #[serde(default)]
    pub time_sub2: Option<Decimal>,
    #[serde(default)]
    pub time_sub3: Option<Decimal>,
    #[serde(default)]
    pub finish_time_str: Option<String>,
    #[serde(default)]
    pub raw_cell: Option<String>,
}

/// Everything the results collector knows about one race
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceResultUnit {
    pub meeting: MeetingRecord,
    pub race: RaceRecord,
    #[serde(default)]
    pub horses: Vec<HorseRecord>,
    #[serde(default)]
    pub jockeys: Vec<PersonRecord>,
    #[serde(default)]
    pub trainers: Vec<PersonRecord>,
    #[serde(default)]
    pub runners: Vec<RunnerRecord>,
    #[serde(default, alias = "horse_sectionals")]
    pub sectional_times: Vec<SectionalRecord>,
    /// When the profiles in this unit were captured
    #[serde(default = "now_hkt")]
    pub captured_at: DateTime<FixedOffset>,
}

impl RaceResultUnit {
    pub fn race_key(&self) -> RaceKey {
        RaceKey {
            meeting: self.meeting.key(),
            race_no: self.race.race_no,
        }
    }
}

/// A horse profile snapshot to append
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    pub horse_code: String,
    pub captured_at: DateTime<FixedOffset>,
    pub profile: HorseProfile,
}

/// One resolved odds or market price, ready to store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OddsRow {
    pub race_id: i64,
    pub runner_id: i64,
    pub horse_id: i64,
    pub category: OddsCategory,
    pub value: Decimal,
    pub recorded_at: DateTime<FixedOffset>,
    pub source_url: String,
}

/// Collections for one atomic unit of work (a race or a whole meeting)
#[derive(Debug, Clone, Default)]
pub struct PersistBatch {
    pub label: String,
    pub meetings: Vec<MeetingRecord>,
    pub races: Vec<(MeetingKey, RaceRecord)>,
    pub horses: Vec<HorseRecord>,
    pub history: Vec<HistorySnapshot>,
    pub jockeys: Vec<PersonRecord>,
    pub trainers: Vec<PersonRecord>,
    pub runners: Vec<(RaceKey, RunnerRecord)>,
    pub sectionals: Vec<(RaceKey, SectionalRecord)>,
    pub official_odds: Vec<OddsRow>,
    pub market_prices: Vec<OddsRow>,
}

impl PersistBatch {
    /// Aggregate result units into one batch
    pub fn from_results<'a>(label: impl Into<String>, units: impl IntoIterator<Item = &'a RaceResultUnit>) -> Self {
        let mut batch = PersistBatch {
            label: label.into(),
            ..PersistBatch::default()
        };

        for unit in units {
            let race_key = unit.race_key();
            batch.meetings.push(unit.meeting.clone());
            batch.races.push((race_key.meeting.clone(), unit.race.clone()));
            for horse in &unit.horses {
                if !horse.profile.is_empty() {
                    batch.history.push(HistorySnapshot {
                        horse_code: horse.code.clone(),
                        captured_at: unit.captured_at,
                        profile: horse.profile.clone(),
                    });
                }
                batch.horses.push(horse.clone());
            }
            batch.jockeys.extend(unit.jockeys.iter().cloned());
            batch.trainers.extend(unit.trainers.iter().cloned());
            batch.runners.extend(
                unit.runners
                    .iter()
                    .map(|runner| (race_key.clone(), runner.clone())),
            );
            batch.sectionals.extend(
                unit.sectional_times
                    .iter()
                    .map(|sectional| (race_key.clone(), sectional.clone())),
            );
        }

        batch
    }

    /// Batch of odds rows for one race, split by table
    pub fn from_odds(label: impl Into<String>, rows: Vec<OddsRow>) -> Self {
        let (official_odds, market_prices) = rows.into_iter().partition(|row| row.category.is_official());
        PersistBatch {
            label: label.into(),
            official_odds,
            market_prices,
            ..PersistBatch::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.meetings.is_empty()
            && self.races.is_empty()
            && self.horses.is_empty()
            && self.history.is_empty()
            && self.jockeys.is_empty()
            && self.trainers.is_empty()
            && self.runners.is_empty()
            && self.sectionals.is_empty()
            && self.official_odds.is_empty()
            && self.market_prices.is_empty()
    }
}

/// Rows written per entity for one unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistCounts {
    pub meetings: usize,
    pub races: usize,
    pub horses: usize,
    pub history: usize,
    pub jockeys: usize,
    pub trainers: usize,
    pub runners: usize,
    pub sectionals: usize,
    pub official_odds: usize,
    pub market_prices: usize,
    /// Rows left out because a reference could not be resolved
    pub dropped: usize,
    /// The unit had already been persisted and was skipped
    pub already_present: bool,
}

impl PersistCounts {
    pub fn total(&self) -> usize {
        self.meetings
            + self.races
            + self.horses
            + self.history
            + self.jockeys
            + self.trainers
            + self.runners
            + self.sectionals
            + self.official_odds
            + self.market_prices
    }

    pub fn merge(&mut self, other: &PersistCounts) {
        self.meetings += other.meetings;
        self.races += other.races;
        self.horses += other.horses;
        self.history += other.history;
        self.jockeys += other.jockeys;
        self.trainers += other.trainers;
        self.runners += other.runners;
        self.sectionals += other.sectionals;
        self.official_odds += other.official_odds;
        self.market_prices += other.market_prices;
        self.dropped += other.dropped;
        self.already_present |= other.already_present;
    }
}

impl fmt::Display for PersistCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "meetings={} races={} horses={} history={} jockeys={} trainers={} runners={} sectionals={} odds={} market={}",
            self.meetings,
            self.races,
            self.horses,
            self.history,
            self.jockeys,
            self.trainers,
            self.runners,
            self.sectionals,
            self.official_odds,
            self.market_prices
        )?;
        if self.dropped > 0 {
            write!(f, " dropped={}", self.dropped)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small but complete race-result unit
    pub(crate) fn sample_unit(race_no: u8) -> RaceResultUnit {
        let json = format!(
            r#"{{
                "meeting": {{"date": "2026/01/14", "venue_code": "HV", "venue_name": "Happy Valley"}},
                "race": {{"race_no": {race_no}, "distance_m": 1200, "going": "GOOD"}},
                "horses": [
                    {{"code": "H001", "name_en": "FAST ONE", "age": 5, "current_rating": 62}},
                    {{"code": "H002", "name_en": "SLOW TWO"}}
                ],
                "jockeys": [{{"code": "PZ", "name_en": "Z Purton"}}],
                "trainers": [{{"code": "FC", "name_en": "C Fownes"}}],
                "runners": [
                    {{"horse_code": "H001", "jockey_code": "PZ", "trainer_code": "FC", "horse_no": 1, "draw": 3, "win_odds": 4.5}},
                    {{"horse_code": "H002", "horse_no": 2, "draw": 7, "win_odds": "12"}}
                ],
                "sectional_times": [
                    {{"horse_code": "H001", "section_no": 1, "position": 2, "time_main": "24.31"}}
                ],
                "captured_at": "2026-01-14T23:30:00+08:00"
            }}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_unit_deserialization() {
        let unit = sample_unit(3);
        assert_eq!(unit.meeting.date, NaiveDate::from_ymd_opt(2026, 1, 14).unwrap());
        assert_eq!(unit.race.race_no, 3);
        assert_eq!(unit.horses[0].profile.age, Some(5));
        assert!(unit.horses[1].profile.is_empty());
        assert_eq!(unit.runners[0].win_odds, Some(Decimal::new(45, 1)));
        assert_eq!(unit.runners[1].win_odds, Some(Decimal::new(12, 0)));
        assert_eq!(unit.sectional_times.len(), 1);
    }

    #[test]
    fn test_batch_from_results() {
        let units = [sample_unit(1), sample_unit(2)];
        let batch = PersistBatch::from_results("meeting", units.iter());

        assert_eq!(batch.meetings.len(), 2);
        assert_eq!(batch.races.len(), 2);
        assert_eq!(batch.horses.len(), 4);
        // Only the horse with profile fields gets a snapshot
        assert_eq!(batch.history.len(), 2);
        assert_eq!(batch.runners.len(), 4);
        assert_eq!(batch.runners[3].0.race_no, 2);
    }

    #[test]
    fn test_parse_meeting_date() {
        let expected = NaiveDate::from_ymd_opt(2026, 1, 14).unwrap();
        assert_eq!(parse_meeting_date("2026/01/14").unwrap(), expected);
        assert_eq!(parse_meeting_date("2026-01-14").unwrap(), expected);
        assert!(parse_meeting_date("14/01/2026").is_err());
    }

    #[test]
    fn test_counts_merge() {
        let mut total = PersistCounts {
            races: 1,
            ..PersistCounts::default()
        };
        total.merge(&PersistCounts {
            races: 1,
            official_odds: 10,
            dropped: 2,
            ..PersistCounts::default()
        });
        assert_eq!(total.total(), 12);
        assert_eq!(total.dropped, 2);
        assert!(total.to_string().contains("odds=10"));
    }
}
