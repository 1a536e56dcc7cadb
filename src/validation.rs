//! Record checks applied before persistence.
//!
//! A bad odds record or runner is dropped and the rest of its batch goes on.
//! A unit whose meeting or race is invalid is rejected whole.

use rust_decimal::Decimal;
use tracing::warn;

use crate::error::ScrapeError;
use crate::storage::models::{HorseProfile, RaceResultUnit, RunnerRecord};
use crate::types::ResolvedOddsRecord;

/// Largest field size, race card and draw number
pub const MAX_RUNNERS: u8 = 14;

const VENUES: [&str; 2] = ["ST", "HV"];

/// Non-numeric finishing codes
const POSITION_CODES: [&str; 16] = [
    "DISQ", "DNF", "FE", "ML", "PU", "TNP", "TO", "UR", "VOID", "WD", "WR", "WV", "WV-A", "WX",
    "WX-A", "WXNR",
];

/// Marker of a dead heat, e.g. "1 平頭馬"
const DEAD_HEAT: &str = "平頭馬";

fn invalid(msg: String) -> ScrapeError {
    ScrapeError::Validation(msg)
}

fn in_range<T: PartialOrd + std::fmt::Display>(
    field: &str,
    value: Option<T>,
    low: T,
    high: T,
) -> Result<(), ScrapeError> {
    match value {
        Some(v) if v < low || v > high => Err(invalid(format!("{field} must be {low}-{high}, got {v}"))),
        _ => Ok(()),
    }
}

pub fn validate_odds(record: &ResolvedOddsRecord) -> Result<(), ScrapeError> {
    if record.horse_no == 0 || record.horse_no > MAX_RUNNERS {
        return Err(invalid(format!("horse number {} out of range", record.horse_no)));
    }
    if record.value <= Decimal::ZERO || record.value >= Decimal::from(10_000) {
        return Err(invalid(format!(
            "{} value {} for horse {} out of range",
            record.category, record.value, record.horse_no
        )));
    }
    Ok(())
}

/// Keep the valid records, returning them with the number dropped
pub fn filter_odds(records: Vec<ResolvedOddsRecord>) -> (Vec<ResolvedOddsRecord>, usize) {
    let total = records.len();
    let kept: Vec<ResolvedOddsRecord> = records
        .into_iter()
        .filter(|record| match validate_odds(record) {
            Ok(()) => true,
            Err(e) => {
                warn!("Invalid record skipped: {}", e);
                false
            }
        })
        .collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

pub fn validate_position(raw: &str) -> Result<(), ScrapeError> {
    let raw = raw.trim();
    let numeric = raw
        .strip_suffix(DEAD_HEAT)
        .map(str::trim)
        .unwrap_or(raw);
    if let Ok(position) = numeric.parse::<u8>() {
        return in_range("position", Some(position), 1, MAX_RUNNERS);
    }
    if POSITION_CODES.contains(&raw) {
        return Ok(());
    }
    Err(invalid(format!("invalid position {:?}", raw)))
}

pub fn validate_runner(runner: &RunnerRecord) -> Result<(), ScrapeError> {
    if runner.horse_code.trim().is_empty() {
        return Err(invalid("runner without horse code".to_string()));
    }
    if let Some(raw) = &runner.finish_position_raw {
        validate_position(raw)?;
    }
    in_range("horse_no", runner.horse_no, 1, MAX_RUNNERS)?;
    in_range("draw", runner.draw, 1, MAX_RUNNERS)?;
    // Handicap weight and body weight, in pounds
    in_range("actual_weight", runner.actual_weight, 95, 165)?;
    in_range("declared_weight", runner.declared_weight, 900, 1400)?;
    if let Some(odds) = runner.win_odds {
        if odds <= Decimal::ZERO {
            return Err(invalid(format!("win odds must be positive, got {odds}")));
        }
    }
    Ok(())
}

pub fn validate_profile(profile: &HorseProfile) -> Result<(), ScrapeError> {
    in_range("age", profile.age, 2, 14)?;

    let starts = profile.record_starts.unwrap_or(0);
    let placings = profile.record_wins.unwrap_or(0)
        + profile.record_seconds.unwrap_or(0)
        + profile.record_thirds.unwrap_or(0);
    if starts > 0 && placings > starts {
        return Err(invalid(format!("{placings} placings from {starts} starts")));
    }

    if let (Some(season), Some(lifetime)) = (profile.season_prize_hkd, profile.lifetime_prize_hkd) {
        if season > 0 && lifetime > 0 && season > lifetime {
            return Err(invalid(format!("season prize {season} above lifetime prize {lifetime}")));
        }
    }
    Ok(())
}

/// Check a result unit, dropping bad runners and profiles
///
/// Returns the cleaned unit and the number of records left out.
pub fn validate_unit(mut unit: RaceResultUnit) -> Result<(RaceResultUnit, usize), ScrapeError> {
    if !VENUES.contains(&unit.meeting.venue_code.as_str()) {
        return Err(invalid(format!(
            "venue code must be ST or HV, got {:?}",
            unit.meeting.venue_code
        )));
    }
    in_range("race number", Some(unit.race.race_no), 1, MAX_RUNNERS)?;
    in_range("distance", unit.race.distance_m, 1000, 2850)?;

    let label = unit.race_key().to_string();
    let mut dropped = 0;

    for horse in &mut unit.horses {
        if let Err(e) = validate_profile(&horse.profile) {
            warn!("{}: profile of {} skipped: {}", label, horse.code, e);
            horse.profile = HorseProfile::default();
            dropped += 1;
        }
    }

    let known: Vec<String> = unit.horses.iter().map(|h| h.code.clone()).collect();
    let before = unit.runners.len();
    unit.runners.retain(|runner| {
        let result = if known.contains(&runner.horse_code) {
            validate_runner(runner)
        } else {
            Err(invalid(format!("unknown horse {}", runner.horse_code)))
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: runner skipped: {}", label, e);
                false
            }
        }
    });
    dropped += before - unit.runners.len();

    Ok((unit, dropped))
}
