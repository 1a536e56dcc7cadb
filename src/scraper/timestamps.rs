//! Timestamp resolution for odds history tables.
//!
//! History pages render most rows with a clock time only. A table spans at
//! most one overnight period and its last row falls on the race day, so the
//! date of every row can be recovered by walking backwards from the race day
//! and stepping back one day whenever the clock jumps forward.

use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};

use crate::types::hong_kong;

/// A single timestamp string after parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedStamp {
    /// `YYYY-MM-DD HH:MM[:SS]`, used as-is
    Full(NaiveDateTime),
    /// `HH:MM[:SS]`, date to be inferred
    Clock(NaiveTime),
    Invalid,
}

impl ParsedStamp {
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim();
        if s.is_empty() {
            return ParsedStamp::Invalid;
        }
        for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                return ParsedStamp::Full(dt);
            }
        }
        for fmt in ["%H:%M:%S", "%H:%M"] {
            if let Ok(t) = NaiveTime::parse_from_str(s, fmt) {
                return ParsedStamp::Clock(t);
            }
        }
        ParsedStamp::Invalid
    }
}

/// Resolver for ordered odds timestamps
pub struct TimestampResolver;

impl TimestampResolver {
    /// Resolve `stamps` (oldest first) to absolute Hong Kong datetimes.
    ///
    /// The last clock-only entry is placed on `reference_date`. Output is
    /// index-aligned with the input; unparseable entries yield `None`.
    pub fn resolve<S: AsRef<str>>(
        reference_date: NaiveDate,
        stamps: &[S],
    ) -> Vec<Option<DateTime<FixedOffset>>> {
        let tz = hong_kong();
        let mut resolved = vec![None; stamps.len()];
        let mut current_date = reference_date;
        let mut later_time: Option<NaiveTime> = None;

        for (idx, raw) in stamps.iter().enumerate().rev() {
            let naive = match ParsedStamp::parse(raw.as_ref()) {
                ParsedStamp::Full(dt) => {
                    current_date = dt.date();
                    later_time = Some(dt.time());
                    dt
                }
                ParsedStamp::Clock(time) => {
                    if let Some(later) = later_time {
                        if time > later {
                            current_date = match current_date.checked_sub_days(Days::new(1)) {
                                Some(d) => d,
                                None => continue,
                            };
                        }
                    }
                    later_time = Some(time);
                    current_date.and_time(time)
                }
                ParsedStamp::Invalid => continue,
            };
            resolved[idx] = tz.from_local_datetime(&naive).single();
        }

        resolved
    }
}
