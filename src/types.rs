//! Core domain types shared by the acquisition and storage layers.

use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// UTC+08:00, checked at compile time
const HONG_KONG: FixedOffset = match FixedOffset::east_opt(8 * 3600) {
    Some(offset) => offset,
    None => panic!("offset out of range"),
};

/// Hong Kong time (UTC+08:00, no daylight saving)
pub fn hong_kong() -> FixedOffset {
    HONG_KONG
}

/// Official tote pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetType {
    Win,
    Place,
}

impl BetType {
    pub const ALL: [BetType; 2] = [BetType::Win, BetType::Place];

    /// Value of the `type` query parameter
    pub fn code(self) -> &'static str {
        match self {
            BetType::Win => "w",
            BetType::Place => "p",
        }
    }
}

/// Offshore market side and pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    BetWin,
    BetPlace,
    EatWin,
    EatPlace,
}

impl MarketType {
    pub const ALL: [MarketType; 4] = [
        MarketType::BetWin,
        MarketType::BetPlace,
        MarketType::EatWin,
        MarketType::EatPlace,
    ];

    pub fn code(self) -> &'static str {
        match self {
            MarketType::BetWin => "bet-w",
            MarketType::BetPlace => "bet-p",
            MarketType::EatWin => "eat-w",
            MarketType::EatPlace => "eat-p",
        }
    }
}

/// One odds history series for a race
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OddsCategory {
    Official(BetType),
    Market(MarketType),
}

impl OddsCategory {
    pub fn official() -> impl Iterator<Item = OddsCategory> {
        BetType::ALL.into_iter().map(OddsCategory::Official)
    }

    pub fn market() -> impl Iterator<Item = OddsCategory> {
        MarketType::ALL.into_iter().map(OddsCategory::Market)
    }

    pub fn all() -> Vec<OddsCategory> {
        Self::official().chain(Self::market()).collect()
    }

    pub fn code(self) -> &'static str {
        match self {
            OddsCategory::Official(bet) => bet.code(),
            OddsCategory::Market(market) => market.code(),
        }
    }

    pub fn is_official(self) -> bool {
        matches!(self, OddsCategory::Official(_))
    }
}

impl fmt::Display for OddsCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OddsCategory::Official(_) => write!(f, "official:{}", self.code()),
            OddsCategory::Market(_) => write!(f, "market:{}", self.code()),
        }
    }
}

impl FromStr for OddsCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_lowercase();
        let code = code
            .strip_prefix("official:")
            .or_else(|| code.strip_prefix("market:"))
            .unwrap_or(&code);
        OddsCategory::all()
            .into_iter()
            .find(|c| c.code() == code)
            .ok_or_else(|| format!("unknown odds type: {}", s))
    }
}

/// A value extracted from an odds table, before timestamp resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOddsRecord {
    pub horse_no: u8,
    /// Either a clock time ("12:08") or a full "YYYY-MM-DD HH:MM:SS"
    pub timestamp_str: String,
    pub value: Decimal,
}

/// A value with an absolute Hong Kong timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedOddsRecord {
    pub horse_no: u8,
    pub recorded_at: DateTime<FixedOffset>,
    pub value: Decimal,
    pub category: OddsCategory,
    pub source_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_codes() {
        let codes: Vec<&str> = OddsCategory::all().iter().map(|c| c.code()).collect();
        assert_eq!(codes, vec!["w", "p", "bet-w", "bet-p", "eat-w", "eat-p"]);
    }

    #[test]
    fn test_category_from_str() {
        assert_eq!(
            "p".parse::<OddsCategory>().unwrap(),
            OddsCategory::Official(BetType::Place)
        );
        assert_eq!(
            "market:EAT-W".parse::<OddsCategory>().unwrap(),
            OddsCategory::Market(MarketType::EatWin)
        );
        assert!("exacta".parse::<OddsCategory>().is_err());
    }

    #[test]
    fn test_hong_kong_offset() {
        assert_eq!(hong_kong().local_minus_utc(), 8 * 3600);
    }
}
