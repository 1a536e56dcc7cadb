//! HTML parsers for the odds history pages.

pub mod odds_table;

pub use odds_table::OddsTableParser;
