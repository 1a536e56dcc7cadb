//! Odds history table parser.
//!
//! Two page layouts are in circulation. The current one tags each row with
//! `data-date-time` and each cell with `data-horse-num`; the older one only
//! has a time in the first column followed by one cell per horse in draw
//! order. The positional fallback is best-effort: it breaks silently if the
//! site ever reorders or hides columns.

use regex::Regex;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::debug;

use crate::error::ScrapeError;
use crate::types::RawOddsRecord;

static CLOCK_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,2}:\d{2}").expect("valid clock regex"));

/// Element ids used by the official and offshore pages
const KNOWN_TABLE_IDS: [&str; 2] = ["odds_table", "discounts_table"];

fn selector(css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|e| ScrapeError::Parse(format!("bad selector {}: {}", css, e)))
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

/// Parser for odds history pages
pub struct OddsTableParser;

impl OddsTableParser {
    /// Extract every (horse, time, value) triple from a history page.
    ///
    /// Fails with a parse error if the page has no recognisable table.
    pub fn parse(html: &str) -> Result<Vec<RawOddsRecord>, ScrapeError> {
        let document = Html::parse_document(html);
        let table = Self::locate_table(&document)?
            .ok_or_else(|| ScrapeError::Parse("no odds table found".to_string()))?;
        Self::parse_table(table)
    }

    fn locate_table(document: &Html) -> Result<Option<ElementRef<'_>>, ScrapeError> {
        for id in KNOWN_TABLE_IDS {
            if let Some(table) = document.select(&selector(&format!("table#{}", id))?).next() {
                return Ok(Some(table));
            }
        }

        if let Some(table) = document.select(&selector("table[data-race-num]")?).next() {
            return Ok(Some(table));
        }

        let tables = selector("table")?;
        let first_cell = selector("tr > td:first-child, tr > th:first-child")?;
        Ok(document.select(&tables).find(|table| {
            table
                .select(&first_cell)
                .any(|cell| CLOCK_TIME.is_match(&cell_text(&cell)))
        }))
    }

    fn parse_table(table: ElementRef<'_>) -> Result<Vec<RawOddsRecord>, ScrapeError> {
        let rows = selector("tr")?;
        let cells = selector("td, th")?;
        let tagged_cells = selector("[data-horse-num]")?;

        let tagged = table.select(&tagged_cells).next().is_some();
        if !tagged {
            debug!("Odds table has no data-horse-num cells, using column order");
        }

        let mut records = Vec::new();
        for row in table.select(&rows) {
            let row_cells: Vec<ElementRef<'_>> = row.select(&cells).collect();
            let Some(first) = row_cells.first() else {
                continue;
            };

            let timestamp = match row.value().attr("data-date-time") {
                Some(ts) if !ts.trim().is_empty() => ts.trim().to_string(),
                _ => {
                    let text = cell_text(first);
                    if !CLOCK_TIME.is_match(&text) {
                        continue;
                    }
                    text
                }
            };

            if tagged {
                for cell in &row_cells {
                    let Some(horse_no) = cell
                        .value()
                        .attr("data-horse-num")
                        .and_then(|n| n.trim().parse::<u8>().ok())
                    else {
                        continue;
                    };
                    if let Some(value) = parse_value(&cell_text(cell)) {
                        records.push(RawOddsRecord {
                            horse_no,
                            timestamp_str: timestamp.clone(),
                            value,
                        });
                    }
                }
            } else {
                for (idx, cell) in row_cells.iter().enumerate().skip(1) {
                    let Ok(horse_no) = u8::try_from(idx) else {
                        break;
                    };
                    if let Some(value) = parse_value(&cell_text(cell)) {
                        records.push(RawOddsRecord {
                            horse_no,
                            timestamp_str: timestamp.clone(),
                            value,
                        });
                    }
                }
            }
        }

        Ok(records)
    }
}

/// Numeric cell value; placeholders and junk are skipped
fn parse_value(text: &str) -> Option<Decimal> {
    let cleaned = text.trim().replace(',', "");
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}
