//! CLI commands for hkjc-odds.
//!
//! Odds acquisition, result imports, session login and database status.

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::AppConfig;
use crate::error::ScrapeError;
use crate::pipeline::{
    build_session, date_range, import_results, load_results, update_dates, OddsPipeline,
};
use crate::retry::{retry_if, RetryConfig};
use crate::scraper::session::{CookieSet, SessionStore};
use crate::storage::models::parse_meeting_date;
use crate::storage::Database;
use crate::types::{hong_kong, OddsCategory};

#[derive(Parser)]
#[command(name = "hkjc-odds")]
#[command(version, about = "HKJC odds history collector", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Acquire odds and offshore market history for one or more meetings
    ScrapeOdds {
        /// Meeting date (YYYY-MM-DD or YYYY/MM/DD)
        #[arg(
            value_name = "DATE",
            value_parser = parse_meeting_date,
            required_unless_present_any = ["date_range", "update"],
            conflicts_with_all = ["date_range", "update"]
        )]
        date: Option<NaiveDate>,

        /// Every date from START to END inclusive; days without races are passed over
        #[arg(
            long,
            num_args = 2,
            value_names = ["START", "END"],
            value_parser = parse_meeting_date,
            conflicts_with = "update"
        )]
        date_range: Option<Vec<NaiveDate>>,

        /// Resume from the day after the last date with stored odds up to today
        #[arg(long)]
        update: bool,

        /// Race numbers (default: every race stored for the date)
        #[arg(short, long, value_delimiter = ',')]
        races: Option<Vec<u8>>,

        /// Only official win/place odds
        #[arg(long, conflicts_with_all = ["market_only", "types"])]
        official_only: bool,

        /// Only offshore market prices
        #[arg(long, conflicts_with = "types")]
        market_only: bool,

        /// Odds types by code (w, p, bet-w, bet-p, eat-w, eat-p)
        #[arg(long, value_delimiter = ',')]
        types: Option<Vec<OddsCategory>>,

        /// Acquire and validate without writing to the database
        #[arg(long)]
        dry_run: bool,
    },

    /// Persist race result units from a JSON file
    ImportResults {
        /// JSON array of result units
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Commit the whole file as one transaction
        #[arg(long)]
        meeting: bool,
    },

    /// Log in and write the cookie cache
    Login,

    /// Create the database schema
    InitDb,

    /// Show row counts and the latest meeting
    Status {
        /// Also show races and odds stored for this date
        #[arg(short, long, value_parser = parse_meeting_date)]
        date: Option<NaiveDate>,
    },
}

/// Dates of one odds run
pub enum DateSelection {
    Single(NaiveDate),
    Range(NaiveDate, NaiveDate),
    Update,
}

/// Categories selected by the odds filters
pub fn selected_categories(
    types: Option<Vec<OddsCategory>>,
    official_only: bool,
    market_only: bool,
) -> Vec<OddsCategory> {
    if let Some(mut types) = types {
        types.sort();
        types.dedup();
        types
    } else if official_only {
        OddsCategory::official().collect()
    } else if market_only {
        OddsCategory::market().collect()
    } else {
        OddsCategory::all()
    }
}

pub async fn run_scrape_odds(
    config: &AppConfig,
    dates: DateSelection,
    races: Option<Vec<u8>>,
    categories: Vec<OddsCategory>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let db = Database::open(&config.database)?;
    let pipeline = OddsPipeline::from_config(&config.scraper, db.clone())?.dry_run(dry_run);

    let dates = match dates {
        DateSelection::Single(date) => {
            let summary = pipeline.run(date, races, &categories).await?;
            println!("{}", summary);
            if summary.halted {
                anyhow::bail!("Run stopped early: re-login budget exhausted");
            }
            return Ok(());
        }
        DateSelection::Range(start, end) => date_range(start, end)?,
        DateSelection::Update => {
            let today = Utc::now().with_timezone(&hong_kong()).date_naive();
            update_dates(&db, today).await?
        }
    };
    if dates.is_empty() {
        println!("Nothing to do: odds are up to date");
        return Ok(());
    }

    let summary = pipeline.run_dates(&dates, races, &categories).await;
    println!("{}", summary);

    if summary.halted {
        anyhow::bail!("Run stopped early: re-login budget exhausted");
    }
    Ok(())
}

pub async fn run_import_results(config: &AppConfig, input: PathBuf, meeting: bool) -> anyhow::Result<()> {
    let units = load_results(&input)?;
    eprintln!("Loaded {} result units from {}", units.len(), input.display());

    let db = Database::open(&config.database)?;
    let summary = import_results(&db, units, meeting).await;
    println!("{}", summary);
    Ok(())
}

/// Log in from scratch, retrying only network-level failures
pub async fn login_with(session: &SessionStore, retry: &RetryConfig) -> anyhow::Result<CookieSet> {
    retry_if(retry, "login", ScrapeError::is_retryable, || session.login())
        .await
        .context("Login failed")
}

pub async fn run_login(config: &AppConfig) -> anyhow::Result<()> {
    let session = build_session(&config.scraper)?;
    let cookies = login_with(&session, &RetryConfig::default()).await?;

    println!(
        "Logged in: {} cookies written to {}",
        cookies.len(),
        config.scraper.cookie_file
    );
    println!(
        "Age gate: {}",
        if session.age_gate_passed().await { "passed" } else { "not passed" }
    );
    Ok(())
}

pub fn run_init_db(config: &AppConfig) -> anyhow::Result<()> {
    Database::open(&config.database)?;
    println!("Database ready at {}", config.database.path);
    Ok(())
}

pub async fn run_status(config: &AppConfig, date: Option<NaiveDate>) -> anyhow::Result<()> {
    let db = Database::open(&config.database)?;

    println!("Database: {}", config.database.path);
    println!();
    println!("=== Tables ===");
    for (table, count) in db.table_counts().await? {
        println!("  {:<16} {:>10}", table, count);
    }
    println!();

    match db.last_meeting_date().await? {
        Some(last) => println!("Latest meeting: {}", last),
        None => println!("Latest meeting: none"),
    }

    if let Some(date) = date {
        let races = db.race_numbers(date).await?;
        let (official, market) = db.odds_counts(date).await?;
        println!();
        println!("=== {} ===", date);
        println!("  Races:          {:?}", races);
        println!("  Official odds:  {}", official);
        println!("  Market prices:  {}", market);
    }
    Ok(())
}
