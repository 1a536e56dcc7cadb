//! HKJC odds collector
//!
//! Acquires official odds and offshore market history from horse.hk33.com
//! and stores it against race results in SQLite.

mod cli;
mod config;
mod error;
mod pipeline;
mod retry;
mod scraper;
mod storage;
mod types;
mod validation;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands, DateSelection};
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Credentials usually live in .env
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::ScrapeOdds {
            date,
            date_range,
            update,
            races,
            official_only,
            market_only,
            types,
            dry_run,
        } => {
            let dates = match (date, date_range.as_deref()) {
                (Some(date), _) => DateSelection::Single(date),
                (None, Some([start, end])) => DateSelection::Range(*start, *end),
                _ if update => DateSelection::Update,
                _ => anyhow::bail!("Give a date, --date-range START END or --update"),
            };
            let categories = cli::selected_categories(types, official_only, market_only);
            cli::run_scrape_odds(&config, dates, races, categories, dry_run).await
        }
        Commands::ImportResults { input, meeting } => {
            cli::run_import_results(&config, input, meeting).await
        }
        Commands::Login => cli::run_login(&config).await,
        Commands::InitDb => cli::run_init_db(&config),
        Commands::Status { date } => cli::run_status(&config, date).await,
    }
}
