//! SQLite storage for race results and odds history
//!
//! Provides the dependency-ordered batch writer, the runner lookup used to
//! attach odds to stored runners, and status queries.

pub mod batch;
pub mod database;
pub mod models;
pub mod repository;
pub mod schema;

pub use database::Database;
pub use models::{OddsRow, PersistBatch, PersistCounts, RaceResultUnit};
pub use repository::{RaceRepository, RunnerMap};
