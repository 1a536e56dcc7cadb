//! SQLite schema for race results and odds history
//!
//! Tables:
//! - meeting: One race day at one venue
//! - race: Races of a meeting
//! - horse / jockey / trainer: Master records keyed by external code
//! - horse_history: Append-only horse profile snapshots
//! - runner: A horse's start in a race, carrying its display number
//! - horse_sectional: Per-section running positions and times
//! - hkjc_odds: Official win/place odds history
//! - offshore_market: Offshore bet/eat price history
//!
//! Decimal values are stored as text to keep them exact. Timestamps are
//! RFC 3339 with a fixed +08:00 offset, so they also sort lexically.

use rusqlite::{Connection, Result};

/// Create all tables in the database
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meeting (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            venue_code TEXT NOT NULL,
            venue_name TEXT,
            source_url TEXT,
            season INTEGER,
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(date, venue_code)
        );

        CREATE TABLE IF NOT EXISTS race (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            meeting_id INTEGER NOT NULL REFERENCES meeting(id),
            race_no INTEGER NOT NULL,
            race_code INTEGER,
            name_cn TEXT,
            class_text TEXT,
            distance_m INTEGER,
            track_type TEXT,
            track_course TEXT,
            going TEXT,
            prize_total INTEGER,
            final_time_str TEXT,
            localresults_url TEXT,
            sectional_url TEXT,
            UNIQUE(meeting_id, race_no)
        );

        CREATE TABLE IF NOT EXISTS horse (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            name_cn TEXT,
            name_en TEXT,
            hkjc_horse_id TEXT,
            profile_url TEXT
        );

        CREATE TABLE IF NOT EXISTS horse_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            horse_id INTEGER NOT NULL REFERENCES horse(id),
            captured_at TEXT NOT NULL,
            origin TEXT,
            age INTEGER,
            colour TEXT,
            sex TEXT,
            import_type TEXT,
            season_prize_hkd INTEGER,
            lifetime_prize_hkd INTEGER,
            record_wins INTEGER,
            record_seconds INTEGER,
            record_thirds INTEGER,
            record_starts INTEGER,
            current_rating INTEGER,
            season_start_rating INTEGER,
            owner_name TEXT,
            sire_name TEXT,
            dam_name TEXT,
            dam_sire_name TEXT,
            UNIQUE(horse_id, captured_at)
        );

        CREATE TABLE IF NOT EXISTS jockey (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            name_cn TEXT,
            name_en TEXT
        );

        CREATE TABLE IF NOT EXISTS trainer (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            name_cn TEXT,
            name_en TEXT
        );

        CREATE TABLE IF NOT EXISTS runner (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            race_id INTEGER NOT NULL REFERENCES race(id),
            horse_id INTEGER NOT NULL REFERENCES horse(id),
            jockey_id INTEGER REFERENCES jockey(id),
            trainer_id INTEGER REFERENCES trainer(id),
            horse_no INTEGER,
            draw INTEGER,
            actual_weight INTEGER,
            declared_weight INTEGER,
            finish_position_raw TEXT,
            finish_position_num INTEGER,
            margin_raw TEXT,
            running_pos_raw TEXT,
            finish_time_str TEXT,
            win_odds TEXT,
            UNIQUE(race_id, horse_id)
        );

        CREATE TABLE IF NOT EXISTS horse_sectional (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            runner_id INTEGER NOT NULL REFERENCES runner(id),
            section_no INTEGER NOT NULL,
            position INTEGER,
            margin_raw TEXT,
            time_main TEXT,
            time_sub1 TEXT,
            time_sub2 TEXT,
            time_sub3 TEXT,
            finish_time_str TEXT,
            raw_cell TEXT,
            UNIQUE(runner_id, section_no)
        );

        CREATE TABLE IF NOT EXISTS hkjc_odds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            race_id INTEGER NOT NULL REFERENCES race(id),
            runner_id INTEGER NOT NULL REFERENCES runner(id),
            horse_id INTEGER NOT NULL REFERENCES horse(id),
            bet_type TEXT NOT NULL,
            odds_value TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            source_url TEXT,
            scraped_at TEXT NOT NULL,
            UNIQUE(runner_id, bet_type, recorded_at)
        );

        CREATE TABLE IF NOT EXISTS offshore_market (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            race_id INTEGER NOT NULL REFERENCES race(id),
            runner_id INTEGER NOT NULL REFERENCES runner(id),
            horse_id INTEGER NOT NULL REFERENCES horse(id),
            market_type TEXT NOT NULL,
            price TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            source_url TEXT,
            scraped_at TEXT NOT NULL,
            UNIQUE(runner_id, market_type, recorded_at)
        );

        CREATE INDEX IF NOT EXISTS idx_meeting_date ON meeting(date);
        CREATE INDEX IF NOT EXISTS idx_race_meeting ON race(meeting_id);
        CREATE INDEX IF NOT EXISTS idx_runner_race_horse_no ON runner(race_id, horse_no);
        CREATE INDEX IF NOT EXISTS idx_hkjc_odds_race ON hkjc_odds(race_id, bet_type);
        CREATE INDEX IF NOT EXISTS idx_offshore_market_race ON offshore_market(race_id, market_type);
        CREATE INDEX IF NOT EXISTS idx_horse_history_horse ON horse_history(horse_id);
        "#,
    )?;

    Ok(())
}

/// Tables reported by the status command, in dependency order
pub const TABLES: [&str; 10] = [
    "meeting",
    "race",
    "horse",
    "horse_history",
    "jockey",
    "trainer",
    "runner",
    "horse_sectional",
    "hkjc_odds",
    "offshore_market",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in TABLES {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_create_tables_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap(); // Should not fail
    }
}
