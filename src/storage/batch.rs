//! Multi-row upsert helpers
//!
//! Each entity batch is deduplicated in memory and written with one
//! `INSERT .. ON CONFLICT DO UPDATE` statement per chunk. A single statement
//! may not touch the same conflict key twice, so duplicates must be
//! collapsed before building it.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Row, Transaction};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::hash::Hash;

/// Most rows per statement
const MAX_ROWS_PER_STATEMENT: usize = 500;
/// Stay below SQLite's bound-parameter limit
const MAX_PARAMS_PER_STATEMENT: usize = 32_000;

/// Target table of an upsert
#[derive(Debug, Clone, Copy)]
pub struct UpsertTarget {
    pub table: &'static str,
    pub columns: &'static [&'static str],
    /// Unique key columns named in `ON CONFLICT(..)`
    pub conflict: &'static [&'static str],
}

impl UpsertTarget {
    fn rows_per_chunk(&self) -> usize {
        (MAX_PARAMS_PER_STATEMENT / self.columns.len().max(1)).clamp(1, MAX_ROWS_PER_STATEMENT)
    }

    fn insert_prefix(&self, rows: usize) -> String {
        let placeholders = format!("({})", vec!["?"; self.columns.len()].join(", "));
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.table,
            self.columns.join(", "),
            vec![placeholders; rows].join(", ")
        )
    }

    /// Upsert statement updating every non-key column
    pub fn upsert_sql(&self, rows: usize, returning: bool) -> String {
        let updates: Vec<String> = self
            .columns
            .iter()
            .filter(|column| !self.conflict.contains(column))
            .map(|column| format!("{column} = excluded.{column}"))
            .collect();
        let action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        let mut sql = format!(
            "{} ON CONFLICT({}) {}",
            self.insert_prefix(rows),
            self.conflict.join(", "),
            action
        );
        if returning {
            sql.push_str(&format!(" RETURNING id, {}", self.conflict.join(", ")));
        }
        sql
    }

    /// Insert statement leaving existing rows untouched
    pub fn insert_ignore_sql(&self, rows: usize) -> String {
        format!(
            "{} ON CONFLICT({}) DO NOTHING",
            self.insert_prefix(rows),
            self.conflict.join(", ")
        )
    }
}

/// Keep one item per key, the last one seen, in first-seen order
pub fn dedup_last_wins<T, K, F>(items: impl IntoIterator<Item = T>, key_of: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut positions: HashMap<K, usize> = HashMap::new();
    let mut kept: Vec<T> = Vec::new();
    for item in items {
        match positions.get(&key_of(&item)) {
            Some(&index) => kept[index] = item,
            None => {
                positions.insert(key_of(&item), kept.len());
                kept.push(item);
            }
        }
    }
    kept
}

/// Upsert rows and map each conflict key to its surrogate id
///
/// `key_of` reads the key from a returned row whose column 0 is the id and
/// whose following columns are the conflict columns in declared order.
pub fn upsert_returning_ids<K, F>(
    tx: &Transaction<'_>,
    target: &UpsertTarget,
    rows: &[Vec<Value>],
    key_of: F,
) -> rusqlite::Result<HashMap<K, i64>>
where
    K: Eq + Hash,
    F: Fn(&Row<'_>) -> rusqlite::Result<K>,
{
    let mut ids = HashMap::with_capacity(rows.len());
    for chunk in rows.chunks(target.rows_per_chunk()) {
        let mut stmt = tx.prepare(&target.upsert_sql(chunk.len(), true))?;
        let mut returned = stmt.query(params_from_iter(chunk.iter().flatten()))?;
        while let Some(row) = returned.next()? {
            let id: i64 = row.get(0)?;
            ids.insert(key_of(row)?, id);
        }
    }
    Ok(ids)
}

/// Upsert rows, returning the number of rows inserted or updated
pub fn upsert(tx: &Transaction<'_>, target: &UpsertTarget, rows: &[Vec<Value>]) -> rusqlite::Result<usize> {
    let mut affected = 0;
    for chunk in rows.chunks(target.rows_per_chunk()) {
        affected += tx.execute(
            &target.upsert_sql(chunk.len(), false),
            params_from_iter(chunk.iter().flatten()),
        )?;
    }
    Ok(affected)
}

/// Insert rows whose key is new, returning how many were added
pub fn insert_ignore(tx: &Transaction<'_>, target: &UpsertTarget, rows: &[Vec<Value>]) -> rusqlite::Result<usize> {
    let mut inserted = 0;
    for chunk in rows.chunks(target.rows_per_chunk()) {
        inserted += tx.execute(
            &target.insert_ignore_sql(chunk.len()),
            params_from_iter(chunk.iter().flatten()),
        )?;
    }
    Ok(inserted)
}

pub fn text(value: impl Into<String>) -> Value {
    Value::Text(value.into())
}

pub fn opt_text(value: &Option<String>) -> Value {
    value.as_ref().map_or(Value::Null, |s| Value::Text(s.clone()))
}

pub fn opt_int<T: Into<i64>>(value: Option<T>) -> Value {
    value.map_or(Value::Null, |v| Value::Integer(v.into()))
}

pub fn opt_id(value: Option<i64>) -> Value {
    opt_int(value)
}

/// Canonical text form, so equal values compare equal in SQL
pub fn decimal(value: &Decimal) -> Value {
    Value::Text(value.normalize().to_string())
}

pub fn opt_decimal(value: &Option<Decimal>) -> Value {
    value.as_ref().map_or(Value::Null, decimal)
}
