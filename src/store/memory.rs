//! In-memory table store
//!
//! Keeps each table as a vector sorted by `(base_dt, symbol)`. Suited to
//! tests and small replay runs; the SQLite backend carries the same contract
//! for persistent warehouses.

use crate::error::{Result, WarehouseError};
use crate::store::{apply_position, Position, Predicate, TableStore};
use crate::types::Row;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: BTreeMap<String, Vec<Row>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sort(rows: &mut [Row]) {
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
    }

    /// Total row count across all tables
    pub fn row_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

impl TableStore for MemoryStore {
    fn put(&mut self, table: &str, mut rows: Vec<Row>) -> Result<()> {
        Self::sort(&mut rows);
        self.tables.insert(table.to_string(), rows);
        Ok(())
    }

    fn append(&mut self, table: &str, rows: Vec<Row>) -> Result<()> {
        let stored = self.tables.entry(table.to_string()).or_default();
        stored.extend(rows);
        Self::sort(stored);
        Ok(())
    }

    fn remove(&mut self, table: &str, predicate: &Predicate) -> Result<usize> {
        let Some(stored) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = stored.len();
        stored.retain(|row| !predicate.matches(row));
        Ok(before - stored.len())
    }

    fn read(&self, table: &str, predicate: &Predicate, position: Position) -> Result<Vec<Row>> {
        let stored = self.tables.get(table).ok_or_else(|| {
            WarehouseError::DataGap(format!(
                "table {} does not exist; run the initial load first",
                table
            ))
        })?;
        let matching = stored
            .iter()
            .filter(|row| predicate.matches(row))
            .cloned()
            .collect();
        Ok(apply_position(matching, position))
    }

    fn tables(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{first_date, last_date};
    use chrono::NaiveDate;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sample_rows() -> Vec<Row> {
        vec![
            Row::new(ymd(2024, 2, 2), "000660").with_field("close", 100.0),
            Row::new(ymd(2024, 2, 1), "005930").with_field("close", 70.0),
            Row::new(ymd(2024, 2, 2), "005930").with_field("close", 71.0),
        ]
    }

    #[test]
    fn test_rows_kept_in_key_order() {
        let mut store = MemoryStore::new();
        store.put("daily", sample_rows()).unwrap();

        let rows = store.read("daily", &Predicate::all(), Position::All).unwrap();
        let keys: Vec<_> = rows.iter().map(|r| (r.base_dt, r.symbol.clone())).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_read_missing_table_is_a_gap() {
        let store = MemoryStore::new();
        let result = store.read("daily", &Predicate::all(), Position::All);
        assert!(matches!(result, Err(WarehouseError::DataGap(_))));
    }

    #[test]
    fn test_remove_missing_table_is_noop() {
        let mut store = MemoryStore::new();
        assert_eq!(store.remove("daily", &Predicate::all()).unwrap(), 0);
    }

    #[test]
    fn test_watermarks() {
        let mut store = MemoryStore::new();
        store.put("daily", sample_rows()).unwrap();
        assert_eq!(first_date(&store, "daily").unwrap(), ymd(2024, 2, 1));
        assert_eq!(last_date(&store, "daily").unwrap(), ymd(2024, 2, 2));
    }

    #[test]
    fn test_replace_window_scopes_to_predicate() {
        let mut store = MemoryStore::new();
        store.put("daily", sample_rows()).unwrap();

        let replacement = vec![Row::new(ymd(2024, 2, 2), "005930").with_field("close", 72.0)];
        let predicate = Predicate::all()
            .date_from(ymd(2024, 2, 2))
            .symbols_in(["005930"]);
        store.replace_window("daily", &predicate, replacement).unwrap();

        let rows = store.read("daily", &Predicate::all(), Position::All).unwrap();
        assert_eq!(rows.len(), 3);
        let replaced = store
            .read("daily", &predicate, Position::All)
            .unwrap();
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].field_f64("close"), Some(72.0));
    }

    #[test]
    fn test_append_after_put() {
        let mut store = MemoryStore::new();
        store.put("daily", sample_rows()).unwrap();
        store
            .append("daily", vec![Row::new(ymd(2024, 2, 5), "005930")])
            .unwrap();
        assert_eq!(last_date(&store, "daily").unwrap(), ymd(2024, 2, 5));
        assert_eq!(store.row_count(), 4);
    }
}
