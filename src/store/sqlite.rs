//! SQLite-backed table store
//!
//! Each warehouse table is a SQLite table of `(base_dt, symbol, fields)`
//! with the field payload stored as JSON. Replace-window runs inside a
//! transaction so the remove and the append cannot be observed separately.

use crate::error::{Result, WarehouseError};
use crate::store::{apply_position, Position, Predicate, TableStore};
use crate::types::Row;
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use std::path::Path;

pub struct SqliteStore {
    conn: Connection,
}

fn store_err(err: rusqlite::Error) -> WarehouseError {
    WarehouseError::Store(err.to_string())
}

fn check_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(WarehouseError::Store(format!(
            "invalid table name: {}",
            table
        )))
    }
}

fn predicate_is_unconstrained(predicate: &Predicate) -> bool {
    let (from, to) = predicate.date_bounds();
    from.is_none()
        && to.is_none()
        && predicate.date_any.is_none()
        && predicate.symbols.is_none()
        && predicate.field_eq.is_empty()
        && predicate.str_field_ge.is_none()
}

impl SqliteStore {
    /// Create or open a store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(store_err)?;
        Ok(Self { conn })
    }

    /// In-memory store, for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Ok(Self { conn })
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(count > 0)
    }

    fn ensure_table(conn: &Connection, table: &str) -> Result<()> {
        check_name(table)?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{t}\" (
                    base_dt TEXT NOT NULL,
                    symbol TEXT NOT NULL,
                    fields TEXT NOT NULL
                )",
                t = table
            ),
            [],
        )
        .map_err(store_err)?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS \"idx_{t}_key\" ON \"{t}\" (base_dt, symbol)",
                t = table
            ),
            [],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn insert_rows(conn: &Connection, table: &str, rows: &[Row]) -> Result<()> {
        let mut stmt = conn
            .prepare(&format!(
                "INSERT INTO \"{}\" (base_dt, symbol, fields) VALUES (?1, ?2, ?3)",
                table
            ))
            .map_err(store_err)?;
        for row in rows {
            let fields = serde_json::to_string(&row.fields)?;
            stmt.execute(params![row.base_dt, row.symbol, fields])
                .map_err(store_err)?;
        }
        Ok(())
    }

    fn decode(base_dt: NaiveDate, symbol: String, fields: String) -> Result<Row> {
        Ok(Row {
            base_dt,
            symbol,
            fields: serde_json::from_str(&fields)?,
        })
    }

    /// All rows matching the predicate with their rowids, in key order
    fn select_matching(&self, table: &str, predicate: &Predicate) -> Result<Vec<(i64, Row)>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT rowid, base_dt, symbol, fields FROM \"{}\" ORDER BY base_dt, symbol",
                table
            ))
            .map_err(store_err)?;
        let mapped = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, NaiveDate>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })
            .map_err(store_err)?;

        let mut matching = Vec::new();
        for item in mapped {
            let (id, base_dt, symbol, fields) = item.map_err(store_err)?;
            let row = Self::decode(base_dt, symbol, fields)?;
            if predicate.matches(&row) {
                matching.push((id, row));
            }
        }
        Ok(matching)
    }

    fn delete_ids(tx: &Connection, table: &str, ids: &[i64]) -> Result<()> {
        let mut stmt = tx
            .prepare(&format!("DELETE FROM \"{}\" WHERE rowid = ?1", table))
            .map_err(store_err)?;
        for id in ids {
            stmt.execute(params![id]).map_err(store_err)?;
        }
        Ok(())
    }
}

impl TableStore for SqliteStore {
    fn put(&mut self, table: &str, rows: Vec<Row>) -> Result<()> {
        Self::ensure_table(&self.conn, table)?;
        let tx = self.conn.transaction().map_err(store_err)?;
        tx.execute(&format!("DELETE FROM \"{}\"", table), [])
            .map_err(store_err)?;
        Self::insert_rows(&tx, table, &rows)?;
        tx.commit().map_err(store_err)
    }

    fn append(&mut self, table: &str, rows: Vec<Row>) -> Result<()> {
        Self::ensure_table(&self.conn, table)?;
        let tx = self.conn.transaction().map_err(store_err)?;
        Self::insert_rows(&tx, table, &rows)?;
        tx.commit().map_err(store_err)
    }

    fn remove(&mut self, table: &str, predicate: &Predicate) -> Result<usize> {
        if !self.table_exists(table)? {
            return Ok(0);
        }
        let ids: Vec<i64> = self
            .select_matching(table, predicate)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let tx = self.conn.transaction().map_err(store_err)?;
        Self::delete_ids(&tx, table, &ids)?;
        tx.commit().map_err(store_err)?;
        Ok(ids.len())
    }

    fn read(&self, table: &str, predicate: &Predicate, position: Position) -> Result<Vec<Row>> {
        if !self.table_exists(table)? {
            return Err(WarehouseError::DataGap(format!(
                "table {} does not exist; run the initial load first",
                table
            )));
        }

        // Watermark fast path: first/last rows without scanning the table
        if predicate_is_unconstrained(predicate) {
            if let Position::First(n) | Position::Last(n) = position {
                let descending = matches!(position, Position::Last(_));
                let order = if descending { "DESC" } else { "ASC" };
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "SELECT base_dt, symbol, fields FROM \"{t}\"
                         ORDER BY base_dt {o}, symbol {o} LIMIT ?1",
                        t = table,
                        o = order
                    ))
                    .map_err(store_err)?;
                let mapped = stmt
                    .query_map(params![n as i64], |r| {
                        Ok((
                            r.get::<_, NaiveDate>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                        ))
                    })
                    .map_err(store_err)?;
                let mut rows = Vec::new();
                for item in mapped {
                    let (base_dt, symbol, fields) = item.map_err(store_err)?;
                    rows.push(Self::decode(base_dt, symbol, fields)?);
                }
                if descending {
                    rows.reverse();
                }
                return Ok(rows);
            }
        }

        let rows = self
            .select_matching(table, predicate)?
            .into_iter()
            .map(|(_, row)| row)
            .collect();
        Ok(apply_position(rows, position))
    }

    fn tables(&self) -> Vec<String> {
        let Ok(mut stmt) = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        ) else {
            return Vec::new();
        };
        stmt.query_map([], |r| r.get::<_, String>(0))
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    /// Remove and append inside a single transaction
    fn replace_window(&mut self, table: &str, predicate: &Predicate, rows: Vec<Row>) -> Result<usize> {
        Self::ensure_table(&self.conn, table)?;
        let ids: Vec<i64> = self
            .select_matching(table, predicate)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let count = rows.len();
        let tx = self.conn.transaction().map_err(store_err)?;
        Self::delete_ids(&tx, table, &ids)?;
        Self::insert_rows(&tx, table, &rows)?;
        tx.commit().map_err(store_err)?;
        Ok(count)
    }
}
