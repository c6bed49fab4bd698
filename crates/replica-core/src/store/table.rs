//! Generic row operations on replicated tables
//!
//! These helpers run on the worker thread against a borrowed connection or
//! transaction. Table and column names come from migrations and from the
//! change feed, so every identifier is quoted before it reaches SQL.

use rusqlite::Connection;
use serde_json::Value;
use std::fmt;

use super::error::{StoreError, StoreResult};
use super::value::{params, read_rows, Row};

/// Identity of a row: its primary-key columns and their values
#[derive(Debug, Clone, PartialEq)]
pub struct RowKey {
    parts: Vec<(String, Value)>,
}

impl RowKey {
    pub fn new(parts: Vec<(String, Value)>) -> Self {
        Self { parts }
    }

    /// Single-column `id` key
    pub fn id(id: impl Into<String>) -> Self {
        Self::new(vec![("id".to_string(), Value::String(id.into()))])
    }

    /// Extract the key from a row; `None` if any key column is missing or null
    pub fn from_row(primary_key: &[String], row: &Row) -> Option<Self> {
        let parts = primary_key
            .iter()
            .map(|col| match row.get(col) {
                Some(v) if !v.is_null() => Some((col.clone(), v.clone())),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() {
            None
        } else {
            Some(Self { parts })
        }
    }

    pub fn parts(&self) -> &[(String, Value)] {
        &self.parts
    }

    /// Stable string form, used to match pending operations
    pub fn identity(&self) -> String {
        self.parts
            .iter()
            .map(|(_, v)| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn contains_column(&self, column: &str) -> bool {
        self.parts.iter().any(|(c, _)| c == column)
    }

    fn where_clause(&self, first_param: usize) -> String {
        self.parts
            .iter()
            .enumerate()
            .map(|(i, (col, _))| format!("{} = ?{}", quote_ident(col), first_param + i))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn values(&self) -> Vec<Value> {
        self.parts.iter().map(|(_, v)| v.clone()).collect()
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

/// Quote an SQL identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Column names of a table in declaration order
pub fn table_columns(conn: &Connection, table: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Whether a table exists
pub fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Keep only the entries of `row` that name a column of the table
pub fn project(row: &Row, columns: &[String]) -> Row {
    row.iter()
        .filter(|(k, _)| columns.iter().any(|c| c == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub fn fetch_row(conn: &Connection, table: &str, key: &RowKey) -> StoreResult<Option<Row>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {} LIMIT 1",
        quote_ident(table),
        key.where_clause(1)
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = read_rows(&mut stmt, &key.values())?;
    Ok(if rows.is_empty() {
        None
    } else {
        Some(rows.swap_remove(0))
    })
}

/// Rows whose `column` equals `value`
pub fn fetch_where(
    conn: &Connection,
    table: &str,
    column: &str,
    value: &Value,
) -> StoreResult<Vec<Row>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {} = ?1",
        quote_ident(table),
        quote_ident(column)
    );
    let mut stmt = conn.prepare(&sql)?;
    Ok(read_rows(&mut stmt, std::slice::from_ref(value))?)
}

pub fn insert_row(conn: &Connection, table: &str, row: &Row) -> StoreResult<()> {
    if row.is_empty() {
        return Err(StoreError::InvalidRow {
            table: table.to_string(),
            details: "row has no columns".to_string(),
        });
    }

    let columns = row.keys().map(|c| quote_ident(c)).collect::<Vec<_>>();
    let placeholders = (1..=row.len()).map(|i| format!("?{}", i)).collect::<Vec<_>>();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        columns.join(", "),
        placeholders.join(", ")
    );
    let values = row.values().cloned().collect::<Vec<_>>();
    conn.execute(&sql, rusqlite::params_from_iter(params(&values).iter()))?;
    Ok(())
}

/// Update the given columns of the row identified by `key`; returns rows changed
pub fn update_row(conn: &Connection, table: &str, key: &RowKey, changes: &Row) -> StoreResult<usize> {
    if changes.is_empty() {
        return Ok(0);
    }

    let assignments = changes
        .keys()
        .enumerate()
        .map(|(i, col)| format!("{} = ?{}", quote_ident(col), i + 1))
        .collect::<Vec<_>>();
    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        quote_ident(table),
        assignments.join(", "),
        key.where_clause(changes.len() + 1)
    );
    let mut values = changes.values().cloned().collect::<Vec<_>>();
    values.extend(key.values());
    Ok(conn.execute(&sql, rusqlite::params_from_iter(params(&values).iter()))?)
}

pub fn delete_row(conn: &Connection, table: &str, key: &RowKey) -> StoreResult<usize> {
    let sql = format!("DELETE FROM {} WHERE {}", quote_ident(table), key.where_clause(1));
    Ok(conn.execute(&sql, rusqlite::params_from_iter(params(&key.values()).iter()))?)
}
