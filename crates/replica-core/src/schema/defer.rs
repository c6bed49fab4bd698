//! Deferred foreign keys
//!
//! Change feeds are delivered per table, so a child row can arrive before its
//! parent. SQLite checks a foreign key at commit time only when the
//! constraint is declared `DEFERRABLE INITIALLY DEFERRED`, and constraints
//! cannot be altered in place: the table has to be rebuilt from rewritten DDL.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::store::table::{quote_ident, table_columns};
use crate::store::StoreResult;

const DEFERRED: &str = "DEFERRABLE INITIALLY DEFERRED";

/// Rewrite every `REFERENCES` clause of a `CREATE TABLE` statement so it is
/// deferred. Returns `None` when nothing needs to change.
pub fn defer_references(ddl: &str) -> Option<String> {
    let upper = ddl.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let mut out = String::with_capacity(ddl.len() + 64);
    let mut cursor = 0;
    let mut search = 0;
    let mut changed = false;

    while let Some(start) = find_keyword(&upper, search, "REFERENCES") {
        let mut pos = skip_ws(bytes, start + "REFERENCES".len());
        pos = skip_identifier(bytes, pos);
        let after_table = pos;
        pos = skip_ws(bytes, pos);
        pos = if bytes.get(pos) == Some(&b'(') {
            skip_parens(bytes, pos)
        } else {
            after_table
        };
        pos = skip_actions(&upper, pos);

        let clause_start = skip_ws(bytes, pos);
        match deferral_clause(&upper, clause_start) {
            Some((end, true)) => {
                // Already deferred
                search = end;
                continue;
            }
            Some((end, false)) => {
                out.push_str(&ddl[cursor..clause_start]);
                out.push_str(DEFERRED);
                cursor = end;
                search = end;
            }
            None => {
                out.push_str(&ddl[cursor..pos]);
                out.push(' ');
                out.push_str(DEFERRED);
                cursor = pos;
                search = pos;
            }
        }
        changed = true;
    }

    if !changed {
        return None;
    }
    out.push_str(&ddl[cursor..]);
    Some(out)
}

/// Rebuild every table whose foreign keys are not yet deferred.
/// Returns the names of the rebuilt tables.
pub fn defer_foreign_keys(conn: &mut Connection) -> StoreResult<Vec<String>> {
    let pending = {
        let mut stmt = conn.prepare(
            "SELECT name, sql FROM sqlite_master
             WHERE type = 'table' AND sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        tables
            .into_iter()
            .filter_map(|(name, sql)| defer_references(&sql).map(|ddl| (name, ddl)))
            .collect::<Vec<_>>()
    };

    if pending.is_empty() {
        debug!("Foreign keys already deferred");
        return Ok(Vec::new());
    }

    // Table rebuilds must not trigger ON DELETE actions on dependents
    conn.execute_batch("PRAGMA foreign_keys = OFF")?;
    let result = rebuild_all(conn, &pending);
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    result?;

    let names: Vec<String> = pending.into_iter().map(|(name, _)| name).collect();
    info!("Deferred foreign keys on {} table(s): {}", names.len(), names.join(", "));
    Ok(names)
}

fn rebuild_all(conn: &mut Connection, pending: &[(String, String)]) -> StoreResult<()> {
    let tx = conn.transaction()?;
    for (name, ddl) in pending {
        rebuild_table(&tx, name, ddl)?;
    }
    tx.commit()?;
    Ok(())
}

fn rebuild_table(conn: &Connection, name: &str, ddl: &str) -> StoreResult<()> {
    let companions = {
        let mut stmt = conn.prepare(
            "SELECT sql FROM sqlite_master
             WHERE tbl_name = ?1 AND type IN ('index', 'trigger') AND sql IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let staging = format!("{}__deferred", name);
    let columns = table_columns(conn, name)?
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    conn.execute_batch(&rename_created_table(ddl, &staging))?;
    conn.execute_batch(&format!(
        "INSERT INTO {staging} ({columns}) SELECT {columns} FROM {table};
         DROP TABLE {table};
         ALTER TABLE {staging} RENAME TO {table};",
        staging = quote_ident(&staging),
        table = quote_ident(name),
        columns = columns,
    ))?;

    for sql in companions {
        conn.execute_batch(&sql)?;
    }

    debug!(table = name, "Rebuilt table with deferred foreign keys");
    Ok(())
}

/// Replace the table name in the head of a `CREATE TABLE` statement
fn rename_created_table(ddl: &str, new_name: &str) -> String {
    match ddl.find('(') {
        Some(paren) => format!("CREATE TABLE {} {}", quote_ident(new_name), &ddl[paren..]),
        None => ddl.to_string(),
    }
}

// ==================== DDL scanning ====================

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn keyword_at(upper: &str, pos: usize, keyword: &str) -> bool {
    let bytes = upper.as_bytes();
    if !upper[pos..].starts_with(keyword) {
        return false;
    }
    let before_ok = pos == 0 || !is_ident_byte(bytes[pos - 1]);
    let after_ok = bytes
        .get(pos + keyword.len())
        .map_or(true, |b| !is_ident_byte(*b));
    before_ok && after_ok
}

fn find_keyword(upper: &str, from: usize, keyword: &str) -> Option<usize> {
    let mut from = from;
    while let Some(rel) = upper.get(from..)?.find(keyword) {
        let pos = from + rel;
        if keyword_at(upper, pos, keyword) {
            return Some(pos);
        }
        from = pos + keyword.len();
    }
    None
}

fn skip_ws(bytes: &[u8], mut pos: usize) -> usize {
    while bytes.get(pos).is_some_and(|b| b.is_ascii_whitespace()) {
        pos += 1;
    }
    pos
}

fn skip_identifier(bytes: &[u8], pos: usize) -> usize {
    let close = match bytes.get(pos) {
        Some(b'"') => Some(b'"'),
        Some(b'`') => Some(b'`'),
        Some(b'[') => Some(b']'),
        _ => None,
    };
    match close {
        Some(close) => {
            let mut end = pos + 1;
            while end < bytes.len() && bytes[end] != close {
                end += 1;
            }
            (end + 1).min(bytes.len())
        }
        None => {
            let mut end = pos;
            while bytes.get(end).is_some_and(|b| is_ident_byte(*b) || *b == b'.') {
                end += 1;
            }
            end
        }
    }
}

fn skip_parens(bytes: &[u8], pos: usize) -> usize {
    let mut depth = 0usize;
    let mut end = pos;
    while end < bytes.len() {
        match bytes[end] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return end + 1;
                }
            }
            _ => {}
        }
        end += 1;
    }
    end
}

/// Skip `ON DELETE/UPDATE <action>` and `MATCH <name>` clauses
fn skip_actions(upper: &str, mut pos: usize) -> usize {
    const ACTIONS: &[&str] = &["SET NULL", "SET DEFAULT", "CASCADE", "RESTRICT", "NO ACTION"];
    let bytes = upper.as_bytes();

    loop {
        let p = skip_ws(bytes, pos);
        if keyword_at(upper, p, "ON") {
            let event = skip_ws(bytes, p + 2);
            let event_end = if keyword_at(upper, event, "DELETE") || keyword_at(upper, event, "UPDATE") {
                event + 6
            } else {
                return pos;
            };
            let action = skip_ws(bytes, event_end);
            match ACTIONS.iter().find(|a| keyword_at(upper, action, a)) {
                Some(a) => pos = action + a.len(),
                None => return pos,
            }
        } else if keyword_at(upper, p, "MATCH") {
            pos = skip_identifier(bytes, skip_ws(bytes, p + 5));
        } else {
            return pos;
        }
    }
}

/// Parse `[NOT] DEFERRABLE [INITIALLY DEFERRED|IMMEDIATE]` at `pos`.
/// Returns the end offset and whether the clause already defers.
fn deferral_clause(upper: &str, pos: usize) -> Option<(usize, bool)> {
    let bytes = upper.as_bytes();
    let (negated, mut end) = if keyword_at(upper, pos, "NOT") {
        let p = skip_ws(bytes, pos + 3);
        if !keyword_at(upper, p, "DEFERRABLE") {
            return None;
        }
        (true, p + "DEFERRABLE".len())
    } else if keyword_at(upper, pos, "DEFERRABLE") {
        (false, pos + "DEFERRABLE".len())
    } else {
        return None;
    };

    let mut deferred = false;
    let p = skip_ws(bytes, end);
    if keyword_at(upper, p, "INITIALLY") {
        let mode = skip_ws(bytes, p + "INITIALLY".len());
        if keyword_at(upper, mode, "DEFERRED") {
            deferred = true;
            end = mode + "DEFERRED".len();
        } else if keyword_at(upper, mode, "IMMEDIATE") {
            end = mode + "IMMEDIATE".len();
        }
    }

    Some((end, deferred && !negated))
}
