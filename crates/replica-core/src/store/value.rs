//! Conversions between JSON rows and SQLite values
//!
//! Rows cross every boundary of the crate as `serde_json::Map`s. SQLite has no
//! JSON or boolean storage class, so the declared column type decides how a
//! stored value is read back: `JSON`/`JSONB` text is parsed, `BOOLEAN`
//! integers become booleans.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Row as SqlRow, Statement};
use serde_json::{Map, Number, Value};

/// A table row keyed by column name
pub type Row = Map<String, Value>;

/// Convert a JSON value into a bindable SQLite value
pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Text(n.to_string())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Convert a stored SQLite value into JSON using the declared column type
pub fn from_sql(value: ValueRef<'_>, decl_type: Option<&str>) -> Value {
    let decl = decl_type.map(str::to_ascii_uppercase);
    let decl = decl.as_deref();

    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => match decl {
            Some("BOOLEAN") | Some("BOOL") => Value::Bool(i != 0),
            _ => Value::Number(i.into()),
        },
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            match decl {
                Some("JSON") | Some("JSONB") => serde_json::from_str(&text)
                    .unwrap_or_else(|_| Value::String(text.into_owned())),
                _ => Value::String(text.into_owned()),
            }
        }
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

/// Bind parameters for a statement
pub fn params(values: &[Value]) -> Vec<SqlValue> {
    values.iter().map(to_sql).collect()
}

/// Column names and declared types of a prepared statement
pub(crate) fn columns(stmt: &Statement<'_>) -> Vec<(String, Option<String>)> {
    stmt.columns()
        .iter()
        .map(|c| (c.name().to_string(), c.decl_type().map(str::to_string)))
        .collect()
}

fn decode(row: &SqlRow<'_>, columns: &[(String, Option<String>)]) -> rusqlite::Result<Row> {
    let mut out = Row::new();
    for (idx, (name, decl)) in columns.iter().enumerate() {
        out.insert(name.clone(), from_sql(row.get_ref(idx)?, decl.as_deref()));
    }
    Ok(out)
}

/// Run a statement and decode every result row
pub(crate) fn read_rows(stmt: &mut Statement<'_>, values: &[Value]) -> rusqlite::Result<Vec<Row>> {
    let columns = columns(stmt);
    let bound = params(values);
    let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(decode(row, &columns)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use serde_json::json;

    #[test]
    fn test_to_sql_variants() {
        assert_eq!(to_sql(&Value::Null), SqlValue::Null);
        assert_eq!(to_sql(&json!(true)), SqlValue::Integer(1));
        assert_eq!(to_sql(&json!(42)), SqlValue::Integer(42));
        assert_eq!(to_sql(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(to_sql(&json!("abc")), SqlValue::Text("abc".to_string()));
        assert_eq!(
            to_sql(&json!({"a": [1, 2]})),
            SqlValue::Text(r#"{"a":[1,2]}"#.to_string())
        );
    }

    #[test]
    fn test_declared_types_drive_decoding() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id TEXT, active BOOLEAN, config JSONB, data JSON, n INTEGER, r REAL);",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO t VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params_from_iter(params(&[
                json!("a"),
                json!(true),
                json!({"columns": ["x"]}),
                json!([1, 2]),
                json!(7),
                json!(0.25),
            ])),
        )
        .unwrap();

        let mut stmt = conn.prepare("SELECT * FROM t").unwrap();
        let rows = read_rows(&mut stmt, &[]).unwrap();
        assert_eq!(rows.len(), 1);

        let row = &rows[0];
        assert_eq!(row["id"], json!("a"));
        assert_eq!(row["active"], json!(true));
        assert_eq!(row["config"], json!({"columns": ["x"]}));
        assert_eq!(row["data"], json!([1, 2]));
        assert_eq!(row["n"], json!(7));
        assert_eq!(row["r"], json!(0.25));
    }

    #[test]
    fn test_invalid_json_column_falls_back_to_text() {
        let value = from_sql(ValueRef::Text(b"not json"), Some("jsonb"));
        assert_eq!(value, json!("not json"));
    }

    #[test]
    fn test_expression_columns_have_no_decltype() {
        let conn = Connection::open_in_memory().unwrap();
        let mut stmt = conn.prepare("SELECT 1 AS one, ?1 AS echoed").unwrap();
        let rows = read_rows(&mut stmt, &[json!("hi")]).unwrap();
        assert_eq!(rows[0]["one"], json!(1));
        assert_eq!(rows[0]["echoed"], json!("hi"));
    }
}
