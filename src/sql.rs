// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL text builders for the five statement shapes the engine issues.
//!
//! Row-change payloads carry full row images as column/value maps, so the
//! statements are rendered as complete SQL text: identifiers are backtick
//! quoted, string values single-quote escaped, and the lock-key predicate
//! always targets exactly one row.

use serde_json::Value;

use crate::error::{ApplyError, Result};
use crate::event::Row;
use crate::version_vector::VERSION_COLUMN;

/// Render one value as a SQL literal.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        // Arrays and objects only appear for JSON columns; store their text.
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Backtick-quote an identifier.
pub fn ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Build the lock-key predicate `` `a` = x AND `b` = y `` from a row image.
///
/// Fails when the image is missing any lock-key column.
pub fn where_clause(table: &str, lock_key: &[String], values: &Row) -> Result<String> {
    let mut parts = Vec::with_capacity(lock_key.len());
    for column in lock_key {
        let value = values.get(column).ok_or_else(|| ApplyError::MissingLockKey {
            table: table.to_string(),
            column: column.clone(),
        })?;
        parts.push(format!("{} = {}", ident(column), literal(value)));
    }
    Ok(parts.join(" AND "))
}

/// `SELECT * FROM t WHERE ... FOR UPDATE`
pub fn select_for_update(table: &str, where_clause: &str) -> String {
    format!(
        "SELECT * FROM {} WHERE {} FOR UPDATE",
        ident(table),
        where_clause
    )
}

/// `UPDATE t SET ... WHERE ...`
pub fn update(table: &str, values: &Row, where_clause: &str) -> String {
    let assignments: Vec<String> = values
        .iter()
        .map(|(column, value)| format!("{} = {}", ident(column), literal(value)))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        ident(table),
        assignments.join(", "),
        where_clause
    )
}

/// `UPDATE t SET version_vector = version_vector | 1 WHERE ...`
///
/// Freezes the row by setting the conflict-lock bit in place.
pub fn freeze(table: &str, where_clause: &str) -> String {
    let col = ident(VERSION_COLUMN);
    format!(
        "UPDATE {} SET {col} = {col} | 1 WHERE {}",
        ident(table),
        where_clause
    )
}

/// `INSERT INTO t (...) VALUES (...)`
pub fn insert(table: &str, values: &Row) -> String {
    let columns: Vec<String> = values.keys().map(|c| ident(c)).collect();
    let literals: Vec<String> = values.values().map(literal).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        ident(table),
        columns.join(", "),
        literals.join(", ")
    )
}

/// `DELETE FROM t WHERE ...`
pub fn delete(table: &str, where_clause: &str) -> String {
    format!("DELETE FROM {} WHERE {}", ident(table), where_clause)
}
