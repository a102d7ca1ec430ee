use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::db::DatabaseError;

/// The referrers registry: every (table, column) pair holding canonical ids.
/// Merges walk this list, so a new referring table only needs a registry row.
pub fn list_referrers(conn: &Connection) -> Result<Vec<(String, String)>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT table_name, column_name FROM referrers ORDER BY table_name")?;
    let pairs = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pairs)
}

pub fn add_referrer(conn: &Connection, table: &str, column: &str) -> Result<(), DatabaseError> {
    validate_identifier(table)?;
    validate_identifier(column)?;
    conn.execute(
        "INSERT INTO referrers (table_name, column_name) VALUES (?1, ?2)",
        params![table, column],
    )?;
    Ok(())
}

/// Rewrite every registered canonical reference from `from` to `to`.
/// Returns the total number of redirected rows.
pub fn rewrite_canonical_references(
    conn: &Connection,
    from: &Uuid,
    to: &Uuid,
) -> Result<usize, DatabaseError> {
    let from_s = from.to_string();
    let to_s = to.to_string();
    let mut total = 0;
    for (table, column) in list_referrers(conn)? {
        validate_identifier(&table)?;
        validate_identifier(&column)?;
        let rewritten = conn.execute(
            &format!("UPDATE {table} SET {column} = ?1 WHERE {column} = ?2"),
            params![to_s, from_s],
        )?;
        if rewritten > 0 {
            tracing::debug!(table = %table, column = %column, rewritten, "Redirected canonical references");
        }
        total += rewritten;
    }
    Ok(total)
}

/// Registry rows become SQL identifiers; only plain names are allowed.
fn validate_identifier(name: &str) -> Result<(), DatabaseError> {
    let ok = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !ok {
        return Err(DatabaseError::ConstraintViolation(format!(
            "invalid identifier in referrers registry: {name:?}"
        )));
    }
    Ok(())
}
