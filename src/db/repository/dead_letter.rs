use chrono::NaiveDateTime;
use rusqlite::{params, Connection};

use super::{format_dt, parse_dt};
use crate::db::DatabaseError;

/// A raw record the engine gave up on, with the terminal reason.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeadLetter {
    pub dead_letter_id: i64,
    pub raw_id: i64,
    pub reason: String,
    pub timestamp: NaiveDateTime,
}

pub fn insert_dead_letter(
    conn: &Connection,
    raw_id: i64,
    reason: &str,
    now: NaiveDateTime,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO dead_letter (raw_id, reason, timestamp) VALUES (?1, ?2, ?3)",
        params![raw_id, reason, format_dt(&now)],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_dead_letters(conn: &Connection) -> Result<Vec<DeadLetter>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT dead_letter_id, raw_id, reason, timestamp FROM dead_letter ORDER BY dead_letter_id",
    )?;
    let letters = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(dead_letter_id, raw_id, reason, timestamp)| DeadLetter {
            dead_letter_id,
            raw_id,
            reason,
            timestamp: parse_dt(&timestamp),
        })
        .collect();
    Ok(letters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    #[test]
    fn dead_letters_round_trip() {
        let conn = open_memory_database().unwrap();
        insert_dead_letter(&conn, 42, "doc_type set but doc_number null", parse_dt("2026-03-01 09:00:00")).unwrap();

        let letters = list_dead_letters(&conn).unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].raw_id, 42);
        assert!(letters[0].reason.contains("doc_number"));
    }
}
