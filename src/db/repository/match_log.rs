use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{format_dt, parse_dt};
use crate::db::DatabaseError;
use crate::models::{MatchDetails, MatchLogEntry, MatchType, NewMatchLogEntry, Source};

/// Append one audit entry. The log is append-only; there is no update or
/// delete counterpart.
pub fn append_match_log(
    conn: &Connection,
    entry: &NewMatchLogEntry,
    now: NaiveDateTime,
) -> Result<i64, DatabaseError> {
    let details = serde_json::to_string(&entry.details)
        .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?;
    conn.execute(
        "INSERT INTO match_log (his_number, source, timestamp, match_type, doc_number,
         created_new_canonical, mobile_prereg_canonical_id, resulting_canonical_id, details)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.his_number,
            entry.source.as_str(),
            format_dt(&now),
            entry.match_type.as_str(),
            entry.doc_number,
            entry.created_new_canonical as i32,
            entry.mobile_prereg_canonical_id.map(|u| u.to_string()),
            entry.resulting_canonical_id.map(|u| u.to_string()),
            details,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Latest audit entries, newest first.
pub fn recent_match_log(conn: &Connection, limit: i64) -> Result<Vec<MatchLogEntry>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT entry_id, his_number, source, timestamp, match_type, doc_number,
                created_new_canonical, mobile_prereg_canonical_id, resulting_canonical_id, details
         FROM match_log ORDER BY entry_id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], map_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(entry_from_row(row?)?);
    }
    Ok(entries)
}

/// All audit entries for one canonical, oldest first.
pub fn match_log_for_canonical(
    conn: &Connection,
    canonical_id: &Uuid,
) -> Result<Vec<MatchLogEntry>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT entry_id, his_number, source, timestamp, match_type, doc_number,
                created_new_canonical, mobile_prereg_canonical_id, resulting_canonical_id, details
         FROM match_log WHERE resulting_canonical_id = ?1 ORDER BY entry_id",
    )?;
    let rows = stmt.query_map(params![canonical_id.to_string()], map_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(entry_from_row(row?)?);
    }
    Ok(entries)
}

struct MatchLogRow {
    entry_id: i64,
    his_number: String,
    source: String,
    timestamp: String,
    match_type: String,
    doc_number: Option<i64>,
    created_new_canonical: i32,
    mobile_prereg_canonical_id: Option<String>,
    resulting_canonical_id: Option<String>,
    details: String,
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatchLogRow> {
    Ok(MatchLogRow {
        entry_id: row.get(0)?,
        his_number: row.get(1)?,
        source: row.get(2)?,
        timestamp: row.get(3)?,
        match_type: row.get(4)?,
        doc_number: row.get(5)?,
        created_new_canonical: row.get(6)?,
        mobile_prereg_canonical_id: row.get(7)?,
        resulting_canonical_id: row.get(8)?,
        details: row.get(9)?,
    })
}

fn entry_from_row(row: MatchLogRow) -> Result<MatchLogEntry, DatabaseError> {
    let details: MatchDetails = serde_json::from_str(&row.details).unwrap_or_default();
    Ok(MatchLogEntry {
        entry_id: row.entry_id,
        his_number: row.his_number,
        source: Source::from_str(&row.source)?,
        timestamp: parse_dt(&row.timestamp),
        match_type: MatchType::from_str(&row.match_type)?,
        doc_number: row.doc_number,
        created_new_canonical: row.created_new_canonical != 0,
        mobile_prereg_canonical_id: row
            .mobile_prereg_canonical_id
            .and_then(|s| Uuid::parse_str(&s).ok()),
        resulting_canonical_id: row
            .resulting_canonical_id
            .and_then(|s| Uuid::parse_str(&s).ok()),
        details,
    })
}
