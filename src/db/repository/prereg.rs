use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{format_dt, parse_dt};
use crate::db::DatabaseError;
use crate::models::{MobilePrereg, NewMobilePrereg, Source};

/// Register a mobile pre-registration with its reserved canonical id.
///
/// The reservation must be unique across both the prereg table and the
/// canonical registry — a reserved id that already materialized cannot be
/// reserved again.
pub fn insert_prereg(
    conn: &Connection,
    prereg: &NewMobilePrereg,
    now: NaiveDateTime,
) -> Result<i64, DatabaseError> {
    prereg
        .validate()
        .map_err(DatabaseError::ConstraintViolation)?;

    let taken: i64 = conn.query_row(
        "SELECT COUNT(*) FROM canonical WHERE canonical_id = ?1",
        params![prereg.canonical_id.to_string()],
        |row| row.get(0),
    )?;
    if taken > 0 {
        return Err(DatabaseError::ConstraintViolation(format!(
            "canonical id {} already materialized",
            prereg.canonical_id
        )));
    }

    conn.execute(
        "INSERT INTO mobile_prereg (canonical_id, his_number_qms, his_number_infoclinica,
         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![
            prereg.canonical_id.to_string(),
            prereg.his_number_qms,
            prereg.his_number_infoclinica,
            format_dt(&now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Matching lookup: is this (source, his_number) pair reserved by a
/// mobile pre-registration?
pub fn find_prereg_by_source_his(
    conn: &Connection,
    source: Source,
    his_number: &str,
) -> Result<Option<MobilePrereg>, DatabaseError> {
    let column = match source {
        Source::Qms => "his_number_qms",
        Source::Infoclinica => "his_number_infoclinica",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT prereg_id, canonical_id, his_number_qms, his_number_infoclinica,
                created_at, updated_at
         FROM mobile_prereg WHERE {column} = ?1"
    ))?;
    let result = stmt.query_row(params![his_number], map_row);
    match result {
        Ok(row) => Ok(Some(prereg_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

struct PreregRow {
    prereg_id: i64,
    canonical_id: String,
    his_number_qms: Option<String>,
    his_number_infoclinica: Option<String>,
    created_at: String,
    updated_at: String,
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PreregRow> {
    Ok(PreregRow {
        prereg_id: row.get(0)?,
        canonical_id: row.get(1)?,
        his_number_qms: row.get(2)?,
        his_number_infoclinica: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn prereg_from_row(row: PreregRow) -> Result<MobilePrereg, DatabaseError> {
    Ok(MobilePrereg {
        prereg_id: row.prereg_id,
        canonical_id: Uuid::parse_str(&row.canonical_id)
            .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?,
        his_number_qms: row.his_number_qms,
        his_number_infoclinica: row.his_number_infoclinica,
        created_at: parse_dt(&row.created_at),
        updated_at: parse_dt(&row.updated_at),
    })
}
