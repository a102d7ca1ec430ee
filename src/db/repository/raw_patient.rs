use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{format_dt, parse_dt};
use crate::db::DatabaseError;
use crate::models::{parse_doc_number, BusinessUnit, NewRawPatient, RawPatient, Source};

const RAW_COLUMNS: &str = "raw_id, his_number, source, business_unit, last_name, first_name, \
     middle_name, birth_date, doc_type, doc_number, email, phone, his_password, login_email, \
     canonical_id, processed_at";

/// What `upsert_raw` did with an adapter snapshot.
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    /// First sighting of (his_number, source); row inserted unstamped.
    Inserted(RawPatient),
    /// Known record re-emitted; adapter-owned fields overwritten.
    Updated { old: RawPatient, new: RawPatient },
}

/// Adapter ingress: insert a raw snapshot. Wire-format fields are
/// normalized first; `canonical_id` and `processed_at` start null per the
/// ingest contract.
pub fn insert_raw(conn: &Connection, raw: &NewRawPatient) -> Result<i64, DatabaseError> {
    let raw = raw.normalized();
    conn.execute(
        "INSERT INTO raw_patient (his_number, source, business_unit, last_name, first_name,
         middle_name, birth_date, doc_type, doc_number, email, phone, his_password, login_email)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            raw.his_number,
            raw.source.as_str(),
            raw.business_unit.map(|b| b.as_str()),
            raw.last_name,
            raw.first_name,
            raw.middle_name,
            raw.birth_date,
            raw.doc_type,
            raw.doc_number.as_deref().and_then(parse_doc_number),
            raw.email,
            raw.phone,
            raw.his_password,
            raw.login_email,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Adapter ingress for re-emitted snapshots: insert on first sighting,
/// otherwise overwrite the adapter-owned fields and report both states so
/// the engine can run its update path. Wire-format fields are normalized
/// either way.
pub fn upsert_raw(conn: &Connection, raw: &NewRawPatient) -> Result<UpsertOutcome, DatabaseError> {
    let raw = raw.normalized();
    match get_raw_by_his(conn, raw.source, &raw.his_number)? {
        None => {
            let raw_id = insert_raw(conn, &raw)?;
            let inserted = get_raw(conn, raw_id)?.ok_or_else(|| DatabaseError::NotFound {
                entity_type: "RawPatient".into(),
                id: raw_id.to_string(),
            })?;
            Ok(UpsertOutcome::Inserted(inserted))
        }
        Some(old) => {
            conn.execute(
                "UPDATE raw_patient SET business_unit = ?2, last_name = ?3, first_name = ?4,
                 middle_name = ?5, birth_date = ?6, doc_type = ?7, doc_number = ?8, email = ?9,
                 phone = ?10, his_password = ?11, login_email = ?12
                 WHERE raw_id = ?1",
                params![
                    old.raw_id,
                    raw.business_unit.map(|b| b.as_str()),
                    raw.last_name,
                    raw.first_name,
                    raw.middle_name,
                    raw.birth_date,
                    raw.doc_type,
                    raw.doc_number.as_deref().and_then(parse_doc_number),
                    raw.email,
                    raw.phone,
                    raw.his_password,
                    raw.login_email,
                ],
            )?;
            let new = get_raw(conn, old.raw_id)?.ok_or_else(|| DatabaseError::NotFound {
                entity_type: "RawPatient".into(),
                id: old.raw_id.to_string(),
            })?;
            Ok(UpsertOutcome::Updated { old, new })
        }
    }
}

pub fn get_raw(conn: &Connection, raw_id: i64) -> Result<Option<RawPatient>, DatabaseError> {
    query_one(
        conn,
        &format!("SELECT {RAW_COLUMNS} FROM raw_patient WHERE raw_id = ?1"),
        params![raw_id],
    )
}

pub fn get_raw_by_his(
    conn: &Connection,
    source: Source,
    his_number: &str,
) -> Result<Option<RawPatient>, DatabaseError> {
    query_one(
        conn,
        &format!("SELECT {RAW_COLUMNS} FROM raw_patient WHERE his_number = ?1 AND source = ?2"),
        params![his_number, source.as_str()],
    )
}

/// Stamp the engine's verdict: which canonical this raw belongs to and when
/// it was reconciled.
pub fn stamp_raw(
    conn: &Connection,
    raw_id: i64,
    canonical_id: &Uuid,
    now: NaiveDateTime,
) -> Result<(), DatabaseError> {
    let rows = conn.execute(
        "UPDATE raw_patient SET canonical_id = ?2, processed_at = ?3 WHERE raw_id = ?1",
        params![raw_id, canonical_id.to_string(), format_dt(&now)],
    )?;
    if rows == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "RawPatient".into(),
            id: raw_id.to_string(),
        });
    }
    Ok(())
}

/// Stamp `processed_at` only — the locked-skip path, where the canonical
/// assignment must not move.
pub fn stamp_processed(conn: &Connection, raw_id: i64, now: NaiveDateTime) -> Result<(), DatabaseError> {
    let rows = conn.execute(
        "UPDATE raw_patient SET processed_at = ?2 WHERE raw_id = ?1",
        params![raw_id, format_dt(&now)],
    )?;
    if rows == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "RawPatient".into(),
            id: raw_id.to_string(),
        });
    }
    Ok(())
}

/// Unprocessed backlog, oldest first.
pub fn pending_raw_ids(conn: &Connection, limit: i64) -> Result<Vec<i64>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT raw_id FROM raw_patient WHERE processed_at IS NULL ORDER BY raw_id LIMIT ?1",
    )?;
    let ids = stmt
        .query_map(params![limit], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn count_pending(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM raw_patient WHERE processed_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn last_processed_at(conn: &Connection) -> Result<Option<NaiveDateTime>, DatabaseError> {
    let last: Option<String> = conn.query_row(
        "SELECT MAX(processed_at) FROM raw_patient",
        [],
        |row| row.get(0),
    )?;
    Ok(last.map(|t| parse_dt(&t)))
}

// Internal row type for raw mapping
struct RawRow {
    raw_id: i64,
    his_number: String,
    source: String,
    business_unit: Option<String>,
    last_name: Option<String>,
    first_name: Option<String>,
    middle_name: Option<String>,
    birth_date: Option<String>,
    doc_type: Option<i32>,
    doc_number: Option<i64>,
    email: Option<String>,
    phone: Option<String>,
    his_password: Option<String>,
    login_email: Option<String>,
    canonical_id: Option<String>,
    processed_at: Option<String>,
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        raw_id: row.get(0)?,
        his_number: row.get(1)?,
        source: row.get(2)?,
        business_unit: row.get(3)?,
        last_name: row.get(4)?,
        first_name: row.get(5)?,
        middle_name: row.get(6)?,
        birth_date: row.get(7)?,
        doc_type: row.get(8)?,
        doc_number: row.get(9)?,
        email: row.get(10)?,
        phone: row.get(11)?,
        his_password: row.get(12)?,
        login_email: row.get(13)?,
        canonical_id: row.get(14)?,
        processed_at: row.get(15)?,
    })
}

fn query_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<RawPatient>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let result = stmt.query_row(params, map_row);
    match result {
        Ok(row) => Ok(Some(raw_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn raw_from_row(row: RawRow) -> Result<RawPatient, DatabaseError> {
    Ok(RawPatient {
        raw_id: row.raw_id,
        his_number: row.his_number,
        source: Source::from_str(&row.source)?,
        business_unit: row
            .business_unit
            .as_deref()
            .map(BusinessUnit::from_str)
            .transpose()?,
        last_name: row.last_name,
        first_name: row.first_name,
        middle_name: row.middle_name,
        birth_date: row
            .birth_date
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        doc_type: row.doc_type,
        doc_number: row.doc_number,
        email: row.email,
        phone: row.phone,
        his_password: row.his_password,
        login_email: row.login_email,
        canonical_id: row.canonical_id.and_then(|s| Uuid::parse_str(&s).ok()),
        processed_at: row.processed_at.map(|t| parse_dt(&t)),
    })
}
