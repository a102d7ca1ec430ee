use std::str::FromStr;

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{format_dt, parse_dt};
use crate::db::DatabaseError;
use crate::models::{CanonicalPatient, Source, SourceSlot};

const CANONICAL_COLUMNS: &str = "canonical_id, doc_type, doc_number, last_name, first_name, \
     middle_name, birth_date, his_number_qms, email_qms, phone_qms, his_password_qms, \
     login_email_qms, his_number_infoclinica, email_infoclinica, phone_infoclinica, \
     his_password_infoclinica, login_email_infoclinica, primary_source, registered_via_mobile, \
     matching_locked, locked_at, lock_reason, created_at, updated_at";

fn his_column(source: Source) -> &'static str {
    match source {
        Source::Qms => "his_number_qms",
        Source::Infoclinica => "his_number_infoclinica",
    }
}

pub fn insert_canonical(conn: &Connection, c: &CanonicalPatient) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO canonical (canonical_id, doc_type, doc_number, last_name, first_name,
         middle_name, birth_date, his_number_qms, email_qms, phone_qms, his_password_qms,
         login_email_qms, his_number_infoclinica, email_infoclinica, phone_infoclinica,
         his_password_infoclinica, login_email_infoclinica, primary_source, registered_via_mobile,
         matching_locked, locked_at, lock_reason, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
        params![
            c.canonical_id.to_string(),
            c.doc_type,
            c.doc_number,
            c.last_name,
            c.first_name,
            c.middle_name,
            c.birth_date.map(|d| d.to_string()),
            c.qms.his_number,
            c.qms.email,
            c.qms.phone,
            c.qms.his_password,
            c.qms.login_email,
            c.infoclinica.his_number,
            c.infoclinica.email,
            c.infoclinica.phone,
            c.infoclinica.his_password,
            c.infoclinica.login_email,
            c.primary_source.as_str(),
            c.registered_via_mobile as i32,
            c.matching_locked as i32,
            c.locked_at.map(|t| format_dt(&t)),
            c.lock_reason,
            format_dt(&c.created_at),
            format_dt(&c.updated_at),
        ],
    )?;
    Ok(())
}

/// Write back every mutable column of a canonical. `created_at` never moves.
pub fn update_canonical(conn: &Connection, c: &CanonicalPatient) -> Result<(), DatabaseError> {
    let rows = conn.execute(
        "UPDATE canonical SET doc_type = ?2, doc_number = ?3, last_name = ?4, first_name = ?5,
         middle_name = ?6, birth_date = ?7, his_number_qms = ?8, email_qms = ?9, phone_qms = ?10,
         his_password_qms = ?11, login_email_qms = ?12, his_number_infoclinica = ?13,
         email_infoclinica = ?14, phone_infoclinica = ?15, his_password_infoclinica = ?16,
         login_email_infoclinica = ?17, primary_source = ?18, registered_via_mobile = ?19,
         matching_locked = ?20, locked_at = ?21, lock_reason = ?22, updated_at = ?23
         WHERE canonical_id = ?1",
        params![
            c.canonical_id.to_string(),
            c.doc_type,
            c.doc_number,
            c.last_name,
            c.first_name,
            c.middle_name,
            c.birth_date.map(|d| d.to_string()),
            c.qms.his_number,
            c.qms.email,
            c.qms.phone,
            c.qms.his_password,
            c.qms.login_email,
            c.infoclinica.his_number,
            c.infoclinica.email,
            c.infoclinica.phone,
            c.infoclinica.his_password,
            c.infoclinica.login_email,
            c.primary_source.as_str(),
            c.registered_via_mobile as i32,
            c.matching_locked as i32,
            c.locked_at.map(|t| format_dt(&t)),
            c.lock_reason,
            format_dt(&c.updated_at),
        ],
    )?;
    if rows == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "CanonicalPatient".into(),
            id: c.canonical_id.to_string(),
        });
    }
    Ok(())
}

pub fn delete_canonical(conn: &Connection, id: &Uuid) -> Result<(), DatabaseError> {
    let rows = conn.execute(
        "DELETE FROM canonical WHERE canonical_id = ?1",
        params![id.to_string()],
    )?;
    if rows == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "CanonicalPatient".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

pub fn get_canonical(conn: &Connection, id: &Uuid) -> Result<Option<CanonicalPatient>, DatabaseError> {
    query_one(
        conn,
        &format!("SELECT {CANONICAL_COLUMNS} FROM canonical WHERE canonical_id = ?1"),
        params![id.to_string()],
    )
}

/// Matching lookup by a source's HIS number. Locked canonicals are invisible.
pub fn find_canonical_by_source_his(
    conn: &Connection,
    source: Source,
    his_number: &str,
) -> Result<Option<CanonicalPatient>, DatabaseError> {
    let column = his_column(source);
    query_one(
        conn,
        &format!(
            "SELECT {CANONICAL_COLUMNS} FROM canonical
             WHERE {column} = ?1 AND matching_locked = 0"
        ),
        params![his_number],
    )
}

/// Matching lookup by document pair, optionally excluding one canonical
/// (the update path must not match a record against itself).
/// Locked canonicals are invisible.
pub fn find_canonical_by_document(
    conn: &Connection,
    doc_type: i32,
    doc_number: i64,
    exclude: Option<&Uuid>,
) -> Result<Option<CanonicalPatient>, DatabaseError> {
    query_one(
        conn,
        &format!(
            "SELECT {CANONICAL_COLUMNS} FROM canonical
             WHERE doc_type = ?1 AND doc_number = ?2 AND matching_locked = 0
               AND (?3 IS NULL OR canonical_id <> ?3)"
        ),
        params![doc_type, doc_number, exclude.map(|u| u.to_string())],
    )
}

fn query_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<CanonicalPatient>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let result = stmt.query_row(params, map_row);
    match result {
        Ok(row) => Ok(Some(canonical_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// Internal row type for canonical mapping
struct CanonicalRow {
    canonical_id: String,
    doc_type: Option<i32>,
    doc_number: Option<i64>,
    last_name: Option<String>,
    first_name: Option<String>,
    middle_name: Option<String>,
    birth_date: Option<String>,
    his_number_qms: Option<String>,
    email_qms: Option<String>,
    phone_qms: Option<String>,
    his_password_qms: Option<String>,
    login_email_qms: Option<String>,
    his_number_infoclinica: Option<String>,
    email_infoclinica: Option<String>,
    phone_infoclinica: Option<String>,
    his_password_infoclinica: Option<String>,
    login_email_infoclinica: Option<String>,
    primary_source: String,
    registered_via_mobile: i32,
    matching_locked: i32,
    locked_at: Option<String>,
    lock_reason: Option<String>,
    created_at: String,
    updated_at: String,
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CanonicalRow> {
    Ok(CanonicalRow {
        canonical_id: row.get(0)?,
        doc_type: row.get(1)?,
        doc_number: row.get(2)?,
        last_name: row.get(3)?,
        first_name: row.get(4)?,
        middle_name: row.get(5)?,
        birth_date: row.get(6)?,
        his_number_qms: row.get(7)?,
        email_qms: row.get(8)?,
        phone_qms: row.get(9)?,
        his_password_qms: row.get(10)?,
        login_email_qms: row.get(11)?,
        his_number_infoclinica: row.get(12)?,
        email_infoclinica: row.get(13)?,
        phone_infoclinica: row.get(14)?,
        his_password_infoclinica: row.get(15)?,
        login_email_infoclinica: row.get(16)?,
        primary_source: row.get(17)?,
        registered_via_mobile: row.get(18)?,
        matching_locked: row.get(19)?,
        locked_at: row.get(20)?,
        lock_reason: row.get(21)?,
        created_at: row.get(22)?,
        updated_at: row.get(23)?,
    })
}

fn canonical_from_row(row: CanonicalRow) -> Result<CanonicalPatient, DatabaseError> {
    Ok(CanonicalPatient {
        canonical_id: Uuid::parse_str(&row.canonical_id)
            .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?,
        doc_type: row.doc_type,
        doc_number: row.doc_number,
        last_name: row.last_name,
        first_name: row.first_name,
        middle_name: row.middle_name,
        birth_date: row
            .birth_date
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        qms: SourceSlot {
            his_number: row.his_number_qms,
            email: row.email_qms,
            phone: row.phone_qms,
            his_password: row.his_password_qms,
            login_email: row.login_email_qms,
        },
        infoclinica: SourceSlot {
            his_number: row.his_number_infoclinica,
            email: row.email_infoclinica,
            phone: row.phone_infoclinica,
            his_password: row.his_password_infoclinica,
            login_email: row.login_email_infoclinica,
        },
        primary_source: Source::from_str(&row.primary_source)?,
        registered_via_mobile: row.registered_via_mobile != 0,
        matching_locked: row.matching_locked != 0,
        locked_at: row.locked_at.map(|t| parse_dt(&t)),
        lock_reason: row.lock_reason,
        created_at: parse_dt(&row.created_at),
        updated_at: parse_dt(&row.updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use chrono::NaiveDateTime;

    fn now() -> NaiveDateTime {
        parse_dt("2026-03-01 12:00:00")
    }

    fn sample(source: Source, his: &str) -> CanonicalPatient {
        let mut c = CanonicalPatient::new(Uuid::new_v4(), source, now());
        c.slot_mut(source).his_number = Some(his.into());
        c.last_name = Some("Ivanova".into());
        c
    }

    #[test]
    fn insert_get_round_trip() {
        let conn = open_memory_database().unwrap();
        let mut c = sample(Source::Qms, "Q1");
        c.doc_type = Some(1);
        c.doc_number = Some(1000);
        insert_canonical(&conn, &c).unwrap();

        let got = get_canonical(&conn, &c.canonical_id).unwrap().unwrap();
        assert_eq!(got.canonical_id, c.canonical_id);
        assert_eq!(got.qms.his_number.as_deref(), Some("Q1"));
        assert_eq!(got.document(), Some((1, 1000)));
        assert_eq!(got.primary_source, Source::Qms);
    }

    #[test]
    fn find_by_source_his_respects_source_column() {
        let conn = open_memory_database().unwrap();
        insert_canonical(&conn, &sample(Source::Qms, "N1")).unwrap();

        assert!(find_canonical_by_source_his(&conn, Source::Qms, "N1")
            .unwrap()
            .is_some());
        assert!(find_canonical_by_source_his(&conn, Source::Infoclinica, "N1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn locked_canonical_invisible_to_lookups() {
        let conn = open_memory_database().unwrap();
        let mut c = sample(Source::Qms, "Q2");
        c.doc_type = Some(1);
        c.doc_number = Some(2000);
        c.matching_locked = true;
        insert_canonical(&conn, &c).unwrap();

        assert!(find_canonical_by_source_his(&conn, Source::Qms, "Q2")
            .unwrap()
            .is_none());
        assert!(find_canonical_by_document(&conn, 1, 2000, None)
            .unwrap()
            .is_none());
        // Direct get still sees it
        assert!(get_canonical(&conn, &c.canonical_id).unwrap().is_some());
    }

    #[test]
    fn find_by_document_excludes_given_canonical() {
        let conn = open_memory_database().unwrap();
        let mut c = sample(Source::Qms, "Q3");
        c.doc_type = Some(1);
        c.doc_number = Some(3000);
        insert_canonical(&conn, &c).unwrap();

        assert!(find_canonical_by_document(&conn, 1, 3000, Some(&c.canonical_id))
            .unwrap()
            .is_none());
        assert!(find_canonical_by_document(&conn, 1, 3000, None)
            .unwrap()
            .is_some());
    }

    #[test]
    fn duplicate_his_number_rejected_per_source() {
        let conn = open_memory_database().unwrap();
        insert_canonical(&conn, &sample(Source::Qms, "DUP")).unwrap();
        let err = insert_canonical(&conn, &sample(Source::Qms, "DUP")).unwrap_err();
        assert!(err.is_unique_violation());
        // Same number under the other source is fine
        insert_canonical(&conn, &sample(Source::Infoclinica, "DUP")).unwrap();
    }

    #[test]
    fn duplicate_document_rejected_among_unlocked() {
        let conn = open_memory_database().unwrap();
        let mut a = sample(Source::Qms, "A1");
        a.doc_type = Some(1);
        a.doc_number = Some(5000);
        insert_canonical(&conn, &a).unwrap();

        let mut b = sample(Source::Infoclinica, "B1");
        b.doc_type = Some(1);
        b.doc_number = Some(5000);
        let err = insert_canonical(&conn, &b).unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn duplicate_document_allowed_when_existing_is_locked() {
        let conn = open_memory_database().unwrap();
        let mut a = sample(Source::Qms, "A2");
        a.doc_type = Some(1);
        a.doc_number = Some(6000);
        a.matching_locked = true;
        insert_canonical(&conn, &a).unwrap();

        let mut b = sample(Source::Infoclinica, "B2");
        b.doc_type = Some(1);
        b.doc_number = Some(6000);
        insert_canonical(&conn, &b).unwrap();
    }

    #[test]
    fn update_writes_all_mutable_fields() {
        let conn = open_memory_database().unwrap();
        let mut c = sample(Source::Qms, "Q4");
        insert_canonical(&conn, &c).unwrap();

        c.first_name = Some("Anna".into());
        c.infoclinica.his_number = Some("I4".into());
        c.registered_via_mobile = true;
        update_canonical(&conn, &c).unwrap();

        let got = get_canonical(&conn, &c.canonical_id).unwrap().unwrap();
        assert_eq!(got.first_name.as_deref(), Some("Anna"));
        assert_eq!(got.infoclinica.his_number.as_deref(), Some("I4"));
        assert!(got.registered_via_mobile);
    }

    #[test]
    fn delete_missing_reports_not_found() {
        let conn = open_memory_database().unwrap();
        let err = delete_canonical(&conn, &Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }
}
