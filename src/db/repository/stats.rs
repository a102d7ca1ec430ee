//! Administrative read views over the registry.
//!
//! Everything here is read-only and serializable; the numbers come straight
//! from SQL so they cannot drift from the stored state.

use chrono::NaiveDateTime;
use rusqlite::Connection;

use super::parse_dt;
use crate::db::DatabaseError;

/// Counts by match type plus per-source consolidation figures.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MatchingStats {
    pub total_canonicals: i64,
    pub by_match_type: Vec<MatchTypeCount>,
    pub by_source: Vec<SourceCount>,
    /// Canonicals carrying HIS numbers from more than one source.
    pub multi_source_canonicals: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MatchTypeCount {
    pub match_type: String,
    pub count: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceCount {
    pub source: String,
    pub record_count: i64,
    pub patient_count: i64,
}

pub fn matching_stats(conn: &Connection) -> Result<MatchingStats, DatabaseError> {
    let total_canonicals: i64 =
        conn.query_row("SELECT COUNT(*) FROM canonical", [], |row| row.get(0))?;

    let mut stmt = conn.prepare(
        "SELECT match_type, COUNT(*) FROM match_log GROUP BY match_type ORDER BY match_type",
    )?;
    let by_match_type = stmt
        .query_map([], |row| {
            Ok(MatchTypeCount {
                match_type: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT source, COUNT(*), COUNT(DISTINCT canonical_id)
         FROM raw_patient GROUP BY source ORDER BY source",
    )?;
    let by_source = stmt
        .query_map([], |row| {
            Ok(SourceCount {
                source: row.get(0)?,
                record_count: row.get(1)?,
                patient_count: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let multi_source_canonicals: i64 = conn.query_row(
        "SELECT COUNT(*) FROM canonical
         WHERE his_number_qms IS NOT NULL AND his_number_infoclinica IS NOT NULL",
        [],
        |row| row.get(0),
    )?;

    Ok(MatchingStats {
        total_canonicals,
        by_match_type,
        by_source,
        multi_source_canonicals,
    })
}

/// Mobile onboarding figures: reservations made, adopted, still waiting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MobileAppStats {
    pub preregs_total: i64,
    pub preregs_adopted: i64,
    pub preregs_pending: i64,
    pub mobile_registered_canonicals: i64,
}

pub fn mobile_app_stats(conn: &Connection) -> Result<MobileAppStats, DatabaseError> {
    let preregs_total: i64 =
        conn.query_row("SELECT COUNT(*) FROM mobile_prereg", [], |row| row.get(0))?;
    let preregs_adopted: i64 = conn.query_row(
        "SELECT COUNT(*) FROM mobile_prereg mp
         WHERE EXISTS (SELECT 1 FROM canonical c WHERE c.canonical_id = mp.canonical_id)",
        [],
        |row| row.get(0),
    )?;
    let mobile_registered_canonicals: i64 = conn.query_row(
        "SELECT COUNT(*) FROM canonical WHERE registered_via_mobile = 1",
        [],
        |row| row.get(0),
    )?;

    Ok(MobileAppStats {
        preregs_total,
        preregs_adopted,
        preregs_pending: preregs_total - preregs_adopted,
        mobile_registered_canonicals,
    })
}

/// Storage-side half of the engine health view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BacklogStats {
    pub backlog: i64,
    pub dead_letters: i64,
    pub last_processed_at: Option<NaiveDateTime>,
}

pub fn backlog_stats(conn: &Connection) -> Result<BacklogStats, DatabaseError> {
    let backlog: i64 = conn.query_row(
        "SELECT COUNT(*) FROM raw_patient WHERE processed_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    let dead_letters: i64 =
        conn.query_row("SELECT COUNT(*) FROM dead_letter", [], |row| row.get(0))?;
    let last: Option<String> = conn.query_row(
        "SELECT MAX(processed_at) FROM raw_patient",
        [],
        |row| row.get(0),
    )?;

    Ok(BacklogStats {
        backlog,
        dead_letters,
        last_processed_at: last.map(|t| parse_dt(&t)),
    })
}

/// A group of canonicals sharing one identity key — duplicates an operator
/// should review. Possible only across the locked boundary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DuplicateGroup {
    pub key: String,
    pub canonical_ids: Vec<String>,
}

/// Canonicals sharing a document pair.
pub fn duplicate_documents(conn: &Connection) -> Result<Vec<DuplicateGroup>, DatabaseError> {
    collect_groups(
        conn,
        "SELECT doc_type || '/' || doc_number, GROUP_CONCAT(canonical_id)
         FROM canonical
         WHERE doc_type IS NOT NULL AND doc_number IS NOT NULL
         GROUP BY doc_type, doc_number
         HAVING COUNT(*) > 1
         ORDER BY COUNT(*) DESC",
    )
}

/// Canonicals sharing full name (including patronymic) and birth date —
/// candidates for manual review, never merged automatically. Records with
/// no patronymic group together.
pub fn duplicate_names(conn: &Connection) -> Result<Vec<DuplicateGroup>, DatabaseError> {
    collect_groups(
        conn,
        "SELECT last_name || ' ' || first_name || ' ' || COALESCE(middle_name, '') || ' '
                || birth_date, GROUP_CONCAT(canonical_id)
         FROM canonical
         WHERE last_name IS NOT NULL AND first_name IS NOT NULL AND birth_date IS NOT NULL
         GROUP BY last_name, first_name, middle_name, birth_date
         HAVING COUNT(*) > 1
         ORDER BY COUNT(*) DESC",
    )
}

fn collect_groups(conn: &Connection, sql: &str) -> Result<Vec<DuplicateGroup>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let groups = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(key, ids)| DuplicateGroup {
            key,
            canonical_ids: ids.split(',').map(str::to_string).collect(),
        })
        .collect();
    Ok(groups)
}
