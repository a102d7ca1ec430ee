use std::str::FromStr;

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::{BusinessUnit, Source};

/// A downstream medical event attached to a canonical patient. The engine
/// never interprets protocols; they matter because merges must carry their
/// canonical references over to the winning side.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Protocol {
    pub protocol_id: i64,
    pub canonical_id: Uuid,
    pub source: Source,
    pub business_unit: Option<BusinessUnit>,
    pub protocol_date: Option<NaiveDate>,
    pub doctor: Option<String>,
    pub protocol_name: Option<String>,
    pub service_name: Option<String>,
    pub service_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewProtocol {
    pub canonical_id: Uuid,
    pub source: Source,
    pub business_unit: Option<BusinessUnit>,
    pub protocol_date: Option<NaiveDate>,
    pub doctor: Option<String>,
    pub protocol_name: Option<String>,
    pub service_name: Option<String>,
    pub service_code: Option<String>,
}

pub fn insert_protocol(conn: &Connection, p: &NewProtocol) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO protocols (canonical_id, source, business_unit, protocol_date, doctor,
         protocol_name, service_name, service_code)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            p.canonical_id.to_string(),
            p.source.as_str(),
            p.business_unit.map(|b| b.as_str()),
            p.protocol_date.map(|d| d.to_string()),
            p.doctor,
            p.protocol_name,
            p.service_name,
            p.service_code,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// A patient's protocols, most recent date first.
pub fn protocols_for_canonical(
    conn: &Connection,
    canonical_id: &Uuid,
) -> Result<Vec<Protocol>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT protocol_id, canonical_id, source, business_unit, protocol_date, doctor,
                protocol_name, service_name, service_code
         FROM protocols WHERE canonical_id = ?1 ORDER BY protocol_date DESC, protocol_id DESC",
    )?;
    let rows = stmt.query_map(params![canonical_id.to_string()], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, Option<String>>(8)?,
        ))
    })?;

    let mut protocols = Vec::new();
    for row in rows {
        let (protocol_id, canonical_id, source, business_unit, protocol_date, doctor,
            protocol_name, service_name, service_code) = row?;
        protocols.push(Protocol {
            protocol_id,
            canonical_id: Uuid::parse_str(&canonical_id)
                .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?,
            source: Source::from_str(&source)?,
            business_unit: business_unit
                .as_deref()
                .map(BusinessUnit::from_str)
                .transpose()?,
            protocol_date: protocol_date
                .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
            doctor,
            protocol_name,
            service_name,
            service_code,
        });
    }
    Ok(protocols)
}

pub fn count_protocols(conn: &Connection, canonical_id: &Uuid) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM protocols WHERE canonical_id = ?1",
        params![canonical_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count)
}
