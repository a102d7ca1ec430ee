//! Mutator — applies a matching decision to the canonical store.
//!
//! Every public entry point here runs inside the caller's transaction; the
//! orchestrator commits or rolls back as a whole. Overwrite policy:
//! fill-if-empty on adoption and merge carryover, unconditional overwrite on
//! a source's own regular update.

use chrono::NaiveDateTime;
use rusqlite::Connection;
use uuid::Uuid;

use super::rules::Decision;
use super::{EngineError, ReconcileEvent};
use crate::db::repository;
use crate::db::DatabaseError;
use crate::models::{
    CanonicalPatient, MatchDetails, MatchType, NewMatchLogEntry, RawPatient, Source, SourceSlot,
};

/// What the mutator did, for the orchestrator's result and counters.
#[derive(Debug, Clone)]
pub struct Applied {
    pub match_type: MatchType,
    pub canonical_id: Uuid,
    pub created_new_canonical: bool,
    pub changed_fields: Vec<String>,
}

pub fn apply(
    conn: &Connection,
    event: &ReconcileEvent,
    decision: &Decision,
    now: NaiveDateTime,
) -> Result<Applied, EngineError> {
    let raw = event.raw();
    match decision {
        Decision::Create { match_type } => create(conn, raw, *match_type, None, now),
        Decision::UseExisting { canonical_id, match_type } => match match_type {
            MatchType::MobileAppNew => create(conn, raw, *match_type, Some(*canonical_id), now),
            MatchType::RegularUpdate => regular_update(conn, raw, *canonical_id, now),
            _ => adopt_existing(conn, raw, *canonical_id, *match_type, now),
        },
        Decision::Merge { winner, loser } => merge(conn, raw, *winner, *loser, now),
        Decision::LockedSkip { canonical_id } => locked_skip(conn, raw, *canonical_id, now),
    }
}

/// CREATE and MOBILE_APP_NEW: insert a canonical seeded from the raw record.
/// A reserved id means the canonical materializes a mobile pre-registration.
fn create(
    conn: &Connection,
    raw: &RawPatient,
    match_type: MatchType,
    reserved_id: Option<Uuid>,
    now: NaiveDateTime,
) -> Result<Applied, EngineError> {
    let canonical_id = reserved_id.unwrap_or_else(Uuid::new_v4);
    let mut canonical = CanonicalPatient::new(canonical_id, raw.source, now);
    *canonical.slot_mut(raw.source) = slot_from_raw(raw);
    canonical.last_name = raw.last_name.clone();
    canonical.first_name = raw.first_name.clone();
    canonical.middle_name = raw.middle_name.clone();
    canonical.birth_date = raw.birth_date;
    canonical.doc_type = raw.doc_type;
    canonical.doc_number = raw.doc_number;
    canonical.registered_via_mobile = reserved_id.is_some();

    repository::insert_canonical(conn, &canonical)?;
    repository::stamp_raw(conn, raw.raw_id, &canonical_id, now)?;
    append_log(
        conn,
        raw,
        match_type,
        true,
        reserved_id,
        Some(canonical_id),
        MatchDetails {
            is_mobile_match: reserved_id.is_some(),
            has_document: raw.document().is_some(),
            ..MatchDetails::default()
        },
        now,
    )?;

    tracing::info!(
        canonical_id = %canonical_id,
        source = raw.source.as_str(),
        his_number = %raw.his_number,
        match_type = match_type.as_str(),
        "Created canonical patient"
    );

    Ok(Applied {
        match_type,
        canonical_id,
        created_new_canonical: true,
        changed_fields: Vec::new(),
    })
}

/// Insertion-path adoption (UPDATED_EXISTING, MATCHED_DOCUMENT,
/// MOBILE_APP_UPDATE): the raw's slot is authoritative, demographics and
/// document fill only where the canonical is empty.
fn adopt_existing(
    conn: &Connection,
    raw: &RawPatient,
    canonical_id: Uuid,
    match_type: MatchType,
    now: NaiveDateTime,
) -> Result<Applied, EngineError> {
    let mut canonical = load(conn, &canonical_id)?;
    let mut changed = Vec::new();

    set_slot(&mut canonical, raw, &mut changed);
    fill_demographics(
        &mut canonical,
        &raw.last_name,
        &raw.first_name,
        &raw.middle_name,
        &raw.birth_date,
        &mut changed,
    );
    if canonical.document().is_none() {
        if let Some((doc_type, doc_number)) = raw.document() {
            canonical.doc_type = Some(doc_type);
            canonical.doc_number = Some(doc_number);
            changed.push("document".into());
        }
    }

    if !changed.is_empty() {
        canonical.updated_at = now;
    }
    repository::update_canonical(conn, &canonical)?;
    repository::stamp_raw(conn, raw.raw_id, &canonical_id, now)?;

    let is_mobile = match_type == MatchType::MobileAppUpdate;
    append_log(
        conn,
        raw,
        match_type,
        false,
        is_mobile.then_some(canonical_id),
        Some(canonical_id),
        MatchDetails {
            is_mobile_match: is_mobile,
            has_document: raw.document().is_some(),
            changed_fields: changed.clone(),
            ..MatchDetails::default()
        },
        now,
    )?;

    Ok(Applied {
        match_type,
        canonical_id,
        created_new_canonical: false,
        changed_fields: changed,
    })
}

/// REGULAR_UPDATE: the raw record came from the canonical's own source, so
/// it overwrites slot, demographics and document unconditionally. The only
/// overwrite path in the engine.
fn regular_update(
    conn: &Connection,
    raw: &RawPatient,
    canonical_id: Uuid,
    now: NaiveDateTime,
) -> Result<Applied, EngineError> {
    let mut canonical = load(conn, &canonical_id)?;
    let mut changed = Vec::new();

    set_slot(&mut canonical, raw, &mut changed);
    overwrite_field(&mut canonical.last_name, &raw.last_name, "last_name", &mut changed);
    overwrite_field(&mut canonical.first_name, &raw.first_name, "first_name", &mut changed);
    overwrite_field(&mut canonical.middle_name, &raw.middle_name, "middle_name", &mut changed);
    overwrite_field(&mut canonical.birth_date, &raw.birth_date, "birth_date", &mut changed);
    if (canonical.doc_type, canonical.doc_number) != (raw.doc_type, raw.doc_number) {
        canonical.doc_type = raw.doc_type;
        canonical.doc_number = raw.doc_number;
        changed.push("document".into());
    }

    // An empty diff must leave the canonical untouched — replay idempotence
    // is observable through updated_at.
    if !changed.is_empty() {
        canonical.updated_at = now;
        repository::update_canonical(conn, &canonical)?;
    }
    repository::stamp_raw(conn, raw.raw_id, &canonical_id, now)?;

    append_log(
        conn,
        raw,
        MatchType::RegularUpdate,
        false,
        None,
        Some(canonical_id),
        MatchDetails {
            is_mobile_match: false,
            has_document: raw.document().is_some(),
            changed_fields: changed.clone(),
            ..MatchDetails::default()
        },
        now,
    )?;

    Ok(Applied {
        match_type: MatchType::RegularUpdate,
        canonical_id,
        created_new_canonical: false,
        changed_fields: changed,
    })
}

/// MERGED_ON_UPDATE: fold the loser into the winner, redirect every
/// registered referrer, delete the loser, stamp the triggering raw last.
fn merge(
    conn: &Connection,
    raw: &RawPatient,
    winner_id: Uuid,
    loser_id: Uuid,
    now: NaiveDateTime,
) -> Result<Applied, EngineError> {
    let mut winner = load(conn, &winner_id)?;
    let loser = load(conn, &loser_id)?;
    let mut changed = Vec::new();

    // The triggering raw is authoritative for its own source slot.
    set_slot(&mut winner, raw, &mut changed);

    // Carry the loser's remaining slots over where the winner has none.
    for source in Source::ALL {
        if source == raw.source {
            continue;
        }
        if winner.slot(source).is_empty() && !loser.slot(source).is_empty() {
            *winner.slot_mut(source) = loser.slot(source).clone();
            changed.push(format!("slot_{}", source.as_str()));
        }
    }

    fill_demographics(
        &mut winner,
        &loser.last_name,
        &loser.first_name,
        &loser.middle_name,
        &loser.birth_date,
        &mut changed,
    );
    if winner.document().is_none() {
        let carried = raw.document().or_else(|| loser.document());
        if let Some((doc_type, doc_number)) = carried {
            winner.doc_type = Some(doc_type);
            winner.doc_number = Some(doc_number);
            changed.push("document".into());
        }
    }
    if loser.registered_via_mobile && !winner.registered_via_mobile {
        winner.registered_via_mobile = true;
        changed.push("registered_via_mobile".into());
    }
    winner.updated_at = now;

    // Referrers first, loser second, winner third: the loser's row must be
    // gone before its unique slot and document values land on the winner.
    let redirected = repository::rewrite_canonical_references(conn, &loser_id, &winner_id)?;
    repository::delete_canonical(conn, &loser_id)?;
    repository::update_canonical(conn, &winner)?;
    repository::stamp_raw(conn, raw.raw_id, &winner_id, now)?;

    append_log(
        conn,
        raw,
        MatchType::MergedOnUpdate,
        false,
        None,
        Some(winner_id),
        MatchDetails {
            is_mobile_match: false,
            has_document: raw.document().is_some(),
            winner_canonical_id: Some(winner_id),
            loser_canonical_id: Some(loser_id),
            changed_fields: changed.clone(),
        },
        now,
    )?;

    tracing::info!(
        winner = %winner_id,
        loser = %loser_id,
        redirected,
        "Merged canonical patients"
    );

    Ok(Applied {
        match_type: MatchType::MergedOnUpdate,
        canonical_id: winner_id,
        created_new_canonical: false,
        changed_fields: changed,
    })
}

/// LOCKED_SKIP: record that the engine saw this raw state and nothing else.
fn locked_skip(
    conn: &Connection,
    raw: &RawPatient,
    canonical_id: Uuid,
    now: NaiveDateTime,
) -> Result<Applied, EngineError> {
    repository::stamp_processed(conn, raw.raw_id, now)?;
    append_log(
        conn,
        raw,
        MatchType::LockedSkip,
        false,
        None,
        Some(canonical_id),
        MatchDetails {
            is_mobile_match: false,
            has_document: raw.document().is_some(),
            ..MatchDetails::default()
        },
        now,
    )?;

    Ok(Applied {
        match_type: MatchType::LockedSkip,
        canonical_id,
        created_new_canonical: false,
        changed_fields: Vec::new(),
    })
}

/// Operator-initiated merge with an explicit winner. Same fold as the
/// automatic path, but with no triggering raw every slot carries over
/// fill-if-empty.
pub(crate) fn merge_manual(
    conn: &Connection,
    winner_id: Uuid,
    loser_id: Uuid,
    now: NaiveDateTime,
) -> Result<Applied, EngineError> {
    let mut winner = load(conn, &winner_id)?;
    let loser = load(conn, &loser_id)?;
    let mut changed = Vec::new();

    for source in Source::ALL {
        if winner.slot(source).is_empty() && !loser.slot(source).is_empty() {
            *winner.slot_mut(source) = loser.slot(source).clone();
            changed.push(format!("slot_{}", source.as_str()));
        }
    }
    fill_demographics(
        &mut winner,
        &loser.last_name,
        &loser.first_name,
        &loser.middle_name,
        &loser.birth_date,
        &mut changed,
    );
    if winner.document().is_none() {
        if let Some((doc_type, doc_number)) = loser.document() {
            winner.doc_type = Some(doc_type);
            winner.doc_number = Some(doc_number);
            changed.push("document".into());
        }
    }
    if loser.registered_via_mobile && !winner.registered_via_mobile {
        winner.registered_via_mobile = true;
        changed.push("registered_via_mobile".into());
    }
    winner.updated_at = now;

    let redirected = repository::rewrite_canonical_references(conn, &loser_id, &winner_id)?;
    repository::delete_canonical(conn, &loser_id)?;
    repository::update_canonical(conn, &winner)?;

    repository::append_match_log(
        conn,
        &NewMatchLogEntry {
            his_number: format!("merge:{loser_id}->{winner_id}"),
            source: winner.primary_source,
            match_type: MatchType::ManualMerge,
            doc_number: winner.doc_number,
            created_new_canonical: false,
            mobile_prereg_canonical_id: None,
            resulting_canonical_id: Some(winner_id),
            details: MatchDetails {
                is_mobile_match: false,
                has_document: winner.document().is_some(),
                winner_canonical_id: Some(winner_id),
                loser_canonical_id: Some(loser_id),
                changed_fields: changed.clone(),
            },
        },
        now,
    )?;

    tracing::info!(winner = %winner_id, loser = %loser_id, redirected, "Manually merged canonical patients");

    Ok(Applied {
        match_type: MatchType::ManualMerge,
        canonical_id: winner_id,
        created_new_canonical: false,
        changed_fields: changed,
    })
}

// ── helpers ─────────────────────────────────────────────────

fn load(conn: &Connection, id: &Uuid) -> Result<CanonicalPatient, EngineError> {
    repository::get_canonical(conn, id)?.ok_or_else(|| {
        EngineError::Storage(DatabaseError::NotFound {
            entity_type: "CanonicalPatient".into(),
            id: id.to_string(),
        })
    })
}

fn slot_from_raw(raw: &RawPatient) -> SourceSlot {
    SourceSlot {
        his_number: Some(raw.his_number.clone()),
        email: raw.email.clone(),
        phone: raw.phone.clone(),
        his_password: raw.his_password.clone(),
        login_email: raw.login_email.clone(),
    }
}

fn set_slot(canonical: &mut CanonicalPatient, raw: &RawPatient, changed: &mut Vec<String>) {
    let slot = slot_from_raw(raw);
    if *canonical.slot(raw.source) != slot {
        *canonical.slot_mut(raw.source) = slot;
        changed.push(format!("slot_{}", raw.source.as_str()));
    }
}

fn fill_demographics(
    canonical: &mut CanonicalPatient,
    last_name: &Option<String>,
    first_name: &Option<String>,
    middle_name: &Option<String>,
    birth_date: &Option<chrono::NaiveDate>,
    changed: &mut Vec<String>,
) {
    fill_field(&mut canonical.last_name, last_name, "last_name", changed);
    fill_field(&mut canonical.first_name, first_name, "first_name", changed);
    fill_field(&mut canonical.middle_name, middle_name, "middle_name", changed);
    fill_field(&mut canonical.birth_date, birth_date, "birth_date", changed);
}

fn fill_field<T: Clone + PartialEq>(
    dst: &mut Option<T>,
    src: &Option<T>,
    name: &str,
    changed: &mut Vec<String>,
) {
    if dst.is_none() && src.is_some() {
        *dst = src.clone();
        changed.push(name.into());
    }
}

fn overwrite_field<T: Clone + PartialEq>(
    dst: &mut Option<T>,
    src: &Option<T>,
    name: &str,
    changed: &mut Vec<String>,
) {
    if dst != src {
        *dst = src.clone();
        changed.push(name.into());
    }
}

#[allow(clippy::too_many_arguments)]
fn append_log(
    conn: &Connection,
    raw: &RawPatient,
    match_type: MatchType,
    created_new_canonical: bool,
    mobile_prereg_canonical_id: Option<Uuid>,
    resulting_canonical_id: Option<Uuid>,
    details: MatchDetails,
    now: NaiveDateTime,
) -> Result<(), EngineError> {
    repository::append_match_log(
        conn,
        &NewMatchLogEntry {
            his_number: raw.his_number.clone(),
            source: raw.source,
            match_type,
            doc_number: raw.doc_number,
            created_new_canonical,
            mobile_prereg_canonical_id,
            resulting_canonical_id,
            details,
        },
        now,
    )?;
    Ok(())
}
