use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::Source;

/// One HIS system's column group on a canonical patient.
///
/// A slot is either entirely empty or carries at least `his_number`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSlot {
    pub his_number: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub his_password: Option<String>,
    pub login_email: Option<String>,
}

impl SourceSlot {
    pub fn is_empty(&self) -> bool {
        self.his_number.is_none()
    }
}

/// The single consolidated record for one real person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalPatient {
    pub canonical_id: Uuid,
    pub doc_type: Option<i32>,
    pub doc_number: Option<i64>,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub qms: SourceSlot,
    pub infoclinica: SourceSlot,
    pub primary_source: Source,
    pub registered_via_mobile: bool,
    pub matching_locked: bool,
    pub locked_at: Option<NaiveDateTime>,
    pub lock_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl CanonicalPatient {
    /// An empty canonical shell with the given id and origin source.
    pub fn new(canonical_id: Uuid, primary_source: Source, now: NaiveDateTime) -> Self {
        Self {
            canonical_id,
            doc_type: None,
            doc_number: None,
            last_name: None,
            first_name: None,
            middle_name: None,
            birth_date: None,
            qms: SourceSlot::default(),
            infoclinica: SourceSlot::default(),
            primary_source,
            registered_via_mobile: false,
            matching_locked: false,
            locked_at: None,
            lock_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn slot(&self, source: Source) -> &SourceSlot {
        match source {
            Source::Qms => &self.qms,
            Source::Infoclinica => &self.infoclinica,
        }
    }

    pub fn slot_mut(&mut self, source: Source) -> &mut SourceSlot {
        match source {
            Source::Qms => &mut self.qms,
            Source::Infoclinica => &mut self.infoclinica,
        }
    }

    /// Document pair when both halves are present.
    pub fn document(&self) -> Option<(i32, i64)> {
        match (self.doc_type, self.doc_number) {
            (Some(t), Some(n)) => Some((t, n)),
            _ => None,
        }
    }
}
