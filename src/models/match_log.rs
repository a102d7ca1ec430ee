use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{MatchType, Source};

/// Structured payload on every audit entry. For merges it additionally
/// records both sides; `changed_fields` makes an empty-diff replay visible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchDetails {
    pub is_mobile_match: bool,
    pub has_document: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_canonical_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loser_canonical_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
}

/// One append-only audit record of a matching decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchLogEntry {
    pub entry_id: i64,
    pub his_number: String,
    pub source: Source,
    pub timestamp: NaiveDateTime,
    pub match_type: MatchType,
    pub doc_number: Option<i64>,
    pub created_new_canonical: bool,
    pub mobile_prereg_canonical_id: Option<Uuid>,
    pub resulting_canonical_id: Option<Uuid>,
    pub details: MatchDetails,
}

/// Audit entry before it is assigned an id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMatchLogEntry {
    pub his_number: String,
    pub source: Source,
    pub match_type: MatchType,
    pub doc_number: Option<i64>,
    pub created_new_canonical: bool,
    pub mobile_prereg_canonical_id: Option<Uuid>,
    pub resulting_canonical_id: Option<Uuid>,
    pub details: MatchDetails,
}
