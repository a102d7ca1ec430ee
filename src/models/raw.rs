use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

use super::enums::{BusinessUnit, Source};

/// A per-source patient snapshot delivered by an adapter.
///
/// Immutable once stamped; a re-emitted snapshot with changed fields becomes
/// an update event for the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPatient {
    pub raw_id: i64,
    pub his_number: String,
    pub source: Source,
    pub business_unit: Option<BusinessUnit>,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub doc_type: Option<i32>,
    pub doc_number: Option<i64>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub his_password: Option<String>,
    pub login_email: Option<String>,
    pub canonical_id: Option<Uuid>,
    pub processed_at: Option<NaiveDateTime>,
}

impl RawPatient {
    pub fn document(&self) -> Option<(i32, i64)> {
        match (self.doc_type, self.doc_number) {
            (Some(t), Some(n)) => Some((t, n)),
            _ => None,
        }
    }

    /// Schema invariants the ingest contract promises. A violation is fatal
    /// for the event (the record stays unstamped for triage).
    pub fn validate(&self) -> Result<(), String> {
        if self.his_number.trim().is_empty() {
            return Err("his_number must be non-empty".into());
        }
        if self.doc_type.is_some() != self.doc_number.is_some() {
            return Err("doc_type and doc_number must both be set or both be null".into());
        }
        Ok(())
    }
}

/// Ingest-side raw record: what an adapter is allowed to supply.
///
/// `canonical_id` and `processed_at` are engine-owned and absent here, so
/// an adapter cannot violate the "null on insert" contract. `birth_date`
/// and `doc_number` arrive in the source systems' wire formats and are
/// canonicalized by `normalize` on every ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRawPatient {
    pub his_number: String,
    pub source: Source,
    pub business_unit: Option<BusinessUnit>,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    /// ISO `YYYY-MM-DD` or the legacy `DD.MM.YYYY` export format.
    pub birth_date: Option<String>,
    pub doc_type: Option<i32>,
    /// Free-form HIS output; only the digits are significant.
    pub doc_number: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub his_password: Option<String>,
    pub login_email: Option<String>,
}

impl Default for NewRawPatient {
    fn default() -> Self {
        Self {
            his_number: String::new(),
            source: Source::Qms,
            business_unit: None,
            last_name: None,
            first_name: None,
            middle_name: None,
            birth_date: None,
            doc_type: None,
            doc_number: None,
            email: None,
            phone: None,
            his_password: None,
            login_email: None,
        }
    }
}

impl NewRawPatient {
    /// Canonicalize the wire-format fields: trim the HIS number, reduce the
    /// document number to its digits, convert `DD.MM.YYYY` birth dates to
    /// ISO. Runs on every ingest, before any validation.
    pub fn normalize(&mut self) {
        self.his_number = self.his_number.trim().to_string();
        self.birth_date = self
            .birth_date
            .as_deref()
            .and_then(parse_birth_date)
            .map(|d| d.to_string());
        self.doc_number = self
            .doc_number
            .as_deref()
            .and_then(parse_doc_number)
            .map(|n| n.to_string());
        // An unusable document number takes its type with it.
        if self.doc_number.is_none() {
            self.doc_type = None;
        }
    }

    /// A normalized copy, leaving the adapter's record untouched.
    pub fn normalized(&self) -> NewRawPatient {
        let mut record = self.clone();
        record.normalize();
        record
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.his_number.trim().is_empty() {
            return Err("his_number must be non-empty".into());
        }
        if self.doc_type.is_some() != self.doc_number.is_some() {
            return Err("doc_type and doc_number must both be set or both be null".into());
        }
        Ok(())
    }
}

/// Extract a document number from free-form HIS output.
///
/// Source systems deliver numbers with embedded spaces and punctuation
/// ("45 03 123456", "4503-123456"); only the digits are significant.
pub fn parse_doc_number(input: &str) -> Option<i64> {
    static NON_DIGITS: OnceLock<Regex> = OnceLock::new();
    let re = NON_DIGITS.get_or_init(|| Regex::new(r"\D").expect("static regex"));
    let digits = re.replace_all(input, "");
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok().filter(|n| *n > 0)
}

/// Parse a birth date in either ISO (`YYYY-MM-DD`) or the legacy HIS
/// export format (`DD.MM.YYYY`).
pub fn parse_birth_date(input: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(input, "%d.%m.%Y"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_number_strips_non_digits() {
        assert_eq!(parse_doc_number("45 03 123456"), Some(4503123456));
        assert_eq!(parse_doc_number("4503-123456"), Some(4503123456));
        assert_eq!(parse_doc_number("1000"), Some(1000));
    }

    #[test]
    fn doc_number_rejects_empty_and_zero() {
        assert_eq!(parse_doc_number("n/a"), None);
        assert_eq!(parse_doc_number(""), None);
        assert_eq!(parse_doc_number("0"), None);
    }

    #[test]
    fn birth_date_accepts_both_formats() {
        let expected = NaiveDate::from_ymd_opt(1985, 4, 12).unwrap();
        assert_eq!(parse_birth_date("1985-04-12"), Some(expected));
        assert_eq!(parse_birth_date("12.04.1985"), Some(expected));
        assert_eq!(parse_birth_date("12/04/1985"), None);
    }

    #[test]
    fn normalize_canonicalizes_wire_fields() {
        let mut raw = NewRawPatient {
            his_number: " Q1 ".into(),
            source: Source::Qms,
            birth_date: Some("12.04.1985".into()),
            doc_type: Some(1),
            doc_number: Some("45 03-123456".into()),
            ..NewRawPatient::default()
        };
        raw.normalize();
        assert_eq!(raw.his_number, "Q1");
        assert_eq!(raw.birth_date.as_deref(), Some("1985-04-12"));
        assert_eq!(raw.doc_number.as_deref(), Some("4503123456"));
        assert_eq!(raw.doc_type, Some(1));
    }

    #[test]
    fn normalize_drops_unusable_document_pair() {
        let mut raw = NewRawPatient {
            his_number: "Q2".into(),
            source: Source::Qms,
            doc_type: Some(1),
            doc_number: Some("n/a".into()),
            ..NewRawPatient::default()
        };
        raw.normalize();
        assert!(raw.doc_number.is_none());
        assert!(raw.doc_type.is_none());
        assert!(raw.validate().is_ok());
    }

    #[test]
    fn validate_rejects_half_document() {
        let raw = NewRawPatient {
            his_number: "Q1".into(),
            source: Source::Qms,
            doc_type: Some(1),
            ..NewRawPatient::default()
        };
        assert!(raw.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_his_number() {
        let raw = NewRawPatient {
            his_number: "  ".into(),
            source: Source::Infoclinica,
            ..NewRawPatient::default()
        };
        assert!(raw.validate().is_err());
    }

    #[test]
    fn validate_accepts_full_document() {
        let raw = NewRawPatient {
            his_number: "Q1".into(),
            source: Source::Qms,
            doc_type: Some(1),
            doc_number: Some("1000".into()),
            ..NewRawPatient::default()
        };
        assert!(raw.validate().is_ok());
    }
}
